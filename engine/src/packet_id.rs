//! PacketId send/receive counters (spec §4.1). The send side is a strictly
//! monotonic counter that refuses to wrap; the receive side is a sliding
//! bitmap window that classifies each incoming id as accept/replay/backtrack/
//! expire/invalid. Send-side overflow behaviour (reserve the all-ones value,
//! raise a wrap-warning flag at a configurable margin before that) is
//! grounded on `openvpn3`'s `test_pktid.cpp` (`pktid_32_bit_overrun_*`,
//! `pktid_32_bit_warn`).

use crate::error::ProtoError;
use crate::time::TimePoint;

/// Monotonic send-side counter. `wide` selects a 64-bit counter (data
/// channel only, negotiated via peer capability); control-channel long-form
/// ids are always 32-bit and never wide.
pub struct PacketIdSend {
    id: u64,
    wide: bool,
    warn_margin: u64,
    wrap_warning: bool,
}

impl PacketIdSend {
    pub fn new(wide: bool, warn_margin: u64) -> Self {
        PacketIdSend {
            id: 0,
            wide,
            warn_margin,
            wrap_warning: false,
        }
    }

    fn value_max(&self) -> u64 {
        if self.wide {
            u64::MAX
        } else {
            u32::MAX as u64
        }
    }

    /// Returns the next id, or `ProtoError::PacketIdWrap` if doing so would
    /// reach the reserved all-ones value for this counter's width.
    pub fn next(&mut self) -> Result<u64, ProtoError> {
        let allowed_max = self.value_max() - 1;
        let candidate = self.id + 1;
        if candidate > allowed_max {
            return Err(ProtoError::PacketIdWrap);
        }
        self.id = candidate;
        if candidate >= self.value_max().saturating_sub(self.warn_margin) {
            self.wrap_warning = true;
        }
        Ok(candidate)
    }

    pub fn wrap_warning(&self) -> bool {
        self.wrap_warning
    }
}

/// Control-channel long-form send counter: a 32-bit id paired with a fixed
/// epoch timestamp established at construction. Wire order is id then
/// epoch, both big-endian (§6.1).
pub struct LongPacketIdSend {
    inner: PacketIdSend,
    epoch: u32,
}

impl LongPacketIdSend {
    pub fn new(epoch: TimePoint, warn_margin: u64) -> Self {
        LongPacketIdSend {
            inner: PacketIdSend::new(false, warn_margin),
            epoch: epoch.as_secs() as u32,
        }
    }

    pub fn next(&mut self) -> Result<(u32, u32), ProtoError> {
        let id = self.inner.next()? as u32;
        Ok((id, self.epoch))
    }

    pub fn wrap_warning(&self) -> bool {
        self.inner.wrap_warning()
    }
}

/// Outcome of testing a received id against the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketIdStatus {
    Success,
    Replay,
    Backtrack,
    Expire,
    Invalid,
    TimeBacktrack,
}

/// Sliding-window replay filter (spec §4.1 "Receive"). `window` bits cover
/// the range `[highest_id - window + 1, highest_id]`; ids strictly above
/// `highest_id` slide the window forward. Long-form ids additionally carry
/// an epoch that must never regress.
pub struct PacketIdReceive {
    window: u32,
    long_form: bool,
    expire_secs: u32,
    highest_id: u64,
    epoch_base: u32,
    bitmap: Vec<u64>,
}

const WORD_BITS: u32 = 64;

impl PacketIdReceive {
    pub fn new(window: u32, long_form: bool, expire_secs: u32) -> Self {
        let words = ((window as usize) + 63) / 64;
        PacketIdReceive {
            window,
            long_form,
            expire_secs,
            highest_id: 0,
            epoch_base: 0,
            bitmap: vec![0u64; words.max(1)],
        }
    }

    fn bit_set(&self, offset: u64) -> bool {
        let word = (offset / WORD_BITS as u64) as usize;
        let bit = (offset % WORD_BITS as u64) as u32;
        self.bitmap.get(word).map(|w| w & (1 << bit) != 0).unwrap_or(false)
    }

    fn bit_set_mut(&mut self, offset: u64) {
        let word = (offset / WORD_BITS as u64) as usize;
        let bit = (offset % WORD_BITS as u64) as u32;
        if let Some(w) = self.bitmap.get_mut(word) {
            *w |= 1 << bit;
        }
    }

    fn bit_clear_mut(&mut self, offset: u64) {
        let word = (offset / WORD_BITS as u64) as usize;
        let bit = (offset % WORD_BITS as u64) as u32;
        if let Some(w) = self.bitmap.get_mut(word) {
            *w &= !(1 << bit);
        }
    }

    /// `epoch` is ignored for short-form windows. `commit` applies state
    /// changes on SUCCESS; `commit=false` only consults validity (used for
    /// ACK-only packets, which must not perturb replay state).
    pub fn test_add(
        &mut self,
        id: u64,
        epoch: u32,
        now: TimePoint,
        commit: bool,
    ) -> PacketIdStatus {
        if id == 0 {
            return PacketIdStatus::Invalid;
        }

        if self.long_form {
            if epoch < self.epoch_base {
                // A regression is only a TIME_BACKTRACK if we've already
                // accepted data under the current epoch base; otherwise
                // there's no prior-epoch state to have backtracked from.
                if self.highest_id > 0 {
                    return PacketIdStatus::TimeBacktrack;
                }
                return PacketIdStatus::Invalid;
            }
            if epoch > self.epoch_base {
                // A higher epoch resets the window: the peer has moved to a
                // new time base (e.g. a fresh control channel reset).
                if commit {
                    self.epoch_base = epoch;
                    self.highest_id = 0;
                    self.bitmap.iter_mut().for_each(|w| *w = 0);
                }
            }
            if self.expire_secs > 0 {
                let highest_secs = self.epoch_base as u64;
                let now_secs = now.as_secs();
                if now_secs.saturating_sub(highest_secs) > self.expire_secs as u64
                    && id + (self.window as u64) <= self.highest_id
                {
                    return PacketIdStatus::Expire;
                }
            }
        }

        if id > self.highest_id {
            if commit {
                let gap = id - self.highest_id;
                if gap >= self.window as u64 {
                    self.bitmap.iter_mut().for_each(|w| *w = 0);
                } else {
                    for offset in self.highest_id + 1..=id {
                        let rel = offset % self.window as u64;
                        self.bit_clear_mut(rel);
                    }
                }
                self.highest_id = id;
                self.bit_set_mut(id % self.window as u64);
            }
            return PacketIdStatus::Success;
        }

        let backtrack = self.highest_id - id;
        if backtrack >= self.window as u64 {
            return PacketIdStatus::Backtrack;
        }

        let rel = id % self.window as u64;
        if self.bit_set(rel) {
            return PacketIdStatus::Replay;
        }
        if commit {
            self.bit_set_mut(rel);
        }
        PacketIdStatus::Success
    }

    pub fn highest_id(&self) -> u64 {
        self.highest_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_counter_starts_at_one_and_increments() {
        let mut send = PacketIdSend::new(false, 1 << 24);
        assert_eq!(send.next().unwrap(), 1);
        assert_eq!(send.next().unwrap(), 2);
    }

    #[test]
    fn narrow_counter_wraps_one_below_all_ones() {
        let mut send = PacketIdSend::new(false, 1 << 24);
        send.id = 0xfffffffc;
        assert_eq!(send.next().unwrap(), 0xfffffffd);
        assert_eq!(send.next().unwrap(), 0xfffffffe);
        assert!(send.next().is_err());
    }

    #[test]
    fn wide_counter_crosses_32_bit_boundary_without_wrapping() {
        let mut send = PacketIdSend::new(true, 1 << 24);
        send.id = 0xfffffffd;
        assert_eq!(send.next().unwrap(), 0xfffffffe);
        assert_eq!(send.next().unwrap(), 0xffffffff);
        assert_eq!(send.next().unwrap(), 0x100000000);
        assert_eq!(send.next().unwrap(), 0x100000001);
    }

    #[test]
    fn wide_counter_wraps_one_below_64_bit_all_ones() {
        let mut send = PacketIdSend::new(true, 1 << 24);
        send.id = 0xfffffffffffffffc;
        assert_eq!(send.next().unwrap(), 0xfffffffffffffffd);
        assert_eq!(send.next().unwrap(), 0xfffffffffffffffe);
        assert!(send.next().is_err());
    }

    #[test]
    fn wrap_warning_fires_only_for_narrow_counters_near_the_margin() {
        let mut narrow = PacketIdSend::new(false, 1 << 24);
        narrow.id = 0xfefffffe;
        assert_eq!(narrow.next().unwrap(), 0xfeffffff);
        assert!(!narrow.wrap_warning());
        assert_eq!(narrow.next().unwrap(), 0xff000000);
        assert!(narrow.wrap_warning());

        let mut wide = PacketIdSend::new(true, 1 << 24);
        wide.id = 0xfefffffe;
        assert_eq!(wide.next().unwrap(), 0xfeffffff);
        assert_eq!(wide.next().unwrap(), 0xff000000);
        assert!(!wide.wrap_warning());
    }

    #[test]
    fn receive_accepts_every_id_exactly_once_in_any_order() {
        let mut recv = PacketIdReceive::new(64, false, 0);
        let now = TimePoint::ZERO;
        assert_eq!(recv.test_add(1, 0, now, true), PacketIdStatus::Success);
        assert_eq!(recv.test_add(1, 0, now, true), PacketIdStatus::Replay);
        assert_eq!(recv.test_add(2, 0, now, true), PacketIdStatus::Success);
        assert_eq!(recv.test_add(4, 0, now, true), PacketIdStatus::Success);
        assert_eq!(recv.test_add(1, 0, now, true), PacketIdStatus::Replay);
        assert_eq!(recv.test_add(3, 0, now, true), PacketIdStatus::Success);
    }

    #[test]
    fn zero_id_is_always_invalid() {
        let mut recv = PacketIdReceive::new(64, false, 0);
        assert_eq!(
            recv.test_add(0, 0, TimePoint::ZERO, true),
            PacketIdStatus::Invalid
        );
    }

    #[test]
    fn replay_window_edge_scenario_from_the_spec() {
        // Scenario 4: W=64, deliver id=100 then id=36: SUCCESS then BACKTRACK.
        let mut recv = PacketIdReceive::new(64, false, 0);
        let now = TimePoint::ZERO;
        assert_eq!(recv.test_add(100, 0, now, true), PacketIdStatus::Success);
        assert_eq!(recv.test_add(36, 0, now, true), PacketIdStatus::Backtrack);
    }

    #[test]
    fn non_commit_mode_does_not_perturb_state() {
        let mut recv = PacketIdReceive::new(64, false, 0);
        let now = TimePoint::ZERO;
        assert_eq!(recv.test_add(10, 0, now, false), PacketIdStatus::Success);
        // Since we didn't commit, id=10 is still fresh.
        assert_eq!(recv.test_add(10, 0, now, true), PacketIdStatus::Success);
        assert_eq!(recv.test_add(10, 0, now, true), PacketIdStatus::Replay);
    }

    #[test]
    fn long_form_rejects_epoch_regression() {
        let mut recv = PacketIdReceive::new(64, true, 0);
        let now = TimePoint::from_secs(100);
        assert_eq!(recv.test_add(1, 10, now, true), PacketIdStatus::Success);
        assert_eq!(
            recv.test_add(2, 9, now, true),
            PacketIdStatus::TimeBacktrack
        );
    }

    #[test]
    fn long_form_resets_window_on_epoch_advance() {
        let mut recv = PacketIdReceive::new(64, true, 0);
        let now = TimePoint::from_secs(100);
        assert_eq!(recv.test_add(5, 10, now, true), PacketIdStatus::Success);
        assert_eq!(recv.test_add(1, 11, now, true), PacketIdStatus::Success);
        // id=1 under the new epoch must not be a replay of the old epoch's state.
        assert_eq!(recv.test_add(1, 11, now, true), PacketIdStatus::Replay);
    }
}
