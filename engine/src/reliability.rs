//! Reliability layer: sliding-window send/receive for control-channel
//! messages, with ACKs and exponential-backoff retransmit (spec §4.2). The
//! wire layout for the ACK block itself lives in `packet.rs`
//! (`ControlPacket::acks`/`dst_psid`); this module only tracks scheduling
//! state.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::ProtoError;
use crate::time::TimePoint;

struct SendSlot {
    id: u32,
    payload: Vec<u8>,
    next_retransmit: TimePoint,
    timeout: Duration,
}

/// Fixed-capacity ring of unacknowledged outbound messages (spec §4.2
/// "Send side"). `N >= 4`, enforced by `ConfigBuilder::reliable_ring_size`.
pub struct ReliableSend {
    slots: Vec<Option<SendSlot>>,
    base_timeout: Duration,
    timeout_cap: Duration,
}

impl ReliableSend {
    pub fn new(capacity: usize, base_timeout: Duration, timeout_cap: Duration) -> Self {
        ReliableSend {
            slots: (0..capacity).map(|_| None).collect(),
            base_timeout,
            timeout_cap,
        }
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Places `payload` under `id` in a free slot, scheduling its first
    /// retransmit at `now + tls_timeout`.
    pub fn send(&mut self, id: u32, payload: Vec<u8>, now: TimePoint) -> Result<(), ProtoError> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(ProtoError::SendRingFull)?;
        *slot = Some(SendSlot {
            id,
            payload,
            next_retransmit: now + self.base_timeout,
            timeout: self.base_timeout,
        });
        Ok(())
    }

    /// Clears the slot holding `id`, if any. Returns whether a slot was
    /// cleared (a spurious ACK for an unknown id is simply ignored).
    pub fn ack(&mut self, id: u32) -> bool {
        for slot in &mut self.slots {
            if slot.as_ref().map(|s| s.id) == Some(id) {
                *slot = None;
                return true;
            }
        }
        false
    }

    /// Re-emits the payload of every slot whose retransmit deadline has
    /// passed, doubling that slot's timeout up to `timeout_cap`.
    pub fn retransmit(&mut self, now: TimePoint) -> Vec<(u32, Vec<u8>)> {
        let mut due = Vec::new();
        for slot in self.slots.iter_mut().flatten() {
            if slot.next_retransmit <= now {
                due.push((slot.id, slot.payload.clone()));
                slot.timeout = (slot.timeout * 2).min(self.timeout_cap);
                slot.next_retransmit = now + slot.timeout;
            }
        }
        due
    }

    /// Earliest non-empty wait until the next retransmit is due, if any
    /// slot is occupied.
    pub fn until_retransmit(&self, now: TimePoint) -> Option<Duration> {
        self.slots
            .iter()
            .flatten()
            .map(|s| s.next_retransmit.saturating_sub(now))
            .min()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveFlags {
    pub ack_to_sender: bool,
    pub in_window: bool,
}

/// Fixed-capacity reorder buffer keyed by message id (spec §4.2 "Receive
/// side"). Delivers strictly in `next_expected` order via
/// `next_sequenced`/`advance`.
pub struct ReliableRecv {
    capacity: u32,
    next_expected: u32,
    buffered: BTreeMap<u32, Vec<u8>>,
}

impl ReliableRecv {
    pub fn new(capacity: usize) -> Self {
        ReliableRecv {
            capacity: capacity as u32,
            next_expected: 0,
            buffered: BTreeMap::new(),
        }
    }

    pub fn receive(&mut self, id: u32, payload: Vec<u8>) -> ReceiveFlags {
        if id < self.next_expected {
            // Already delivered: keep the peer unstuck by re-ACKing, but
            // don't touch the buffer.
            return ReceiveFlags {
                ack_to_sender: true,
                in_window: false,
            };
        }
        if id >= self.next_expected + self.capacity {
            return ReceiveFlags {
                ack_to_sender: false,
                in_window: false,
            };
        }
        self.buffered.entry(id).or_insert(payload);
        ReceiveFlags {
            ack_to_sender: true,
            in_window: true,
        }
    }

    /// The message at `next_expected`, if it has arrived, without removing
    /// it — call `advance` to consume it.
    pub fn next_sequenced(&self) -> Option<&[u8]> {
        self.buffered.get(&self.next_expected).map(Vec::as_slice)
    }

    pub fn advance(&mut self) {
        self.buffered.remove(&self.next_expected);
        self.next_expected += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tp(secs: u64) -> TimePoint {
        TimePoint::from_secs(secs)
    }

    #[test]
    fn send_ring_rejects_beyond_capacity() {
        let mut ring = ReliableSend::new(2, Duration::from_secs(1), Duration::from_secs(60));
        ring.send(1, vec![1], tp(0)).unwrap();
        ring.send(2, vec![2], tp(0)).unwrap();
        assert!(ring.send(3, vec![3], tp(0)).is_err());
    }

    #[test]
    fn ack_frees_a_slot() {
        let mut ring = ReliableSend::new(2, Duration::from_secs(1), Duration::from_secs(60));
        ring.send(1, vec![1], tp(0)).unwrap();
        assert!(ring.ack(1));
        ring.send(2, vec![2], tp(0)).unwrap();
        assert!(!ring.is_full());
    }

    #[test]
    fn retransmit_doubles_timeout_up_to_cap() {
        let mut ring = ReliableSend::new(4, Duration::from_secs(1), Duration::from_secs(3));
        ring.send(1, vec![9], tp(0)).unwrap();
        let due = ring.retransmit(tp(1));
        assert_eq!(due, vec![(1, vec![9])]);
        // Next timeout should be 2s, so nothing due yet at t=2.
        assert!(ring.retransmit(tp(2)).is_empty());
        let due2 = ring.retransmit(tp(3));
        assert_eq!(due2, vec![(1, vec![9])]);
    }

    #[test]
    fn receive_delivers_in_order_despite_reordering() {
        let mut recv = ReliableRecv::new(8);
        assert_eq!(
            recv.receive(1, vec![1]),
            ReceiveFlags {
                ack_to_sender: true,
                in_window: true
            }
        );
        assert_eq!(
            recv.receive(0, vec![0]),
            ReceiveFlags {
                ack_to_sender: true,
                in_window: true
            }
        );
        assert_eq!(recv.next_sequenced(), Some(&[0u8][..]));
        recv.advance();
        assert_eq!(recv.next_sequenced(), Some(&[1u8][..]));
        recv.advance();
        assert_eq!(recv.next_sequenced(), None);
    }

    #[test]
    fn duplicate_of_already_delivered_message_still_acks() {
        let mut recv = ReliableRecv::new(8);
        recv.receive(0, vec![0]);
        recv.advance();
        let flags = recv.receive(0, vec![0]);
        assert!(flags.ack_to_sender);
        assert!(!flags.in_window);
    }

    #[test]
    fn message_beyond_window_is_dropped_without_ack() {
        let mut recv = ReliableRecv::new(4);
        let flags = recv.receive(10, vec![0]);
        assert!(!flags.ack_to_sender);
        assert!(!flags.in_window);
    }
}
