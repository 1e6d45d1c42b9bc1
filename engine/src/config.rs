//! Protocol configuration.
//!
//! `ProtoConfig` collects every timing/size constant named across spec §3,
//! §4 and §9, with the same defaults `proto.hpp` ships (`renegotiate` =
//! 3600s, `handshake_window` = 60s, ...). Construction follows the
//! teacher's builder pattern (`PoolBuilder` in `secure_channel_improved.rs`):
//! a `ConfigBuilder` with chained `with_*` setters and a `build()` that
//! fills in the cross-field defaults `proto.hpp` derives (e.g.
//! `expire = 2 * renegotiate` when not set explicitly).

use std::time::Duration;

/// Which side of the handshake this engine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Client,
    Server,
}

/// Underlying transport; affects whether packet-level failures are fatal
/// (§7: "UDP is tolerant... TCP" column) and the default replay window size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

/// Control-channel wrapping mode (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapMode {
    Plain,
    TlsAuth,
    TlsCrypt,
    TlsCryptV2,
}

#[derive(Debug, Clone)]
pub struct ProtoConfig {
    pub mode: Mode,
    pub transport: Transport,
    pub wrap_mode: WrapMode,

    /// SSL/TLS negotiation must complete by this time after KeyContext
    /// construction (§4.3 "Handshake deadline").
    pub handshake_window: Duration,
    /// Time after reaching ACTIVE that a secondary KeyContext becomes
    /// primary (§4.3 "Primary/secondary lifecycle").
    pub become_primary: Duration,
    /// Start SSL/TLS renegotiation this long after KeyContext construction.
    pub renegotiate: Duration,
    /// Time after which a non-promoted primary is force-expired. Defaults
    /// to `2 * renegotiate` per `proto.hpp`'s `expire = renegotiate;
    /// expire += renegotiate;`.
    pub expire: Duration,
    /// Reliability-layer retransmit base timeout.
    pub tls_timeout: Duration,
    /// Cap for the exponential retransmit backoff in the reliability layer.
    pub tls_timeout_cap: Duration,

    /// Keepalive ping interval, if keepalive is enabled.
    pub keepalive_ping: Option<Duration>,
    /// Keepalive timeout once ACTIVE.
    pub keepalive_timeout: Option<Duration>,
    /// Alternate (typically shorter) timeout before first reaching ACTIVE.
    pub keepalive_timeout_pre_active: Option<Duration>,

    /// Replay window size W for the data channel (§4.1, §4.5).
    pub data_replay_window: u32,
    /// Replay window size for the control channel's long-form PacketId
    /// inside CtrlWrap (§4.4).
    pub control_replay_window: u32,
    /// Long-form receive-window wall-clock expiry, in seconds (§4.1 EXPIRE).
    pub control_replay_expire_secs: u32,

    /// Reliability ring capacity N (§4.2), N >= 4.
    pub reliable_ring_size: usize,

    /// Per-direction byte limit for 64-bit-block ciphers
    /// (`OPENVPN_BS64_DATA_LIMIT`). Build-configurable in the original
    /// source; see DESIGN.md for the chosen default and rationale.
    pub bs64_data_limit: u64,

    /// Whether the wide (64-bit) short-form PacketId is negotiated for the
    /// data channel.
    pub wide_packet_id: bool,

    /// Fraction of the PacketId send-counter width (as a count remaining)
    /// at which the wrap-warning flag is raised (§4.1).
    pub packet_id_wrap_warn_margin: u32,

    /// Application control-message size ceiling (§6.5/§4.6).
    pub app_msg_max: usize,
}

impl ProtoConfig {
    pub fn builder(mode: Mode) -> ConfigBuilder {
        ConfigBuilder::new(mode)
    }

    pub fn is_server(&self) -> bool {
        self.mode == Mode::Server
    }

    pub fn is_client(&self) -> bool {
        self.mode == Mode::Client
    }
}

pub struct ConfigBuilder {
    mode: Mode,
    transport: Transport,
    wrap_mode: WrapMode,
    handshake_window: Duration,
    become_primary: Option<Duration>,
    renegotiate: Duration,
    expire: Option<Duration>,
    tls_timeout: Duration,
    tls_timeout_cap: Duration,
    keepalive_ping: Option<Duration>,
    keepalive_timeout: Option<Duration>,
    keepalive_timeout_pre_active: Option<Duration>,
    data_replay_window: u32,
    control_replay_window: u32,
    control_replay_expire_secs: u32,
    reliable_ring_size: usize,
    bs64_data_limit: u64,
    wide_packet_id: bool,
    packet_id_wrap_warn_margin: u32,
    app_msg_max: usize,
}

impl ConfigBuilder {
    pub fn new(mode: Mode) -> Self {
        ConfigBuilder {
            mode,
            transport: Transport::Udp,
            wrap_mode: WrapMode::TlsCrypt,
            handshake_window: Duration::from_secs(60),
            become_primary: None,
            renegotiate: Duration::from_secs(3600),
            expire: None,
            tls_timeout: Duration::from_secs(2),
            tls_timeout_cap: Duration::from_secs(60),
            keepalive_ping: None,
            keepalive_timeout: None,
            keepalive_timeout_pre_active: None,
            data_replay_window: 64,
            control_replay_window: 64,
            control_replay_expire_secs: 3600,
            reliable_ring_size: 8,
            // Open Question in spec.md §9: OPENVPN_BS64_DATA_LIMIT is
            // build-configurable upstream. We default to the widely-used
            // 2^20 * 64MB rotation point cited in the OpenVPN hardening
            // guide for Blowfish/3DES; see DESIGN.md.
            bs64_data_limit: 1 << 26,
            wide_packet_id: false,
            packet_id_wrap_warn_margin: 1 << 24,
            app_msg_max: 65536,
        }
    }

    pub fn transport(mut self, t: Transport) -> Self {
        self.transport = t;
        // TCP is in-order; the replay window only needs to be a sanity
        // check (§4.5: "W≈8" for TCP vs "W≈64" for UDP).
        if t == Transport::Tcp {
            self.data_replay_window = 8;
        }
        self
    }

    pub fn wrap_mode(mut self, w: WrapMode) -> Self {
        self.wrap_mode = w;
        self
    }

    pub fn handshake_window(mut self, d: Duration) -> Self {
        self.handshake_window = d;
        self
    }

    pub fn become_primary(mut self, d: Duration) -> Self {
        self.become_primary = Some(d);
        self
    }

    pub fn renegotiate(mut self, d: Duration) -> Self {
        self.renegotiate = d;
        self
    }

    pub fn expire(mut self, d: Duration) -> Self {
        self.expire = Some(d);
        self
    }

    pub fn tls_timeout(mut self, d: Duration) -> Self {
        self.tls_timeout = d;
        self
    }

    pub fn keepalive(mut self, ping: Duration, timeout: Duration) -> Self {
        self.keepalive_ping = Some(ping);
        self.keepalive_timeout = Some(timeout);
        self
    }

    pub fn keepalive_timeout_pre_active(mut self, d: Duration) -> Self {
        self.keepalive_timeout_pre_active = Some(d);
        self
    }

    pub fn data_replay_window(mut self, w: u32) -> Self {
        self.data_replay_window = w;
        self
    }

    pub fn reliable_ring_size(mut self, n: usize) -> Self {
        self.reliable_ring_size = n.max(4);
        self
    }

    pub fn bs64_data_limit(mut self, limit: u64) -> Self {
        self.bs64_data_limit = limit;
        self
    }

    pub fn wide_packet_id(mut self, wide: bool) -> Self {
        self.wide_packet_id = wide;
        self
    }

    /// Mirrors `proto.hpp`'s derivation: `become_primary` defaults to
    /// `min(handshake_window, renegotiate/2)` when unset, and `expire`
    /// defaults to `2 * renegotiate`.
    pub fn build(self) -> ProtoConfig {
        let become_primary = self.become_primary.unwrap_or_else(|| {
            self.handshake_window.min(self.renegotiate / 2)
        });
        let expire = self.expire.unwrap_or(self.renegotiate * 2);

        ProtoConfig {
            mode: self.mode,
            transport: self.transport,
            wrap_mode: self.wrap_mode,
            handshake_window: self.handshake_window,
            become_primary,
            renegotiate: self.renegotiate,
            expire,
            tls_timeout: self.tls_timeout,
            tls_timeout_cap: self.tls_timeout_cap,
            keepalive_ping: self.keepalive_ping,
            keepalive_timeout: self.keepalive_timeout,
            keepalive_timeout_pre_active: self.keepalive_timeout_pre_active,
            data_replay_window: self.data_replay_window,
            control_replay_window: self.control_replay_window,
            control_replay_expire_secs: self.control_replay_expire_secs,
            reliable_ring_size: self.reliable_ring_size,
            bs64_data_limit: self.bs64_data_limit,
            wide_packet_id: self.wide_packet_id,
            packet_id_wrap_warn_margin: self.packet_id_wrap_warn_margin,
            app_msg_max: self.app_msg_max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_source() {
        let cfg = ProtoConfig::builder(Mode::Client).build();
        assert_eq!(cfg.handshake_window, Duration::from_secs(60));
        assert_eq!(cfg.renegotiate, Duration::from_secs(3600));
        assert_eq!(cfg.expire, Duration::from_secs(7200));
        assert_eq!(cfg.become_primary, Duration::from_secs(60));
    }

    #[test]
    fn become_primary_defaults_to_half_renegotiate_when_smaller() {
        let cfg = ProtoConfig::builder(Mode::Server)
            .handshake_window(Duration::from_secs(120))
            .renegotiate(Duration::from_secs(20))
            .build();
        assert_eq!(cfg.become_primary, Duration::from_secs(10));
    }

    #[test]
    fn explicit_overrides_win() {
        let cfg = ProtoConfig::builder(Mode::Client)
            .renegotiate(Duration::from_secs(10))
            .become_primary(Duration::from_secs(5))
            .expire(Duration::from_secs(999))
            .build();
        assert_eq!(cfg.become_primary, Duration::from_secs(5));
        assert_eq!(cfg.expire, Duration::from_secs(999));
    }

    #[test]
    fn tcp_transport_shrinks_replay_window() {
        let cfg = ProtoConfig::builder(Mode::Client)
            .transport(Transport::Tcp)
            .build();
        assert_eq!(cfg.data_replay_window, 8);
    }
}
