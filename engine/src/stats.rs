//! Per-engine counters, one per §7 error kind plus a couple of lifecycle
//! counters `ProtoEngine` itself tracks. Not an observability *exporter* —
//! just plain counters a host can read and forward to whatever metrics
//! system it already runs (Prometheus, statsd, a log line, ...).

use crate::error::ProtoErrorKind;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProtoStats {
    pub replay: u64,
    pub backtrack: u64,
    pub hmac: u64,
    pub decrypt: u64,
    pub buffer: u64,
    pub cc_error: u64,
    pub kev_negotiate_error: u64,
    pub primary_expire: u64,
    pub keepalive_timeout: u64,
    pub n_key_limit_reneg: u64,
    /// Successful renegotiations completed (KEV_BECOME_PRIMARY swaps).
    pub negotiations: u64,
    /// Slowest observed handshake, in seconds (construct_time to ACTIVE).
    pub slowest_handshake_secs: u64,
}

impl ProtoStats {
    pub fn record_kind(&mut self, kind: &ProtoErrorKind) {
        match kind {
            ProtoErrorKind::Replay => self.replay += 1,
            ProtoErrorKind::Backtrack => self.backtrack += 1,
            ProtoErrorKind::Hmac => self.hmac += 1,
            ProtoErrorKind::Decrypt => self.decrypt += 1,
            ProtoErrorKind::Buffer(_) => self.buffer += 1,
            ProtoErrorKind::CcError(_) => self.cc_error += 1,
            ProtoErrorKind::KevNegotiateError => self.kev_negotiate_error += 1,
            ProtoErrorKind::PrimaryExpire => self.primary_expire += 1,
            ProtoErrorKind::KeepaliveTimeout => self.keepalive_timeout += 1,
            ProtoErrorKind::NKeyLimitReneg => self.n_key_limit_reneg += 1,
        }
    }

    pub fn record_negotiation(&mut self, handshake_secs: u64) {
        self.negotiations += 1;
        if handshake_secs > self.slowest_handshake_secs {
            self.slowest_handshake_secs = handshake_secs;
        }
    }
}
