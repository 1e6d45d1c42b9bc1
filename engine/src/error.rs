//! Error taxonomy.
//!
//! Every failure the engine can produce is categorised into one of the
//! kinds from spec §7, each counted in [`crate::stats::ProtoStats`]. Parse
//! errors get their own smaller enum ([`WireError`]) since most of them are
//! "not enough bytes" and carrying that detail is cheap and useful to a
//! caller debugging a malformed peer.

use thiserror::Error;

/// Truncated or structurally invalid wire data. Never indicates a security
/// failure by itself (that's [`ProtoErrorKind::Hmac`]/[`ProtoErrorKind::Decrypt`]);
/// these are caught before any cryptographic check runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer too short: need at least {need} bytes, got {got}")]
    TooShort { need: usize, got: usize },
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("zero-length packet")]
    Empty,
    #[error("ack count {0} exceeds maximum of 8")]
    TooManyAcks(u8),
    #[error("malformed early-negotiation TLV")]
    MalformedTlv,
    #[error("control string is not NUL-terminated UTF-8")]
    InvalidControlString,
    #[error("string length prefix {0} exceeds remaining buffer")]
    StringLengthOverflow(u16),
}

/// The §7 error-kind taxonomy. Each variant names the local action
/// `spec.md` §7 assigns it; `is_tcp_fatal` implements the "Session-fatal on
/// TCP?" column.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtoErrorKind {
    #[error("packet id already seen (replay)")]
    Replay,
    #[error("packet id older than replay window")]
    Backtrack,
    #[error("HMAC verification failed")]
    Hmac,
    #[error("AEAD/CBC decryption failed")]
    Decrypt,
    #[error("truncated or malformed buffer: {0}")]
    Buffer(WireError),
    #[error("control-channel protocol violation: {0}")]
    CcError(&'static str),
    #[error("handshake did not complete within handshake_window")]
    KevNegotiateError,
    #[error("primary key expired with no successor")]
    PrimaryExpire,
    #[error("no traffic within keepalive_timeout")]
    KeepaliveTimeout,
    #[error("per-key byte limit reached, renegotiation scheduled")]
    NKeyLimitReneg,
}

impl ProtoErrorKind {
    /// Whether this kind, when it occurs on a TCP-carried session, must
    /// invalidate the whole session rather than just dropping one packet.
    pub fn is_tcp_fatal(&self) -> bool {
        match self {
            ProtoErrorKind::Replay
            | ProtoErrorKind::Backtrack
            | ProtoErrorKind::NKeyLimitReneg => false,
            ProtoErrorKind::Hmac
            | ProtoErrorKind::Decrypt
            | ProtoErrorKind::Buffer(_)
            | ProtoErrorKind::CcError(_) => true,
            // Always fatal regardless of transport.
            ProtoErrorKind::KevNegotiateError
            | ProtoErrorKind::PrimaryExpire
            | ProtoErrorKind::KeepaliveTimeout => true,
        }
    }
}

/// Top-level error type returned by fallible public operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("{0}")]
    Kind(#[from] ProtoErrorKind),

    #[error("control message exceeds APP_MSG_MAX ({max} bytes): got {got}")]
    AppMsgTooLarge { max: usize, got: usize },

    #[error("control string contains a disallowed control character: 0x{0:02x}")]
    DisallowedControlChar(u8),

    #[error("reliability send ring is full")]
    SendRingFull,

    #[error("no primary key context is active")]
    NoPrimaryKey,

    #[error("session was invalidated: {0}")]
    Invalidated(&'static str),

    #[error("invalid server push option: {0}")]
    ProcessServerPushError(String),

    #[error("operation is only valid for a client engine")]
    NotClient,

    #[error("tls-crypt-v2 wrapped client key could not be unwrapped")]
    WkcUnwrapFailed,

    #[error("packet id counter would wrap; renegotiation required")]
    PacketIdWrap,
}

pub type Result<T> = std::result::Result<T, ProtoError>;
