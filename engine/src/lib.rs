//! OpenVPN control/data-channel protocol engine: packet framing, the
//! reliability layer, the control-channel wrap (plain / tls-auth /
//! tls-crypt / tls-crypt-v2), the key-state machine, and data-channel
//! crypto. TLS itself, concrete ciphers/RNGs, transport I/O, tun/routing,
//! the config-file grammar, and CLI/management/logging sinks are all host
//! concerns, reached only through the trait interfaces in [`crypto`].
//!
//! [`proto_engine::ProtoEngine`] is the type most hosts drive directly;
//! the other modules are exposed for hosts that need to inspect wire
//! framing or implement their own transport loop around the lower layers.

mod config;
mod crypto;
mod ctrl_wrap;
mod data_crypt;
mod error;
mod key_context;
mod options;
mod packet;
mod packet_id;
mod proto_engine;
mod psid;
mod reliability;
mod stats;
mod time;
mod tlv;

#[cfg(any(test, feature = "test-util"))]
pub mod testutil;

pub use config::{ConfigBuilder, Mode, ProtoConfig, Transport, WrapMode as ConfigWrapMode};
pub use crypto::{
    AeadCipher, Aes256CbcCipher, Aes256CtrCipher, Aes256GcmCipher, CbcCipher, ChaCha20Poly1305Cipher, CryptoProvider,
    CtrCipher, HmacSha256, MacProvider, OsRng, Rng, SslSession,
};
pub use ctrl_wrap::{unwrap_client_key, wrap_client_key, CtrlWrap, DirectionalKeys, UnwrappedClientKey, WrapMode as CtrlWrapMode};
pub use data_crypt::{fix_tcp_mss, ByteLimit, CipherSuite, CompressionStub, DataCrypt, DataKeys, NO_COMPRESS_BYTE};
pub use error::{ProtoError, ProtoErrorKind, Result, WireError};
pub use key_context::{AuthPayload, KevEvent, KeyContext, KeyState};
pub use options::{
    check_options_consistency, parse_peer_info, parse_push_reply, IvProtoFlags, LocalOptions, PushedOptions, RemotePeerInfo,
};
pub use packet::{ControlPacket, DataPacket, KeyId, OpCode, PacketHeader, PeerId};
pub use packet_id::{LongPacketIdSend, PacketIdReceive, PacketIdSend, PacketIdStatus};
pub use proto_engine::{
    packet_type, InvalidateReason, PacketClass, ProtoEngine, WrapConfig, EXIT_NOTIFY_DATA_SENTINEL, KEEPALIVE_PING_PAYLOAD,
};
pub use psid::{ProtoSessionId, PSID_LEN};
pub use reliability::{ReceiveFlags, ReliableRecv, ReliableSend};
pub use stats::ProtoStats;
pub use time::TimePoint;
pub use tlv::{parse_early_neg_tlvs, EarlyNegFlags, RESEND_WKC};
