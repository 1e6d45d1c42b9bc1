//! Peer-info / options-string construction and push-reply parsing (spec
//! §6.2, §6.4). Deliberately dumb: this module builds and reads strings the
//! way the control channel exchanges them, and extracts only the keys that
//! affect the engine's own behaviour. Everything else is passed through
//! to the caller as an opaque `Vec<(String, String)>` for the embedding
//! application to act on.

use std::time::Duration;

use tracing::debug;

use crate::error::ProtoError;
use crate::packet::PeerId;

/// `IV_PROTO` bitmask (spec §6.2). Hand-rolled rather than pulling in the
/// `bitflags` crate for a single four-bit-wide mask type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IvProtoFlags(u32);

impl IvProtoFlags {
    pub const DATA_V2: u32 = 2;
    pub const REQUEST_PUSH: u32 = 4;
    pub const TLS_KEY_EXPORT: u32 = 8;
    pub const AUTH_PENDING_KW: u32 = 16;
    pub const DNS_OPTION: u32 = 64;
    pub const CC_EXIT_NOTIFY: u32 = 128;
    pub const AUTH_FAIL_TEMP: u32 = 256;
    pub const DYN_TLS_CRYPT: u32 = 512;

    pub fn from_bits(bits: u32) -> Self {
        IvProtoFlags(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    pub fn insert(&mut self, flag: u32) {
        self.0 |= flag;
    }
}

/// Parameters the local side advertises to its peer, used to build both the
/// `IV_*` peer-info block and the consistency-check options string (spec
/// §6.2).
#[derive(Debug, Clone)]
pub struct LocalOptions {
    pub iv_ver: String,
    pub iv_plat: String,
    pub tun_mtu_max: u32,
    pub link_mtu: u32,
    pub ciphers: Vec<String>,
    pub cipher: String,
    pub auth: String,
    pub keysize: u32,
    pub proto_flags: IvProtoFlags,
    pub tls_auth: bool,
    pub is_client: bool,
    pub bs64_data_limit_advertised: bool,
}

impl LocalOptions {
    /// Builds the newline-separated `IV_*` peer-info block (spec §6.2).
    pub fn peer_info_block(&self) -> String {
        let mut lines = vec![
            format!("IV_VER={}", self.iv_ver),
            format!("IV_PLAT={}", self.iv_plat),
            "IV_NCP=2".to_string(),
            "IV_TCPNL=1".to_string(),
            format!("IV_PROTO={}", self.proto_flags.bits()),
            format!("IV_MTU={}", self.tun_mtu_max),
            format!("IV_CIPHERS={}", self.ciphers.join(":")),
        ];
        if self.bs64_data_limit_advertised {
            lines.push("IV_BS64DL=1".to_string());
        }
        lines.join("\n")
    }

    /// Builds the comma-free consistency-check options string (spec §6.2).
    pub fn options_string(&self) -> String {
        let mut parts = vec![
            "V4".to_string(),
            "dev-type tun".to_string(),
            format!("link-mtu {}", self.link_mtu),
            format!("tun-mtu {}", self.tun_mtu_max),
            "proto UDPv4".to_string(),
            "keydir 0".to_string(),
            format!("cipher {}", self.cipher),
            format!("auth {}", self.auth),
            format!("keysize {}", self.keysize),
        ];
        if self.tls_auth {
            parts.push("tls-auth".to_string());
        }
        parts.push("key-method 2".to_string());
        parts.push(if self.is_client { "tls-client" } else { "tls-server" }.to_string());
        parts.join(",")
    }
}

/// Parsed `IV_*` peer-info block received from the remote side.
#[derive(Debug, Clone, Default)]
pub struct RemotePeerInfo {
    pub iv_ver: Option<String>,
    pub iv_plat: Option<String>,
    pub proto_flags: IvProtoFlags,
    pub tun_mtu_max: Option<u32>,
    pub ciphers: Vec<String>,
    pub extra: Vec<(String, String)>,
}

/// Parses the newline-separated `IV_*` block the peer sent in its AUTH
/// payload (spec §6.2). Unrecognised `IV_*` keys and any non-`IV_` lines are
/// retained verbatim in `extra` for the embedding application.
pub fn parse_peer_info(block: &str) -> RemotePeerInfo {
    let mut info = RemotePeerInfo::default();
    for line in block.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "IV_VER" => info.iv_ver = Some(value.to_string()),
            "IV_PLAT" => info.iv_plat = Some(value.to_string()),
            "IV_PROTO" => {
                if let Ok(bits) = value.parse::<u32>() {
                    info.proto_flags = IvProtoFlags::from_bits(bits);
                }
            }
            "IV_MTU" => info.tun_mtu_max = value.parse().ok(),
            "IV_CIPHERS" => info.ciphers = value.split(':').map(str::to_owned).collect(),
            _ => info.extra.push((key.to_string(), value.to_string())),
        }
    }
    info
}

/// Checks that two peers' options strings describe a compatible channel
/// (spec §6.2: "a comma-free summary consistency-checked by both peers").
/// Returns `Ok(())` when compatible, or a human-readable mismatch
/// description otherwise.
pub fn check_options_consistency(local: &str, remote: &str) -> Result<(), String> {
    let local_fields: Vec<&str> = local.split(',').collect();
    let remote_fields: Vec<&str> = remote.split(',').collect();
    // Only the fields both sides always send are compared; key-method and
    // tls-client/tls-server necessarily differ by role.
    for field in ["dev-type", "link-mtu", "tun-mtu", "cipher", "auth", "keysize"] {
        let l = local_fields.iter().find(|f| f.starts_with(field));
        let r = remote_fields.iter().find(|f| f.starts_with(field));
        if l != r {
            return Err(format!(
                "options string mismatch on `{field}`: local={l:?} remote={r:?}"
            ));
        }
    }
    Ok(())
}

/// Protocol-affecting updates extracted from a server push-reply (spec
/// §6.4). Fields the core does not understand are dropped after being
/// logged; everything here is an explicit, bounded override.
#[derive(Debug, Clone, Default)]
pub struct PushedOptions {
    pub cipher: Option<String>,
    pub auth: Option<String>,
    pub compress: Option<String>,
    pub peer_id: Option<PeerId>,
    pub keepalive_ping: Option<Duration>,
    pub keepalive_timeout: Option<Duration>,
    pub renegotiate: Option<Duration>,
    pub tran_window: Option<Duration>,
    pub hand_window: Option<Duration>,
    pub become_primary: Option<Duration>,
    pub tls_timeout: Option<Duration>,
    pub explicit_exit_notify: Option<u32>,
}

/// Parses a comma-separated push-reply blob, extracting only the
/// protocol-affecting keys named in spec §6.4. Unknown keys are ignored,
/// not rejected, matching the push-reply's "unknown options are tolerated"
/// design.
pub fn parse_push_reply(blob: &str) -> Result<PushedOptions, ProtoError> {
    let mut out = PushedOptions::default();
    for item in blob.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let mut parts = item.splitn(2, ' ');
        let key = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("").trim();

        match key {
            "cipher" => out.cipher = Some(rest.to_string()),
            "auth" => out.auth = Some(rest.to_string()),
            "key-derivation" => {}
            "protocol-flags" => {}
            "compress" | "comp-lzo" => out.compress = Some(rest.to_string()),
            "peer-id" => out.peer_id = Some(PeerId::new(parse_field(key, rest)?)),
            "keepalive" => {
                let mut fields = rest.split_whitespace();
                let ping: u64 = parse_field(key, fields.next().unwrap_or(""))?;
                let timeout: u64 = parse_field(key, fields.next().unwrap_or(""))?;
                out.keepalive_ping = Some(Duration::from_secs(ping));
                out.keepalive_timeout = Some(Duration::from_secs(timeout));
            }
            "ping" => out.keepalive_ping = Some(Duration::from_secs(parse_field(key, rest)?)),
            "ping-restart" => out.keepalive_timeout = Some(Duration::from_secs(parse_field(key, rest)?)),
            "reneg-sec" => out.renegotiate = Some(Duration::from_secs(parse_field(key, rest)?)),
            "tran-window" => out.tran_window = Some(Duration::from_secs(parse_field(key, rest)?)),
            "hand-window" => out.hand_window = Some(Duration::from_secs(parse_field(key, rest)?)),
            "become-primary" => out.become_primary = Some(Duration::from_secs(parse_field(key, rest)?)),
            "tls-timeout" => out.tls_timeout = Some(Duration::from_secs(parse_field(key, rest)?)),
            "explicit-exit-notify" => out.explicit_exit_notify = Some(parse_field(key, rest).unwrap_or(1)),
            _ => debug!(key, "ignoring unrecognised push-reply option"),
        }
    }
    Ok(out)
}

fn parse_field<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ProtoError> {
    value
        .parse()
        .map_err(|_| ProtoError::ProcessServerPushError(format!("bad value for `{key}`: `{value}`")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_options() -> LocalOptions {
        LocalOptions {
            iv_ver: "3.2.1".to_string(),
            iv_plat: "linux".to_string(),
            tun_mtu_max: 1500,
            link_mtu: 1558,
            ciphers: vec!["AES-256-GCM".to_string(), "CHACHA20-POLY1305".to_string()],
            cipher: "AES-256-GCM".to_string(),
            auth: "SHA256".to_string(),
            keysize: 256,
            proto_flags: IvProtoFlags::from_bits(IvProtoFlags::DATA_V2 | IvProtoFlags::TLS_KEY_EXPORT),
            tls_auth: false,
            is_client: true,
            bs64_data_limit_advertised: false,
        }
    }

    #[test]
    fn peer_info_block_carries_proto_bitmask() {
        let opts = local_options();
        let block = opts.peer_info_block();
        assert!(block.contains("IV_PROTO=10"));
        assert!(block.contains("IV_CIPHERS=AES-256-GCM:CHACHA20-POLY1305"));
    }

    #[test]
    fn options_string_omits_tls_auth_when_disabled() {
        let opts = local_options();
        let s = opts.options_string();
        assert!(!s.contains("tls-auth"));
        assert!(s.ends_with("key-method 2,tls-client"));
    }

    #[test]
    fn parse_peer_info_round_trips_known_and_unknown_keys() {
        let block = "IV_VER=3.2.1\nIV_PROTO=130\nIV_CUSTOM=foo";
        let info = parse_peer_info(block);
        assert_eq!(info.iv_ver.as_deref(), Some("3.2.1"));
        assert!(info.proto_flags.contains(IvProtoFlags::CC_EXIT_NOTIFY));
        assert_eq!(info.extra, vec![("IV_CUSTOM".to_string(), "foo".to_string())]);
    }

    #[test]
    fn matching_options_strings_are_consistent() {
        let local = "V4,dev-type tun,link-mtu 1558,tun-mtu 1500,proto UDPv4,keydir 0,cipher AES-256-GCM,auth SHA256,keysize 256,key-method 2,tls-client";
        let remote = "V4,dev-type tun,link-mtu 1558,tun-mtu 1500,proto UDPv4,keydir 1,cipher AES-256-GCM,auth SHA256,keysize 256,key-method 2,tls-server";
        assert!(check_options_consistency(local, remote).is_ok());
    }

    #[test]
    fn mismatched_cipher_is_rejected() {
        let local = "V4,dev-type tun,link-mtu 1558,tun-mtu 1500,cipher AES-256-GCM,auth SHA256,keysize 256";
        let remote = "V4,dev-type tun,link-mtu 1558,tun-mtu 1500,cipher AES-128-CBC,auth SHA256,keysize 128";
        assert!(check_options_consistency(local, remote).is_err());
    }

    #[test]
    fn push_reply_extracts_known_keys_and_ignores_unknown() {
        let pushed = parse_push_reply("cipher AES-256-GCM,reneg-sec 7200,peer-id 42,foo-bar baz").unwrap();
        assert_eq!(pushed.cipher.as_deref(), Some("AES-256-GCM"));
        assert_eq!(pushed.renegotiate, Some(Duration::from_secs(7200)));
        assert_eq!(pushed.peer_id.unwrap().value(), 42);
    }

    #[test]
    fn push_reply_keepalive_sets_both_durations() {
        let pushed = parse_push_reply("keepalive 10 60").unwrap();
        assert_eq!(pushed.keepalive_ping, Some(Duration::from_secs(10)));
        assert_eq!(pushed.keepalive_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn push_reply_rejects_malformed_numeric_value() {
        assert!(parse_push_reply("reneg-sec notanumber").is_err());
    }

    #[test]
    fn explicit_exit_notify_defaults_to_one_when_flag_has_no_value() {
        let pushed = parse_push_reply("explicit-exit-notify").unwrap();
        assert_eq!(pushed.explicit_exit_notify, Some(1));
    }
}
