//! Control-channel wrapping: plain / tls-auth / tls-crypt / tls-crypt-v2
//! (spec §4.4). Owns the send/receive long-form `PacketId`s and the HMAC/CTR
//! contexts derived from the static or per-client key; `KeyContext` hands it
//! the plain control-packet bytes (`ControlPacket::serialize()` output) and
//! gets back wire bytes, or vice versa on receive.
//!
//! Wire layout chosen here (spec.md describes the wrapping prose but not
//! exact byte offsets):
//! - tls-auth:   `header(1) hmac(32) pkt_id(8) <rest-of-plain-body>`
//! - tls-crypt:  `header(1) src_psid(8) pkt_id(8) hmac(32) <ciphertext of rest>`
//! See DESIGN.md for the rationale.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::CryptoProvider;
use crate::error::{ProtoError, ProtoErrorKind};
use crate::packet_id::{LongPacketIdSend, PacketIdReceive, PacketIdStatus};
use crate::psid::{ProtoSessionId, PSID_LEN};
use crate::time::TimePoint;

const HMAC_LEN: usize = 32;
const PKTID_LONG_LEN: usize = 8;

/// Bidirectional key material for tls-auth/tls-crypt. `cipher_key` is
/// unused (all-zero) in tls-auth mode, which only HMACs.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DirectionalKeys {
    pub encrypt_cipher_key: [u8; 32],
    pub encrypt_hmac_key: [u8; 32],
    pub decrypt_cipher_key: [u8; 32],
    pub decrypt_hmac_key: [u8; 32],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapMode {
    Plain,
    TlsAuth,
    TlsCrypt,
}

pub struct CtrlWrap {
    mode: WrapMode,
    keys: Option<DirectionalKeys>,
    send_pid: LongPacketIdSend,
    recv_pid: PacketIdReceive,
}

impl CtrlWrap {
    pub fn new(
        mode: WrapMode,
        keys: Option<DirectionalKeys>,
        epoch: TimePoint,
        window: u32,
        expire_secs: u32,
        warn_margin: u64,
    ) -> Self {
        CtrlWrap {
            mode,
            keys,
            send_pid: LongPacketIdSend::new(epoch, warn_margin),
            recv_pid: PacketIdReceive::new(window, true, expire_secs),
        }
    }

    pub fn wrap(&mut self, header: u8, plain_rest: &[u8], crypto: &CryptoProvider) -> Result<Vec<u8>, ProtoError> {
        match self.mode {
            WrapMode::Plain => {
                let mut out = Vec::with_capacity(1 + plain_rest.len());
                out.push(header);
                out.extend_from_slice(plain_rest);
                Ok(out)
            }
            WrapMode::TlsAuth => {
                let keys = self.keys.as_ref().expect("tls-auth mode requires keys");
                let (id, epoch) = self.send_pid.next()?;
                let mut signed = Vec::with_capacity(PKTID_LONG_LEN + plain_rest.len());
                signed.extend_from_slice(&id.to_be_bytes());
                signed.extend_from_slice(&epoch.to_be_bytes());
                signed.extend_from_slice(plain_rest);

                let mut mac_input = vec![header];
                mac_input.extend_from_slice(&signed);
                let tag = crypto.mac.mac(&keys.encrypt_hmac_key, &mac_input);

                let mut out = Vec::with_capacity(1 + HMAC_LEN + signed.len());
                out.push(header);
                out.extend_from_slice(&tag);
                out.extend_from_slice(&signed);
                Ok(out)
            }
            WrapMode::TlsCrypt => {
                let keys = self.keys.as_ref().expect("tls-crypt mode requires keys");
                let (id, epoch) = self.send_pid.next()?;
                // src_psid is embedded in plain_rest's first 8 bytes by
                // construction (ControlPacket always starts with src_psid).
                let src_psid = &plain_rest[..PSID_LEN];
                let cleartext_rest = &plain_rest[PSID_LEN..];

                let mut mac_input = vec![header];
                mac_input.extend_from_slice(src_psid);
                mac_input.extend_from_slice(&id.to_be_bytes());
                mac_input.extend_from_slice(&epoch.to_be_bytes());
                mac_input.extend_from_slice(cleartext_rest);
                let tag = crypto.mac.mac(&keys.encrypt_hmac_key, &mac_input);
                let iv = &tag[..16];
                let ciphertext = crypto.ctr.apply(&keys.encrypt_cipher_key, iv, cleartext_rest);

                let mut out = Vec::with_capacity(1 + PSID_LEN + PKTID_LONG_LEN + HMAC_LEN + ciphertext.len());
                out.push(header);
                out.extend_from_slice(src_psid);
                out.extend_from_slice(&id.to_be_bytes());
                out.extend_from_slice(&epoch.to_be_bytes());
                out.extend_from_slice(&tag);
                out.extend_from_slice(&ciphertext);
                Ok(out)
            }
        }
    }

    /// Returns `(header, plain_rest)`, the latter suitable for
    /// `ControlPacket::parse` alongside a re-synthesized header byte.
    pub fn unwrap(
        &mut self,
        wire: &[u8],
        now: TimePoint,
        crypto: &CryptoProvider,
    ) -> Result<(u8, Vec<u8>), ProtoError> {
        if wire.is_empty() {
            return Err(ProtoErrorKind::Buffer(crate::error::WireError::Empty).into());
        }
        let header = wire[0];
        let rest = &wire[1..];

        match self.mode {
            WrapMode::Plain => Ok((header, rest.to_vec())),
            WrapMode::TlsAuth => {
                let keys = self.keys.as_ref().expect("tls-auth mode requires keys");
                if rest.len() < HMAC_LEN + PKTID_LONG_LEN {
                    return Err(ProtoErrorKind::Buffer(crate::error::WireError::TooShort {
                        need: HMAC_LEN + PKTID_LONG_LEN,
                        got: rest.len(),
                    })
                    .into());
                }
                let (tag, signed) = rest.split_at(HMAC_LEN);
                let mut mac_input = vec![header];
                mac_input.extend_from_slice(signed);
                if !crypto.mac.verify(&keys.decrypt_hmac_key, &mac_input, tag) {
                    return Err(ProtoErrorKind::Hmac.into());
                }

                let id = u32::from_be_bytes(signed[0..4].try_into().unwrap());
                let epoch = u32::from_be_bytes(signed[4..8].try_into().unwrap());
                self.check_replay(id, epoch, now)?;

                Ok((header, signed[PKTID_LONG_LEN..].to_vec()))
            }
            WrapMode::TlsCrypt => {
                let keys = self.keys.as_ref().expect("tls-crypt mode requires keys");
                if rest.len() < PSID_LEN + PKTID_LONG_LEN + HMAC_LEN {
                    return Err(ProtoErrorKind::Buffer(crate::error::WireError::TooShort {
                        need: PSID_LEN + PKTID_LONG_LEN + HMAC_LEN,
                        got: rest.len(),
                    })
                    .into());
                }
                let src_psid = &rest[..PSID_LEN];
                let id = u32::from_be_bytes(rest[PSID_LEN..PSID_LEN + 4].try_into().unwrap());
                let epoch = u32::from_be_bytes(rest[PSID_LEN + 4..PSID_LEN + 8].try_into().unwrap());
                let tag = &rest[PSID_LEN + PKTID_LONG_LEN..PSID_LEN + PKTID_LONG_LEN + HMAC_LEN];
                let ciphertext = &rest[PSID_LEN + PKTID_LONG_LEN + HMAC_LEN..];

                let iv = &tag[..16];
                let cleartext_rest = crypto.ctr.apply(&keys.decrypt_cipher_key, iv, ciphertext);

                let mut mac_input = vec![header];
                mac_input.extend_from_slice(src_psid);
                mac_input.extend_from_slice(&id.to_be_bytes());
                mac_input.extend_from_slice(&epoch.to_be_bytes());
                mac_input.extend_from_slice(&cleartext_rest);
                if !crypto.mac.verify(&keys.decrypt_hmac_key, &mac_input, tag) {
                    return Err(ProtoErrorKind::Hmac.into());
                }
                self.check_replay(id, epoch, now)?;

                let mut plain_rest = Vec::with_capacity(PSID_LEN + cleartext_rest.len());
                plain_rest.extend_from_slice(src_psid);
                plain_rest.extend_from_slice(&cleartext_rest);
                Ok((header, plain_rest))
            }
        }
    }

    /// Validation-only fast path (spec §4.4): recompute the HMAC (or
    /// tls-crypt decrypt+verify) without touching replay state, so a
    /// spoofed first packet can be dropped before any handshake resources
    /// are allocated.
    pub fn pre_validate(&self, wire: &[u8], crypto: &CryptoProvider) -> bool {
        let mut scratch = CtrlWrap {
            mode: self.mode,
            keys: self.keys.clone(),
            send_pid: LongPacketIdSend::new(TimePoint::ZERO, 1 << 24),
            recv_pid: PacketIdReceive::new(self.recv_pid_window_hint(), true, 0),
        };
        scratch.unwrap(wire, TimePoint::ZERO, crypto).is_ok()
    }

    fn recv_pid_window_hint(&self) -> u32 {
        64
    }

    fn check_replay(&mut self, id: u32, epoch: u32, now: TimePoint) -> Result<(), ProtoError> {
        match self.recv_pid.test_add(id as u64, epoch, now, true) {
            PacketIdStatus::Success => Ok(()),
            PacketIdStatus::Replay => Err(ProtoErrorKind::Replay.into()),
            PacketIdStatus::Backtrack => Err(ProtoErrorKind::Backtrack.into()),
            PacketIdStatus::Expire => Err(ProtoErrorKind::Backtrack.into()),
            PacketIdStatus::Invalid => Err(ProtoErrorKind::CcError("invalid control packet id").into()),
            PacketIdStatus::TimeBacktrack => Err(ProtoErrorKind::CcError("control epoch moved backwards").into()),
        }
    }
}

/// Wraps/unwraps the tls-crypt-v2 Wrapped Client Key carried on the
/// client's first hard-reset-v3 packet (spec §4.4). Format:
/// `nonce(12) || AES-256-GCM(server_key, nonce, aad=[], key_material(64) || metadata)`.
pub fn wrap_client_key(
    server_key: &[u8; 32],
    client_cipher_key: &[u8; 32],
    client_hmac_key: &[u8; 32],
    metadata: &[u8],
    nonce: &[u8; 12],
    crypto: &CryptoProvider,
) -> Vec<u8> {
    let mut plaintext = Vec::with_capacity(64 + metadata.len());
    plaintext.extend_from_slice(client_cipher_key);
    plaintext.extend_from_slice(client_hmac_key);
    plaintext.extend_from_slice(metadata);

    let ciphertext = crypto.aead.seal(server_key, nonce, &[], &plaintext);
    let mut out = Vec::with_capacity(12 + ciphertext.len());
    out.extend_from_slice(nonce);
    out.extend_from_slice(&ciphertext);
    out
}

pub struct UnwrappedClientKey {
    pub cipher_key: [u8; 32],
    pub hmac_key: [u8; 32],
    pub metadata: Vec<u8>,
}

pub fn unwrap_client_key(
    server_key: &[u8; 32],
    wkc: &[u8],
    crypto: &CryptoProvider,
) -> Result<UnwrappedClientKey, ProtoError> {
    if wkc.len() < 12 + crypto.aead.tag_len() + 64 {
        return Err(ProtoError::WkcUnwrapFailed);
    }
    let (nonce, ciphertext) = wkc.split_at(12);
    let plaintext = crypto
        .aead
        .open(server_key, nonce, &[], ciphertext)
        .map_err(|_| ProtoError::WkcUnwrapFailed)?;
    if plaintext.len() < 64 {
        return Err(ProtoError::WkcUnwrapFailed);
    }
    let mut cipher_key = [0u8; 32];
    let mut hmac_key = [0u8; 32];
    cipher_key.copy_from_slice(&plaintext[..32]);
    hmac_key.copy_from_slice(&plaintext[32..64]);
    Ok(UnwrappedClientKey {
        cipher_key,
        hmac_key,
        metadata: plaintext[64..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeAead, FakeCtr, FakeMac};

    fn test_crypto() -> CryptoProvider {
        CryptoProvider {
            rng: Box::new(crate::testutil::CountingRng::default()),
            mac: Box::new(FakeMac),
            aead: Box::new(FakeAead),
            cbc: Box::new(crate::testutil::FakeCbc),
            ctr: Box::new(FakeCtr),
        }
    }

    fn keys() -> DirectionalKeys {
        DirectionalKeys {
            encrypt_cipher_key: [1u8; 32],
            encrypt_hmac_key: [2u8; 32],
            decrypt_cipher_key: [1u8; 32],
            decrypt_hmac_key: [2u8; 32],
        }
    }

    fn plain_body(src: ProtoSessionId) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(src.as_bytes());
        body.push(0); // ack_len
        body.extend_from_slice(&7u32.to_be_bytes()); // msg_id
        body.extend_from_slice(b"hello");
        body
    }

    #[test]
    fn plain_mode_is_pass_through() {
        let crypto = test_crypto();
        let mut wrap = CtrlWrap::new(WrapMode::Plain, None, TimePoint::ZERO, 64, 0, 1 << 24);
        let body = plain_body(ProtoSessionId::from_bytes([9; 8]));
        let wire = wrap.wrap(0x20, &body, &crypto).unwrap();
        let (header, rest) = wrap.unwrap(&wire, TimePoint::ZERO, &crypto).unwrap();
        assert_eq!(header, 0x20);
        assert_eq!(rest, body);
    }

    #[test]
    fn tls_auth_round_trips_and_detects_tamper() {
        let crypto = test_crypto();
        let mut send = CtrlWrap::new(WrapMode::TlsAuth, Some(keys()), TimePoint::ZERO, 64, 0, 1 << 24);
        let mut recv = CtrlWrap::new(WrapMode::TlsAuth, Some(keys()), TimePoint::ZERO, 64, 0, 1 << 24);
        let body = plain_body(ProtoSessionId::from_bytes([9; 8]));
        let wire = send.wrap(0x38, &body, &crypto).unwrap();
        let (header, rest) = recv.unwrap(&wire, TimePoint::ZERO, &crypto).unwrap();
        assert_eq!(header, 0x38);
        assert_eq!(rest, body);

        let mut tampered = wire.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xff;
        assert!(matches!(
            recv.unwrap(&tampered, TimePoint::ZERO, &crypto),
            Err(ProtoError::Kind(ProtoErrorKind::Hmac))
        ));
    }

    #[test]
    fn tls_auth_rejects_replayed_packet_id() {
        let crypto = test_crypto();
        let mut send = CtrlWrap::new(WrapMode::TlsAuth, Some(keys()), TimePoint::ZERO, 64, 0, 1 << 24);
        let mut recv = CtrlWrap::new(WrapMode::TlsAuth, Some(keys()), TimePoint::ZERO, 64, 0, 1 << 24);
        let body = plain_body(ProtoSessionId::from_bytes([9; 8]));
        let wire = send.wrap(0x38, &body, &crypto).unwrap();
        recv.unwrap(&wire, TimePoint::ZERO, &crypto).unwrap();
        assert!(matches!(
            recv.unwrap(&wire, TimePoint::ZERO, &crypto),
            Err(ProtoError::Kind(ProtoErrorKind::Replay))
        ));
    }

    #[test]
    fn tls_crypt_round_trips_and_detects_tamper() {
        let crypto = test_crypto();
        let mut send = CtrlWrap::new(WrapMode::TlsCrypt, Some(keys()), TimePoint::ZERO, 64, 0, 1 << 24);
        let mut recv = CtrlWrap::new(WrapMode::TlsCrypt, Some(keys()), TimePoint::ZERO, 64, 0, 1 << 24);
        let body = plain_body(ProtoSessionId::from_bytes([9; 8]));
        let wire = send.wrap(0x3a, &body, &crypto).unwrap();
        let (header, rest) = recv.unwrap(&wire, TimePoint::ZERO, &crypto).unwrap();
        assert_eq!(header, 0x3a);
        assert_eq!(rest, body);

        let mut tampered = wire.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xff;
        assert!(recv.unwrap(&tampered, TimePoint::ZERO, &crypto).is_err());
    }

    #[test]
    fn pre_validate_accepts_good_packet_and_rejects_bad_one() {
        let crypto = test_crypto();
        let mut send = CtrlWrap::new(WrapMode::TlsCrypt, Some(keys()), TimePoint::ZERO, 64, 0, 1 << 24);
        let validator = CtrlWrap::new(WrapMode::TlsCrypt, Some(keys()), TimePoint::ZERO, 64, 0, 1 << 24);
        let body = plain_body(ProtoSessionId::from_bytes([9; 8]));
        let wire = send.wrap(0x3a, &body, &crypto).unwrap();
        assert!(validator.pre_validate(&wire, &crypto));

        let mut tampered = wire.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xff;
        assert!(!validator.pre_validate(&tampered, &crypto));
    }

    #[test]
    fn wrapped_client_key_round_trips_and_rejects_corruption() {
        let crypto = test_crypto();
        let server_key = [7u8; 32];
        let wkc = wrap_client_key(
            &server_key,
            &[11u8; 32],
            &[22u8; 32],
            b"meta",
            &[1u8; 12],
            &crypto,
        );
        let unwrapped = unwrap_client_key(&server_key, &wkc, &crypto).unwrap();
        assert_eq!(unwrapped.cipher_key, [11u8; 32]);
        assert_eq!(unwrapped.hmac_key, [22u8; 32]);
        assert_eq!(unwrapped.metadata, b"meta");

        let mut corrupted = wkc.clone();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xff;
        assert!(unwrap_client_key(&server_key, &corrupted, &crypto).is_err());
    }
}
