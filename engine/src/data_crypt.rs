//! Data-channel encryption: AEAD and legacy CBC+HMAC framing, replay
//! protection, per-key byte limits, the legacy compression stub, and TCP MSS
//! fixing (spec §4.5).

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{CryptoProvider, Rng};
use crate::error::{ProtoError, ProtoErrorKind};
use crate::packet::{DataPacket, KeyId, OpCode, PacketHeader, PeerId};
use crate::packet_id::{PacketIdReceive, PacketIdSend, PacketIdStatus};
use crate::time::TimePoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    Aead,
    Cbc,
}

impl CipherSuite {
    /// Maps an OpenVPN `cipher`/`auth` option name (as seen in a push-reply
    /// or `--cipher`/`--auth`) to the suite that negotiates it. Returns
    /// `None` for names this engine doesn't implement, so callers can
    /// reject or ignore an unsupported push rather than silently
    /// mis-classifying it.
    pub fn from_name(name: &str) -> Option<CipherSuite> {
        match name.to_ascii_uppercase().as_str() {
            "AES-128-GCM" | "AES-192-GCM" | "AES-256-GCM" | "CHACHA20-POLY1305" => {
                Some(CipherSuite::Aead)
            }
            "AES-128-CBC" | "AES-192-CBC" | "AES-256-CBC" | "BF-CBC" | "DES-EDE3-CBC" => {
                Some(CipherSuite::Cbc)
            }
            _ => None,
        }
    }
}

/// Derived per-direction data-channel key material. Zeroed on drop per the
/// crate-wide key-handling discipline.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKeys {
    pub encrypt_cipher_key: Vec<u8>,
    pub encrypt_hmac_key: [u8; 32],
    pub encrypt_nonce_tail: [u8; 8],
    pub decrypt_cipher_key: Vec<u8>,
    pub decrypt_hmac_key: [u8; 32],
    pub decrypt_nonce_tail: [u8; 8],
}

/// Per-direction byte counter for 64-bit-block ciphers
/// (`OPENVPN_BS64_DATA_LIMIT`, spec §4.5/§9). Exceeding the limit doesn't
/// fail the packet; it signals the owning `KeyContext` to schedule (or
/// queue) a renegotiation.
pub struct ByteLimit {
    limit: u64,
    encrypted: u64,
    decrypted: u64,
}

impl ByteLimit {
    pub fn new(limit: u64) -> Self {
        ByteLimit {
            limit,
            encrypted: 0,
            decrypted: 0,
        }
    }

    fn record_encrypt(&mut self, n: u64) -> bool {
        self.encrypted += n;
        self.encrypted >= self.limit
    }

    fn record_decrypt(&mut self, n: u64) -> bool {
        self.decrypted += n;
        self.decrypted >= self.limit
    }
}

pub struct DataCrypt {
    suite: CipherSuite,
    keys: DataKeys,
    send_pid: PacketIdSend,
    recv_pid: PacketIdReceive,
    data_v2: bool,
    peer_id: Option<PeerId>,
    byte_limit: Option<ByteLimit>,
    key_limit_hit: bool,
}

impl DataCrypt {
    pub fn new(
        suite: CipherSuite,
        keys: DataKeys,
        wide: bool,
        data_v2: bool,
        peer_id: Option<PeerId>,
        replay_window: u32,
        warn_margin: u64,
        byte_limit: Option<u64>,
    ) -> Self {
        DataCrypt {
            suite,
            keys,
            send_pid: PacketIdSend::new(wide, warn_margin),
            recv_pid: PacketIdReceive::new(replay_window, false, 0),
            data_v2,
            peer_id,
            byte_limit: byte_limit.map(ByteLimit::new),
            key_limit_hit: false,
        }
    }

    pub fn key_limit_hit(&self) -> bool {
        self.key_limit_hit
    }

    pub fn has_byte_limit(&self) -> bool {
        self.byte_limit.is_some()
    }

    fn header_bytes(&self, key_id: KeyId) -> Vec<u8> {
        let opcode = if self.data_v2 { OpCode::DataV2 } else { OpCode::DataV1 };
        let header = PacketHeader { opcode, key_id };
        let mut out = vec![header.to_byte()];
        if self.data_v2 {
            let peer_id = self.peer_id.unwrap_or(PeerId::UNSET).value();
            let bytes = peer_id.to_be_bytes();
            out.extend_from_slice(&bytes[1..]);
        }
        out
    }

    pub fn encrypt(
        &mut self,
        key_id: KeyId,
        plaintext: &[u8],
        crypto: &CryptoProvider,
        rng: &mut dyn Rng,
    ) -> Result<Vec<u8>, ProtoError> {
        let header = self.header_bytes(key_id);
        let pkt_id = self.send_pid.next()?;

        let mut out = header.clone();
        match self.suite {
            CipherSuite::Aead => {
                out.extend_from_slice(&(pkt_id as u32).to_be_bytes());
                let mut nonce = Vec::with_capacity(12);
                nonce.extend_from_slice(&(pkt_id as u32).to_be_bytes());
                nonce.extend_from_slice(&self.keys.encrypt_nonce_tail);
                let ciphertext = crypto.aead.seal(&self.keys.encrypt_cipher_key, &nonce, &header, plaintext);
                out.extend_from_slice(&ciphertext);
            }
            CipherSuite::Cbc => {
                let mut iv = [0u8; 16];
                rng.fill_bytes(&mut iv);
                let mut plain_with_id = Vec::with_capacity(4 + plaintext.len());
                plain_with_id.extend_from_slice(&(pkt_id as u32).to_be_bytes());
                plain_with_id.extend_from_slice(plaintext);
                let ciphertext = crypto.cbc.encrypt(&self.keys.encrypt_cipher_key, &iv, &plain_with_id);

                let mut mac_input = Vec::with_capacity(16 + ciphertext.len());
                mac_input.extend_from_slice(&iv);
                mac_input.extend_from_slice(&ciphertext);
                let tag = crypto.mac.mac(&self.keys.encrypt_hmac_key, &mac_input);

                out.extend_from_slice(&tag);
                out.extend_from_slice(&iv);
                out.extend_from_slice(&ciphertext);
            }
        }

        if let Some(limit) = &mut self.byte_limit {
            if limit.record_encrypt(plaintext.len() as u64) {
                self.key_limit_hit = true;
            }
        }
        Ok(out)
    }

    pub fn decrypt(&mut self, wire: &[u8], crypto: &CryptoProvider) -> Result<Vec<u8>, ProtoError> {
        let packet = DataPacket::parse(wire).map_err(|e| ProtoErrorKind::Buffer(e))?;
        let header_len = if packet.peer_id.is_some() { 4 } else { 1 };
        let header = &wire[..header_len];

        let plaintext = match self.suite {
            CipherSuite::Aead => {
                if packet.payload.len() < 4 {
                    return Err(ProtoErrorKind::Buffer(crate::error::WireError::TooShort {
                        need: 4,
                        got: packet.payload.len(),
                    })
                    .into());
                }
                let (pkt_id_bytes, ciphertext) = packet.payload.split_at(4);
                let pkt_id = u32::from_be_bytes(pkt_id_bytes.try_into().unwrap());
                self.check_replay(pkt_id)?;

                let mut nonce = Vec::with_capacity(12);
                nonce.extend_from_slice(pkt_id_bytes);
                nonce.extend_from_slice(&self.keys.decrypt_nonce_tail);
                crypto
                    .aead
                    .open(&self.keys.decrypt_cipher_key, &nonce, header, ciphertext)
                    .map_err(|_| ProtoErrorKind::Decrypt)?
            }
            CipherSuite::Cbc => {
                let mac_len = crypto.mac.output_len();
                if packet.payload.len() < mac_len + 16 {
                    return Err(ProtoErrorKind::Buffer(crate::error::WireError::TooShort {
                        need: mac_len + 16,
                        got: packet.payload.len(),
                    })
                    .into());
                }
                let (tag, rest) = packet.payload.split_at(mac_len);
                let (iv, ciphertext) = rest.split_at(16);

                let mut mac_input = Vec::with_capacity(iv.len() + ciphertext.len());
                mac_input.extend_from_slice(iv);
                mac_input.extend_from_slice(ciphertext);
                if !crypto.mac.verify(&self.keys.decrypt_hmac_key, &mac_input, tag) {
                    return Err(ProtoErrorKind::Hmac.into());
                }

                let plain_with_id = crypto
                    .cbc
                    .decrypt(&self.keys.decrypt_cipher_key, iv, ciphertext)
                    .map_err(|_| ProtoErrorKind::Decrypt)?;
                if plain_with_id.len() < 4 {
                    return Err(ProtoErrorKind::Decrypt.into());
                }
                let pkt_id = u32::from_be_bytes(plain_with_id[..4].try_into().unwrap());
                self.check_replay(pkt_id)?;
                plain_with_id[4..].to_vec()
            }
        };

        if let Some(limit) = &mut self.byte_limit {
            if limit.record_decrypt(plaintext.len() as u64) {
                self.key_limit_hit = true;
            }
        }
        Ok(plaintext)
    }

    fn check_replay(&mut self, pkt_id: u32) -> Result<(), ProtoError> {
        match self.recv_pid.test_add(pkt_id as u64, 0, TimePoint::ZERO, true) {
            PacketIdStatus::Success => Ok(()),
            PacketIdStatus::Replay => Err(ProtoErrorKind::Replay.into()),
            PacketIdStatus::Backtrack | PacketIdStatus::Expire => Err(ProtoErrorKind::Backtrack.into()),
            PacketIdStatus::Invalid | PacketIdStatus::TimeBacktrack => {
                Err(ProtoErrorKind::CcError("invalid data packet id").into())
            }
        }
    }
}

/// Legacy one-byte "no-compress" marker prepended to outbound plaintext
/// when a compression stub is negotiated (spec §4.5). Chosen to match the
/// value OpenVPN's `comp-stub` reserves for "no compression was applied".
pub const NO_COMPRESS_BYTE: u8 = 0xfa;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionStub {
    /// No compression stub negotiated: payload passes through unmodified.
    None,
    /// v1 stub: always prepends/strips `NO_COMPRESS_BYTE`.
    V1,
    /// v2 stub: omits the marker byte when the plaintext's own first byte
    /// cannot be confused with a compression opcode.
    V2,
}

impl CompressionStub {
    pub fn frame(self, plaintext: &[u8]) -> Vec<u8> {
        match self {
            CompressionStub::None => plaintext.to_vec(),
            CompressionStub::V1 => {
                let mut out = Vec::with_capacity(1 + plaintext.len());
                out.push(NO_COMPRESS_BYTE);
                out.extend_from_slice(plaintext);
                out
            }
            CompressionStub::V2 => {
                if plaintext.first() == Some(&NO_COMPRESS_BYTE) {
                    let mut out = Vec::with_capacity(1 + plaintext.len());
                    out.push(NO_COMPRESS_BYTE);
                    out.extend_from_slice(plaintext);
                    out
                } else {
                    plaintext.to_vec()
                }
            }
        }
    }

    pub fn unframe(self, framed: &[u8]) -> Vec<u8> {
        match self {
            CompressionStub::None => framed.to_vec(),
            CompressionStub::V1 => framed.get(1..).map(|s| s.to_vec()).unwrap_or_default(),
            CompressionStub::V2 => {
                if framed.first() == Some(&NO_COMPRESS_BYTE) {
                    framed.get(1..).map(|s| s.to_vec()).unwrap_or_default()
                } else {
                    framed.to_vec()
                }
            }
        }
    }
}

/// Rewrites the TCP MSS option of a tunnelled IPv4/TCP SYN segment in place
/// so it does not exceed `target_mss`, recomputing the TCP checksum (spec
/// §4.5 "MSS fixing"). No-op if the buffer isn't an IPv4/TCP SYN segment
/// with an MSS option, or if the existing MSS already fits.
pub fn fix_tcp_mss(packet: &mut [u8], target_mss: u16) {
    const IP_PROTO_TCP: u8 = 6;
    if packet.len() < 20 || packet[0] >> 4 != 4 {
        return;
    }
    let ihl = ((packet[0] & 0x0f) as usize) * 4;
    if packet.len() < ihl + 20 || packet[9] != IP_PROTO_TCP {
        return;
    }
    let tcp = &mut packet[ihl..];
    let flags = tcp[13];
    const SYN: u8 = 0x02;
    if flags & SYN == 0 {
        return;
    }
    let data_offset = ((tcp[12] >> 4) as usize) * 4;
    if tcp.len() < data_offset {
        return;
    }
    let mut opt_offset = 20;
    while opt_offset + 1 < data_offset {
        let kind = tcp[opt_offset];
        if kind == 0 {
            break;
        }
        if kind == 1 {
            opt_offset += 1;
            continue;
        }
        if opt_offset + 1 >= data_offset {
            break;
        }
        let len = tcp[opt_offset + 1] as usize;
        if len < 2 || opt_offset + len > data_offset {
            break;
        }
        if kind == 2 && len == 4 {
            let current = u16::from_be_bytes([tcp[opt_offset + 2], tcp[opt_offset + 3]]);
            if current > target_mss {
                let bytes = target_mss.to_be_bytes();
                tcp[opt_offset + 2] = bytes[0];
                tcp[opt_offset + 3] = bytes[1];
                recompute_tcp_checksum(packet, ihl);
            }
            return;
        }
        opt_offset += len;
    }
}

fn recompute_tcp_checksum(packet: &mut [u8], ihl: usize) {
    let total_len = packet.len();
    let src = [packet[12], packet[13], packet[14], packet[15]];
    let dst = [packet[16], packet[17], packet[18], packet[19]];
    let tcp_len = total_len - ihl;

    packet[ihl + 16] = 0;
    packet[ihl + 17] = 0;

    let mut sum: u32 = 0;
    sum += u16::from_be_bytes([src[0], src[1]]) as u32;
    sum += u16::from_be_bytes([src[2], src[3]]) as u32;
    sum += u16::from_be_bytes([dst[0], dst[1]]) as u32;
    sum += u16::from_be_bytes([dst[2], dst[3]]) as u32;
    sum += IP_PROTO_TCP_U32;
    sum += tcp_len as u32;

    let tcp_segment = &packet[ihl..];
    let mut i = 0;
    while i + 1 < tcp_segment.len() {
        sum += u16::from_be_bytes([tcp_segment[i], tcp_segment[i + 1]]) as u32;
        i += 2;
    }
    if i < tcp_segment.len() {
        sum += (tcp_segment[i] as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    let checksum = !(sum as u16);
    let bytes = checksum.to_be_bytes();
    packet[ihl + 16] = bytes[0];
    packet[ihl + 17] = bytes[1];
}

const IP_PROTO_TCP_U32: u32 = 6;
