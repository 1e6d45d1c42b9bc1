//! KeyContext: one SSL/TLS session, its derived data keys, and the
//! INITIAL -> WAIT_RESET -> WAIT_RESET_ACK -> WAIT_AUTH -> WAIT_AUTH_ACK ->
//! ACTIVE lifecycle (spec §4.3). Owns its own reliability send/receive
//! queues for the opaque control-message stream (hard-reset marker, TLS
//! handshake records, the AUTH payload, and post-handshake application
//! messages); `ProtoEngine` is responsible for wrapping/unwrapping those
//! messages onto the wire via `CtrlWrap` and `packet::ControlPacket`.

use tracing::{debug, info, warn};

use crate::config::{Mode, ProtoConfig};
use crate::crypto::{CryptoProvider, Rng, SslSession};
use crate::data_crypt::{CipherSuite, DataCrypt, DataKeys};
use crate::error::{ProtoError, ProtoErrorKind};
use crate::packet::{KeyId, PeerId};
use crate::reliability::{ReceiveFlags, ReliableRecv, ReliableSend};
use crate::time::TimePoint;

const DATAKEYS_EXPORT_LABEL: &str = "EXPORTER-OpenVPN-datakeys";
const DATAKEYS_EXPORT_LEN: usize = 128;

/// AUTH payload prefix: a fixed key-method-2 marker (spec §4.3).
const AUTH_PREFIX: [u8; 5] = [0, 0, 0, 0, 2];
const AUTH_NONCE_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Initial,
    WaitReset,
    WaitResetAck,
    WaitAuth,
    WaitAuthAck,
    Active,
}

/// Scheduled key-lifecycle events (spec §4.3 "Primary/secondary lifecycle",
/// "Renegotiation triggers", "Handshake deadline").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KevEvent {
    /// Handshake did not complete within `handshake_window`.
    Negotiate,
    /// This (secondary) context should swap in as primary.
    BecomePrimary,
    /// `construct_time + renegotiate` reached; start a new secondary.
    Renegotiate,
    /// Old primary exceeded `expire` with no successor; destroy it.
    Expire,
    /// `BecomePrimary` is due but this context has a byte limit armed and
    /// has not yet decrypted a packet under its own keys; wait rather than
    /// swap in a context that can't be proven to work.
    PrimaryPending,
}

/// The TLSPRF-nonce/options/credentials payload exchanged once over the
/// established TLS channel (spec §4.3 "AUTH payload"). All variable-length
/// fields use a 16-bit big-endian length prefix with a trailing NUL counted
/// in the length, mirroring the control-string convention of §6.5.
#[derive(Debug, Clone)]
pub struct AuthPayload {
    pub nonce: [u8; AUTH_NONCE_LEN],
    pub options: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub peer_info: Option<String>,
}

impl AuthPayload {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&AUTH_PREFIX);
        out.extend_from_slice(&self.nonce);
        write_len_prefixed(&mut out, &self.options);
        if let Some(username) = &self.username {
            write_len_prefixed(&mut out, username);
            write_len_prefixed(&mut out, self.password.as_deref().unwrap_or(""));
            write_len_prefixed(&mut out, self.peer_info.as_deref().unwrap_or(""));
        }
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, ProtoError> {
        if data.len() < AUTH_PREFIX.len() + AUTH_NONCE_LEN || data[..AUTH_PREFIX.len()] != AUTH_PREFIX {
            return Err(ProtoErrorKind::CcError("malformed AUTH payload prefix").into());
        }
        let mut offset = AUTH_PREFIX.len();
        let mut nonce = [0u8; AUTH_NONCE_LEN];
        nonce.copy_from_slice(&data[offset..offset + AUTH_NONCE_LEN]);
        offset += AUTH_NONCE_LEN;

        let options = read_len_prefixed(data, &mut offset)?;
        let (username, password, peer_info) = if offset < data.len() {
            let username = read_len_prefixed(data, &mut offset)?;
            let password = read_len_prefixed(data, &mut offset)?;
            let peer_info = read_len_prefixed(data, &mut offset)?;
            (Some(username), Some(password), Some(peer_info))
        } else {
            (None, None, None)
        };

        Ok(AuthPayload {
            nonce,
            options,
            username,
            password,
            peer_info,
        })
    }
}

fn write_len_prefixed(out: &mut Vec<u8>, s: &str) {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(&bytes);
}

fn read_len_prefixed(data: &[u8], offset: &mut usize) -> Result<String, ProtoError> {
    if data.len() < *offset + 2 {
        return Err(ProtoErrorKind::CcError("truncated AUTH payload length prefix").into());
    }
    let len = u16::from_be_bytes([data[*offset], data[*offset + 1]]) as usize;
    *offset += 2;
    if data.len() < *offset + len || len == 0 {
        return Err(ProtoErrorKind::CcError("AUTH payload field overruns buffer").into());
    }
    let field = &data[*offset..*offset + len];
    *offset += len;
    if field[len - 1] != 0 {
        return Err(ProtoErrorKind::CcError("AUTH payload field missing trailing NUL").into());
    }
    std::str::from_utf8(&field[..len - 1])
        .map(str::to_owned)
        .map_err(|_| ProtoErrorKind::CcError("AUTH payload field is not valid UTF-8").into())
}

/// One key's full lifecycle: TLS session, reliability queues, derived data
/// keys, and the INITIAL..ACTIVE state machine (spec §3 "KeyContext", §4.3).
pub struct KeyContext {
    pub key_id: KeyId,
    mode: Mode,
    state: KeyState,
    tls_session: Box<dyn SslSession>,
    rel_send: ReliableSend,
    rel_recv: ReliableRecv,
    send_msg_id: u32,
    auth_msg_id: Option<u32>,
    pending_outbound: Vec<(u32, Vec<u8>)>,
    pending_acks: Vec<u32>,
    received_app_messages: Vec<Vec<u8>>,
    data_crypt: Option<DataCrypt>,
    cipher_suite: CipherSuite,
    data_v2: bool,
    peer_id: Option<PeerId>,
    data_replay_window: u32,
    wide_packet_id: bool,
    packet_id_warn_margin: u64,
    bs64_data_limit: Option<u64>,

    pub construct_time: TimePoint,
    reached_active_time: Option<TimePoint>,
    next_event: Option<KevEvent>,
    next_event_time: Option<TimePoint>,

    pub is_primary: bool,
    received_any_data: bool,
    peer_supports_exit_notify: bool,
}

impl KeyContext {
    pub fn new(
        key_id: KeyId,
        is_primary: bool,
        tls_session: Box<dyn SslSession>,
        construct_time: TimePoint,
        config: &ProtoConfig,
    ) -> Self {
        KeyContext {
            key_id,
            mode: config.mode,
            state: KeyState::Initial,
            tls_session,
            rel_send: ReliableSend::new(config.reliable_ring_size, config.tls_timeout, config.tls_timeout_cap),
            rel_recv: ReliableRecv::new(config.reliable_ring_size),
            send_msg_id: 0,
            auth_msg_id: None,
            pending_outbound: Vec::new(),
            pending_acks: Vec::new(),
            received_app_messages: Vec::new(),
            data_crypt: None,
            cipher_suite: CipherSuite::Aead,
            data_v2: false,
            peer_id: None,
            data_replay_window: config.data_replay_window,
            wide_packet_id: config.wide_packet_id,
            packet_id_warn_margin: config.packet_id_wrap_warn_margin as u64,
            bs64_data_limit: Some(config.bs64_data_limit),
            construct_time,
            reached_active_time: None,
            next_event: Some(KevEvent::Negotiate),
            next_event_time: Some(construct_time + config.handshake_window),
            is_primary,
            received_any_data: false,
            peer_supports_exit_notify: false,
        }
    }

    pub fn state(&self) -> KeyState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == KeyState::Active
    }

    pub fn data_channel_ready(&self) -> bool {
        self.state == KeyState::Active && self.data_crypt.is_some()
    }

    pub fn set_cipher_suite(&mut self, suite: CipherSuite) {
        self.cipher_suite = suite;
    }

    /// Whether the peer's AUTH payload advertised `IV_PROTO`'s
    /// `CC_EXIT_NOTIFY` bit (spec §6.2), i.e. whether it understands an
    /// in-band `EXIT` control message rather than the data-channel sentinel.
    pub fn peer_supports_exit_notify(&self) -> bool {
        self.peer_supports_exit_notify
    }

    pub fn set_data_v2(&mut self, data_v2: bool, peer_id: Option<PeerId>) {
        self.data_v2 = data_v2;
        self.peer_id = peer_id;
    }

    /// Begins the handshake: INITIAL -> WAIT_RESET, queueing the (empty)
    /// hard-reset control message for the reliability layer to carry.
    pub fn start(&mut self, now: TimePoint) -> Result<(), ProtoError> {
        if self.state != KeyState::Initial {
            return Ok(());
        }
        self.state = KeyState::WaitReset;
        self.queue_control_message(Vec::new(), now)?;
        info!(key_id = self.key_id.value(), "key context sending hard reset");
        Ok(())
    }

    fn queue_control_message(&mut self, payload: Vec<u8>, now: TimePoint) -> Result<u32, ProtoError> {
        let msg_id = self.send_msg_id;
        self.send_msg_id += 1;
        self.rel_send.send(msg_id, payload.clone(), now)?;
        // `ReliableSend::send` only schedules the *retransmit* timer; the
        // first transmission is the caller's job, so stash it for immediate
        // pickup rather than waiting for the base timeout to elapse.
        self.pending_outbound.push((msg_id, payload));
        Ok(msg_id)
    }

    /// Newly queued messages that have never been sent on the wire yet.
    pub fn take_pending_outbound(&mut self) -> Vec<(u32, Vec<u8>)> {
        std::mem::take(&mut self.pending_outbound)
    }

    /// Message ids received since the last call that still owe the sender
    /// an ACK, piggybacked onto the next outbound packet or sent standalone
    /// (spec §4.2 "Receive side").
    pub fn take_pending_acks(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.pending_acks)
    }

    /// Messages due for retransmission right now, as `(msg_id, payload)`.
    pub fn due_retransmits(&mut self, now: TimePoint) -> Vec<(u32, Vec<u8>)> {
        self.rel_send.retransmit(now)
    }

    pub fn until_retransmit(&self, now: TimePoint) -> Option<std::time::Duration> {
        self.rel_send.until_retransmit(now)
    }

    pub fn ack_ids(&mut self, ids: &[u32]) {
        for id in ids {
            if self.rel_send.ack(*id) && self.state == KeyState::WaitAuthAck && Some(*id) == self.auth_msg_id {
                self.transition_to_active();
            }
        }
    }

    fn transition_to_active(&mut self) {
        self.state = KeyState::Active;
        info!(key_id = self.key_id.value(), "key context reached ACTIVE");
    }

    /// Queues an application control message over the already-established
    /// TLS channel (spec §4.6 `control_send`). Only meaningful once ACTIVE;
    /// callers are expected to have checked that already.
    pub fn send_app_message(&mut self, data: &[u8], now: TimePoint) -> Result<(), ProtoError> {
        self.tls_session.write_cleartext(data)?;
        self.flush_tls_outbound(now)
    }

    /// Drains application messages received over the TLS channel since the
    /// last call (spec §4.6: delivered to the embedding application, not
    /// interpreted by the engine itself).
    pub fn take_received_app_messages(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.received_app_messages)
    }

    /// Feeds one inbound control message into the reliability receive
    /// window, then drives the state machine for every message that
    /// becomes sequenced as a result.
    pub fn control_recv(
        &mut self,
        msg_id: u32,
        payload: Vec<u8>,
        now: TimePoint,
        crypto: &CryptoProvider,
        rng: &mut dyn Rng,
    ) -> Result<ReceiveFlags, ProtoError> {
        let flags = self.rel_recv.receive(msg_id, payload);
        if flags.ack_to_sender {
            self.pending_acks.push(msg_id);
        }
        while let Some(msg) = self.rel_recv.next_sequenced().map(<[u8]>::to_vec) {
            self.rel_recv.advance();
            self.handle_sequenced_message(msg, now, crypto, rng)?;
        }
        Ok(flags)
    }

    fn handle_sequenced_message(
        &mut self,
        msg: Vec<u8>,
        now: TimePoint,
        crypto: &CryptoProvider,
        rng: &mut dyn Rng,
    ) -> Result<(), ProtoError> {
        match self.state {
            KeyState::Initial | KeyState::WaitReset => {
                self.state = KeyState::WaitResetAck;
                self.tls_session.start_handshake()?;
                self.flush_tls_outbound(now)?;
            }
            KeyState::WaitResetAck | KeyState::WaitAuth => {
                self.tls_session.read_ciphertext(&msg)?;
                self.flush_tls_outbound(now)?;
                if self.state == KeyState::WaitResetAck && self.tls_session.is_handshake_complete() {
                    self.state = KeyState::WaitAuth;
                    self.send_auth_payload(now, rng)?;
                }
                let mut buf = [0u8; 4096];
                let n = self.tls_session.read_cleartext(&mut buf)?;
                if n > 0 && self.state == KeyState::WaitAuth {
                    let auth = AuthPayload::parse(&buf[..n])?;
                    debug!(options = %auth.options, "received peer AUTH payload");
                    if let Some(peer_info) = &auth.peer_info {
                        let info = crate::options::parse_peer_info(peer_info);
                        self.peer_supports_exit_notify =
                            info.proto_flags.contains(crate::options::IvProtoFlags::CC_EXIT_NOTIFY);
                    }
                    self.establish_data_keys(crypto)?;
                    self.state = KeyState::WaitAuthAck;
                }
            }
            KeyState::WaitAuthAck | KeyState::Active => {
                self.tls_session.read_ciphertext(&msg)?;
                self.flush_tls_outbound(now)?;
                let mut buf = [0u8; 4096];
                loop {
                    let n = self.tls_session.read_cleartext(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    self.received_app_messages.push(buf[..n].to_vec());
                }
            }
        }
        Ok(())
    }

    fn flush_tls_outbound(&mut self, now: TimePoint) -> Result<(), ProtoError> {
        loop {
            let ct = self.tls_session.write_ciphertext()?;
            if ct.is_empty() {
                break;
            }
            self.queue_control_message(ct, now)?;
        }
        Ok(())
    }

    fn send_auth_payload(&mut self, now: TimePoint, rng: &mut dyn Rng) -> Result<(), ProtoError> {
        let mut nonce = [0u8; AUTH_NONCE_LEN];
        rng.fill_bytes(&mut nonce);
        let auth = AuthPayload {
            nonce,
            options: String::new(),
            username: if self.mode.is_client_mode() { Some(String::new()) } else { None },
            password: if self.mode.is_client_mode() { Some(String::new()) } else { None },
            peer_info: if self.mode.is_client_mode() { Some(String::new()) } else { None },
        };
        self.tls_session.write_cleartext(&auth.serialize())?;
        self.flush_tls_outbound(now)?;
        // The AUTH write is itself a reliability-tracked message once it's
        // been wrapped into ciphertext control records above; we record the
        // most recently queued id as the one whose ACK promotes us to
        // ACTIVE.
        self.auth_msg_id = Some(self.send_msg_id.saturating_sub(1));
        Ok(())
    }

    fn establish_data_keys(&mut self, crypto: &CryptoProvider) -> Result<(), ProtoError> {
        let material = self
            .tls_session
            .export_keying_material(DATAKEYS_EXPORT_LABEL, DATAKEYS_EXPORT_LEN)?;
        if material.len() < DATAKEYS_EXPORT_LEN {
            return Err(ProtoErrorKind::CcError("keying-material export too short").into());
        }
        let (client_half, server_half) = material.split_at(DATAKEYS_EXPORT_LEN / 2);
        let (encrypt_src, decrypt_src) = if self.mode.is_client_mode() {
            (client_half, server_half)
        } else {
            (server_half, client_half)
        };

        let keys = match self.cipher_suite {
            CipherSuite::Aead => DataKeys {
                encrypt_cipher_key: encrypt_src[..32].to_vec(),
                encrypt_hmac_key: [0u8; 32],
                encrypt_nonce_tail: encrypt_src[32..40].try_into().unwrap(),
                decrypt_cipher_key: decrypt_src[..32].to_vec(),
                decrypt_hmac_key: [0u8; 32],
                decrypt_nonce_tail: decrypt_src[32..40].try_into().unwrap(),
            },
            CipherSuite::Cbc => DataKeys {
                encrypt_cipher_key: encrypt_src[..32].to_vec(),
                encrypt_hmac_key: encrypt_src[32..64].try_into().unwrap(),
                encrypt_nonce_tail: [0u8; 8],
                decrypt_cipher_key: decrypt_src[..32].to_vec(),
                decrypt_hmac_key: decrypt_src[32..64].try_into().unwrap(),
                decrypt_nonce_tail: [0u8; 8],
            },
        };

        let _ = crypto; // crypto is reserved for cipher-aware key sizing; kept for API symmetry.
        // OPENVPN_BS64_DATA_LIMIT only applies to 64-bit-block ciphers (spec
        // §4.5); arming it for AEAD would permanently block BECOME_PRIMARY,
        // since nothing ever sends data under a not-yet-primary key to clear
        // the "has this key carried traffic" gate below.
        let byte_limit = match self.cipher_suite {
            CipherSuite::Cbc => self.bs64_data_limit,
            CipherSuite::Aead => None,
        };
        self.data_crypt = Some(DataCrypt::new(
            self.cipher_suite,
            keys,
            self.wide_packet_id,
            self.data_v2,
            self.peer_id,
            self.data_replay_window,
            self.packet_id_warn_margin,
            byte_limit,
        ));
        Ok(())
    }

    pub fn data_encrypt(
        &mut self,
        key_id: KeyId,
        plaintext: &[u8],
        crypto: &CryptoProvider,
        rng: &mut dyn Rng,
    ) -> Result<Vec<u8>, ProtoError> {
        let dc = self.data_crypt.as_mut().ok_or(ProtoError::NoPrimaryKey)?;
        dc.encrypt(key_id, plaintext, crypto, rng)
    }

    pub fn data_decrypt(&mut self, wire: &[u8], crypto: &CryptoProvider) -> Result<Vec<u8>, ProtoError> {
        let dc = self.data_crypt.as_mut().ok_or(ProtoError::NoPrimaryKey)?;
        let plaintext = dc.decrypt(wire, crypto)?;
        self.received_any_data = true;
        Ok(plaintext)
    }

    /// True once this context's per-key byte limit has tripped (spec §4.5
    /// "Per-key byte limits"); the caller schedules renegotiation.
    pub fn check_data_limit(&self) -> bool {
        self.data_crypt.as_ref().map(DataCrypt::key_limit_hit).unwrap_or(false)
    }

    fn data_limit_armed(&self) -> bool {
        self.data_crypt.as_ref().map(DataCrypt::has_byte_limit).unwrap_or(false)
    }

    /// Re-derives the BECOME_PRIMARY -> RENEGOTIATE schedule for a context
    /// that has just swapped in as the new primary.
    pub fn promote_to_primary(&mut self, config: &ProtoConfig) {
        self.is_primary = true;
        self.next_event = Some(KevEvent::Renegotiate);
        self.next_event_time = Some(self.construct_time + config.renegotiate);
    }

    /// Marks a demoted (former) primary for expiry (spec §4.3: "the current
    /// primary, which is then marked for expiration at construct_time +
    /// expire").
    pub fn mark_expiring(&mut self, config: &ProtoConfig) {
        self.next_event = Some(KevEvent::Expire);
        self.next_event_time = Some(self.construct_time + config.expire);
    }

    /// Processes the handshake deadline, and once ACTIVE, the
    /// BECOME_PRIMARY / RENEGOTIATE / EXPIRE schedule (spec §4.3).
    pub fn housekeeping(&mut self, now: TimePoint, config: &ProtoConfig) -> Option<KevEvent> {
        if self.state != KeyState::Active {
            if now.saturating_sub(self.construct_time) >= config.handshake_window {
                warn!(key_id = self.key_id.value(), "handshake deadline exceeded");
                return Some(KevEvent::Negotiate);
            }
            return None;
        }

        if self.reached_active_time.is_none() {
            self.reached_active_time = Some(now);
            if self.is_primary {
                // The original primary never goes through `promote_to_primary`
                // (that only runs for a secondary swapping in), so its own
                // renegotiate schedule has to be set here instead.
                self.next_event = Some(KevEvent::Renegotiate);
                self.next_event_time = Some(self.construct_time + config.renegotiate);
            } else {
                self.next_event = Some(KevEvent::BecomePrimary);
                self.next_event_time = Some(now + config.become_primary);
            }
        }

        let event_time = self.next_event_time?;
        if now < event_time {
            return None;
        }

        if self.next_event == Some(KevEvent::BecomePrimary) && self.data_limit_armed() && !self.received_any_data {
            return Some(KevEvent::PrimaryPending);
        }

        let fired = self.next_event.take();
        self.next_event_time = None;
        fired
    }

    pub fn next_event_time(&self) -> Option<TimePoint> {
        self.next_event_time
    }
}

impl Mode {
    fn is_client_mode(self) -> bool {
        self == Mode::Client
    }
}
