//! Integration coverage for the testable properties and end-to-end
//! scenarios (spec §8): drives two `ProtoEngine`s against each other over an
//! in-memory wire, using the crate's own test doubles for TLS/crypto so the
//! whole control+data path runs without a real TLS stack.

use std::time::Duration;

use ovpn_proto::testutil::{CountingRng, FakeAead, FakeCbc, FakeCtr, FakeMac, LoopbackSslSession};
use ovpn_proto::{
    wrap_client_key, ConfigBuilder, CryptoProvider, CtrlWrapMode, DirectionalKeys, InvalidateReason, Mode, PacketHeader,
    ProtoEngine, Rng, SslSession, TimePoint, Transport, WrapConfig,
};

fn test_crypto() -> CryptoProvider {
    CryptoProvider {
        rng: Box::new(CountingRng::default()),
        mac: Box::new(FakeMac),
        aead: Box::new(FakeAead),
        cbc: Box::new(FakeCbc),
        ctr: Box::new(FakeCtr),
    }
}

fn plain_wrap_config() -> WrapConfig {
    WrapConfig {
        mode: CtrlWrapMode::Plain,
        keys: None,
        server_wkc_key: None,
        client_wkc: None,
    }
}

fn engine_with_config(
    wrap_config: WrapConfig,
    config: ovpn_proto::ProtoConfig,
    rng: &mut dyn Rng,
) -> ProtoEngine<impl FnMut() -> Box<dyn SslSession>> {
    let mut engine = ProtoEngine::new(config, wrap_config, || Box::new(LoopbackSslSession::new(1)), TimePoint::ZERO);
    engine.reset(TimePoint::ZERO, rng);
    engine
}

/// Drains each side's outbound queue into the other until both go quiet (or
/// the round cap is hit), simulating a lossless transport tick.
fn pump<F1, F2>(
    client: &mut ProtoEngine<F1>,
    server: &mut ProtoEngine<F2>,
    now: TimePoint,
    crypto: &CryptoProvider,
    rng: &mut dyn Rng,
) where
    F1: FnMut() -> Box<dyn SslSession>,
    F2: FnMut() -> Box<dyn SslSession>,
{
    for _ in 0..20 {
        let from_client = client.drain_outbound();
        for wire in &from_client {
            server.control_net_recv(wire, now, crypto, rng).unwrap();
        }
        let from_server = server.drain_outbound();
        for wire in &from_server {
            client.control_net_recv(wire, now, crypto, rng).unwrap();
        }
        if from_client.is_empty() && from_server.is_empty() {
            break;
        }
    }
}

/// Scenario 1 (spec §8): UDP happy path reaches an active data channel
/// within the handshake window and round-trips payload both ways.
#[test]
fn udp_happy_path_reaches_active_and_round_trips_data() {
    let crypto = test_crypto();
    let mut rng = CountingRng::default();
    let config = ConfigBuilder::new(Mode::Client)
        .transport(Transport::Udp)
        .handshake_window(Duration::from_secs(60))
        .build();
    let server_config = ConfigBuilder::new(Mode::Server)
        .transport(Transport::Udp)
        .handshake_window(Duration::from_secs(60))
        .build();
    let mut client = engine_with_config(plain_wrap_config(), config, &mut rng);
    let mut server = engine_with_config(plain_wrap_config(), server_config, &mut rng);

    client.start(TimePoint::ZERO, &crypto).unwrap();
    pump(&mut client, &mut server, TimePoint::ZERO, &crypto, &mut rng);

    assert!(client.data_channel_ready());
    assert!(server.data_channel_ready());

    let wire = client.data_encrypt(b"hello from client", &crypto, &mut rng).unwrap();
    let plaintext = server.data_decrypt(&wire, TimePoint::ZERO, &crypto).unwrap();
    assert_eq!(plaintext.as_deref(), Some(&b"hello from client"[..]));

    let wire_back = server.data_encrypt(b"hello from server", &crypto, &mut rng).unwrap();
    let plaintext_back = client.data_decrypt(&wire_back, TimePoint::ZERO, &crypto).unwrap();
    assert_eq!(plaintext_back.as_deref(), Some(&b"hello from server"[..]));
}

/// Property P3 analogue on the data plane: messages delivered out of order
/// (but within the replay window) are all accepted exactly once each; a
/// re-delivery of an already-seen id is rejected as a replay.
#[test]
fn out_of_order_data_delivery_accepted_once_each_within_window() {
    let crypto = test_crypto();
    let mut rng = CountingRng::default();
    let config = ConfigBuilder::new(Mode::Client).transport(Transport::Udp).build();
    let server_config = ConfigBuilder::new(Mode::Server).transport(Transport::Udp).build();
    let mut client = engine_with_config(plain_wrap_config(), config, &mut rng);
    let mut server = engine_with_config(plain_wrap_config(), server_config, &mut rng);

    client.start(TimePoint::ZERO, &crypto).unwrap();
    pump(&mut client, &mut server, TimePoint::ZERO, &crypto, &mut rng);

    let wires: Vec<Vec<u8>> = (0..16)
        .map(|i| client.data_encrypt(format!("msg-{i}").as_bytes(), &crypto, &mut rng).unwrap())
        .collect();

    // Deliver in reverse order: still within the default 64-entry window.
    for wire in wires.iter().rev() {
        assert!(server.data_decrypt(wire, TimePoint::ZERO, &crypto).unwrap().is_some());
    }

    // Re-delivering any of them now is a replay, not a decrypt/HMAC failure.
    let result = server.data_decrypt(&wires[5], TimePoint::ZERO, &crypto).unwrap();
    assert!(result.is_none(), "replayed packet must be dropped, not delivered");
    assert_eq!(server.stats().replay, 1);
    assert_eq!(server.stats().hmac, 0);
    assert_eq!(server.stats().decrypt, 0);
}

/// Scenario 4 (spec §8): with a 64-entry replay window, delivering id=100
/// then id=36 succeeds then backtracks (100 - 36 == window size).
#[test]
fn replay_window_edge_accepts_then_backtracks() {
    let crypto = test_crypto();
    let mut rng = CountingRng::default();
    let config = ConfigBuilder::new(Mode::Client)
        .transport(Transport::Udp)
        .data_replay_window(64)
        .build();
    let server_config = ConfigBuilder::new(Mode::Server)
        .transport(Transport::Udp)
        .data_replay_window(64)
        .build();
    let mut client = engine_with_config(plain_wrap_config(), config, &mut rng);
    let mut server = engine_with_config(plain_wrap_config(), server_config, &mut rng);

    client.start(TimePoint::ZERO, &crypto).unwrap();
    pump(&mut client, &mut server, TimePoint::ZERO, &crypto, &mut rng);

    // Encrypt 100 packets so the Nth wire carries packet id N.
    let wires: Vec<Vec<u8>> = (0..100)
        .map(|i| client.data_encrypt(format!("p{i}").as_bytes(), &crypto, &mut rng).unwrap())
        .collect();

    assert!(server.data_decrypt(&wires[99], TimePoint::ZERO, &crypto).unwrap().is_some());
    let backtracked = server.data_decrypt(&wires[35], TimePoint::ZERO, &crypto).unwrap();
    assert!(backtracked.is_none());
    assert_eq!(server.stats().backtrack, 1);
}

/// Scenario 6 (spec §8): a handshake that never completes invalidates the
/// session exactly once, at the configured handshake window, with no false
/// positive before it.
#[test]
fn handshake_timeout_invalidates_session_once() {
    let crypto = test_crypto();
    let mut rng = CountingRng::default();

    // A client that starts a handshake and never hears back from a peer;
    // models a server that silently drops every hard reset it's sent.
    let client_config = ConfigBuilder::new(Mode::Client)
        .transport(Transport::Udp)
        .handshake_window(Duration::from_secs(3))
        .build();
    let mut client = engine_with_config(plain_wrap_config(), client_config, &mut rng);
    client.start(TimePoint::ZERO, &crypto).unwrap();
    let _ = client.drain_outbound(); // sent into the void; nothing answers it

    assert_eq!(client.housekeeping(TimePoint::from_secs(2), &crypto, &mut rng).unwrap(), None);
    assert_eq!(
        client.housekeeping(TimePoint::from_secs(3), &crypto, &mut rng).unwrap(),
        Some(InvalidateReason::HandshakeTimedOut)
    );
    assert_eq!(client.stats().kev_negotiate_error, 1);
}

/// Property P6 (spec §8): across a BECOME_PRIMARY swap, the next inbound
/// packet under the new key decrypts, and the last packet encrypted under
/// the old key before its `expire` deadline still decrypts too. Once that
/// deadline passes, the old key is gone entirely.
#[test]
fn rekey_keeps_old_key_decryptable_until_expire_then_drops_it() {
    let crypto = test_crypto();
    let mut rng = CountingRng::default();
    let renegotiate = Duration::from_secs(3600); // not exercised here; triggered manually
    let become_primary = Duration::from_secs(5);
    let expire = Duration::from_secs(20);

    let make_config = |mode| {
        ConfigBuilder::new(mode)
            .transport(Transport::Udp)
            .renegotiate(renegotiate)
            .become_primary(become_primary)
            .expire(expire)
            .build()
    };
    let mut client = engine_with_config(plain_wrap_config(), make_config(Mode::Client), &mut rng);
    let mut server = engine_with_config(plain_wrap_config(), make_config(Mode::Server), &mut rng);

    client.start(TimePoint::ZERO, &crypto).unwrap();
    pump(&mut client, &mut server, TimePoint::ZERO, &crypto, &mut rng);
    assert!(client.data_channel_ready() && server.data_channel_ready());

    // The very last packet encrypted under the old (key 0) primary.
    let old_key_wire = client.data_encrypt(b"sent under the old key", &crypto, &mut rng).unwrap();
    let old_key_header = PacketHeader::from_byte(old_key_wire[0]).unwrap();
    assert_eq!(old_key_header.key_id.value(), 0);

    // Start a renegotiation; the server auto-creates its own secondary on
    // seeing the soft-reset, so only one side needs to initiate.
    client.start_renegotiation(TimePoint::ZERO);
    pump(&mut client, &mut server, TimePoint::ZERO, &crypto, &mut rng);

    // First housekeeping call at the moment the secondary reaches ACTIVE
    // registers its BECOME_PRIMARY deadline; a later call past that
    // deadline fires the swap.
    client.housekeeping(TimePoint::ZERO, &crypto, &mut rng).unwrap();
    server.housekeeping(TimePoint::ZERO, &crypto, &mut rng).unwrap();
    let promote_at = TimePoint::ZERO + become_primary + Duration::from_secs(1);
    client.housekeeping(promote_at, &crypto, &mut rng).unwrap();
    server.housekeeping(promote_at, &crypto, &mut rng).unwrap();

    // The new primary is key 1 now.
    let new_key_wire = client.data_encrypt(b"sent under the new key", &crypto, &mut rng).unwrap();
    let new_key_header = PacketHeader::from_byte(new_key_wire[0]).unwrap();
    assert_eq!(new_key_header.key_id.value(), 1);
    let decrypted_new = server.data_decrypt(&new_key_wire, promote_at, &crypto).unwrap();
    assert_eq!(decrypted_new.as_deref(), Some(&b"sent under the new key"[..]));

    // The old key, now demoted, still decrypts during its grace period.
    let decrypted_old = server.data_decrypt(&old_key_wire, promote_at, &crypto).unwrap();
    assert_eq!(decrypted_old.as_deref(), Some(&b"sent under the old key"[..]));

    // Past its expire deadline the demoted key is gone; a key-0 packet can
    // no longer find a context to decrypt it under.
    let past_expire = promote_at + expire + Duration::from_secs(1);
    server.housekeeping(past_expire, &crypto, &mut rng).unwrap();
    assert!(server.data_decrypt(&old_key_wire, past_expire, &crypto).is_err());
}

/// Scenario 5 (spec §8): a server configured for tls-crypt-v2 unwraps a
/// valid client WKc and completes the handshake; a single corrupted byte in
/// the WKc is rejected outright with no key material derived.
#[test]
fn tls_crypt_v2_accepts_valid_wkc_and_rejects_corrupted_one() {
    let crypto = test_crypto();
    let mut rng = CountingRng::default();
    let server_key = [7u8; 32];
    let client_cipher_key = [11u8; 32];
    let client_hmac_key = [22u8; 32];
    let wkc = wrap_client_key(&server_key, &client_cipher_key, &client_hmac_key, b"", &[1u8; 12], &crypto);

    let client_keys = DirectionalKeys {
        encrypt_cipher_key: client_cipher_key,
        encrypt_hmac_key: client_hmac_key,
        decrypt_cipher_key: client_cipher_key,
        decrypt_hmac_key: client_hmac_key,
    };
    let client_wrap_config = WrapConfig {
        mode: CtrlWrapMode::TlsCrypt,
        keys: Some(client_keys),
        server_wkc_key: None,
        client_wkc: Some(wkc),
    };
    let server_wrap_config = WrapConfig {
        mode: CtrlWrapMode::TlsCrypt,
        keys: None,
        server_wkc_key: Some(server_key),
        client_wkc: None,
    };

    let client_config = ConfigBuilder::new(Mode::Client).transport(Transport::Udp).build();
    let server_config = ConfigBuilder::new(Mode::Server).transport(Transport::Udp).build();
    let mut client = engine_with_config(client_wrap_config, client_config, &mut rng);
    let mut server = engine_with_config(server_wrap_config, server_config, &mut rng);

    client.start(TimePoint::ZERO, &crypto).unwrap();
    pump(&mut client, &mut server, TimePoint::ZERO, &crypto, &mut rng);
    assert!(client.data_channel_ready() && server.data_channel_ready());

    // Now corrupt a fresh client's WKc and confirm the server refuses it.
    let bad_wkc = {
        let mut w = wrap_client_key(&server_key, &client_cipher_key, &client_hmac_key, b"", &[2u8; 12], &crypto);
        let last = w.len() - 1;
        w[last] ^= 0xff;
        w
    };
    let bad_client_wrap_config = WrapConfig {
        mode: CtrlWrapMode::TlsCrypt,
        keys: Some(DirectionalKeys {
            encrypt_cipher_key: client_cipher_key,
            encrypt_hmac_key: client_hmac_key,
            decrypt_cipher_key: client_cipher_key,
            decrypt_hmac_key: client_hmac_key,
        }),
        server_wkc_key: None,
        client_wkc: Some(bad_wkc),
    };
    let bad_client_config = ConfigBuilder::new(Mode::Client).transport(Transport::Udp).build();
    let mut bad_client = engine_with_config(bad_client_wrap_config, bad_client_config, &mut rng);
    let mut fresh_server = engine_with_config(
        WrapConfig {
            mode: CtrlWrapMode::TlsCrypt,
            keys: None,
            server_wkc_key: Some(server_key),
            client_wkc: None,
        },
        ConfigBuilder::new(Mode::Server).transport(Transport::Udp).build(),
        &mut rng,
    );

    bad_client.start(TimePoint::ZERO, &crypto).unwrap();
    let wire = bad_client.drain_outbound().pop().expect("client emits its hard reset");
    assert!(fresh_server.control_net_recv(&wire, TimePoint::ZERO, &crypto, &mut rng).is_err());
}
