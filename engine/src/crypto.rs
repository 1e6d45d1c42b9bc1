//! Trait interfaces for the external collaborators spec §1/§6.6 pushes out
//! of scope (TLS sessions, concrete ciphers, HMACs, RNGs), plus default
//! software implementations built on the same crypto crates the teacher and
//! the rest of the pack already depend on (`aes-gcm`, `chacha20poly1305`,
//! `aes`+`cbc`, `hmac`+`sha2`). A production embedder is free to swap any of
//! these for a hardware-backed or FIPS-validated implementation; the engine
//! only ever talks to the trait objects.

use aes::Aes256;
use aes_gcm::{Aes256Gcm, Key as AesGcmKey, KeyInit as AesGcmKeyInit, Nonce as AesGcmNonce};
use aes_gcm::aead::{Aead, Payload};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use chacha20poly1305::{ChaCha20Poly1305, Key as ChaChaKey, KeyInit as ChaChaKeyInit, Nonce as ChaChaNonce};
use ctr::Ctr128BE;
use hmac::{Hmac as HmacImpl, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{ProtoError, ProtoErrorKind};

/// Source of cryptographically secure random bytes.
pub trait Rng: Send {
    fn fill_bytes(&mut self, out: &mut [u8]);
}

/// `rand::rngs::OsRng` wrapped behind [`Rng`].
#[derive(Default, Clone, Copy)]
pub struct OsRng;

impl Rng for OsRng {
    fn fill_bytes(&mut self, out: &mut [u8]) {
        rand::rngs::OsRng.fill_bytes(out);
    }
}

/// Keyed-hash MAC, used by tls-auth/tls-crypt wrapping (§4.4).
pub trait MacProvider: Send + Sync {
    /// Output size in bytes (32 for HMAC-SHA256).
    fn output_len(&self) -> usize;
    fn mac(&self, key: &[u8], data: &[u8]) -> Vec<u8>;

    /// Constant-time comparison against an expected tag, per the
    /// memory-safety requirement in spec §5 that replay/auth checks avoid
    /// timing side channels.
    fn verify(&self, key: &[u8], data: &[u8], expected: &[u8]) -> bool {
        let computed = self.mac(key, data);
        computed.len() == expected.len() && bool::from(computed.ct_eq(expected))
    }
}

pub struct HmacSha256;

impl MacProvider for HmacSha256 {
    fn output_len(&self) -> usize {
        32
    }

    fn mac(&self, key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac = HmacImpl::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}

/// AEAD cipher used for the negotiated data-channel algorithm (AES-GCM,
/// ChaCha20-Poly1305) and for tls-crypt's AES-256-CTR-derived construction
/// is handled separately (CTR has no AAD/tag — see `ctrl_wrap.rs`).
pub trait AeadCipher: Send + Sync {
    fn key_len(&self) -> usize;
    fn nonce_len(&self) -> usize;
    fn tag_len(&self) -> usize;

    /// Encrypts `plaintext`, appending the authentication tag, and
    /// authenticating `aad` without encrypting it.
    fn seal(&self, key: &[u8], nonce: &[u8], aad: &[u8], plaintext: &[u8]) -> Vec<u8>;

    /// Decrypts and verifies `ciphertext` (which includes the trailing
    /// tag). Returns `ProtoErrorKind::Decrypt` on any authentication
    /// failure, never partial plaintext.
    fn open(
        &self,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, ProtoError>;
}

pub struct Aes256GcmCipher;

impl AeadCipher for Aes256GcmCipher {
    fn key_len(&self) -> usize {
        32
    }
    fn nonce_len(&self) -> usize {
        12
    }
    fn tag_len(&self) -> usize {
        16
    }

    fn seal(&self, key: &[u8], nonce: &[u8], aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let cipher = Aes256Gcm::new(AesGcmKey::<Aes256Gcm>::from_slice(key));
        cipher
            .encrypt(AesGcmNonce::from_slice(nonce), Payload { msg: plaintext, aad })
            .expect("AES-256-GCM encryption with correctly sized key/nonce cannot fail")
    }

    fn open(
        &self,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, ProtoError> {
        let cipher = Aes256Gcm::new(AesGcmKey::<Aes256Gcm>::from_slice(key));
        cipher
            .decrypt(AesGcmNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| ProtoErrorKind::Decrypt.into())
    }
}

pub struct ChaCha20Poly1305Cipher;

impl AeadCipher for ChaCha20Poly1305Cipher {
    fn key_len(&self) -> usize {
        32
    }
    fn nonce_len(&self) -> usize {
        12
    }
    fn tag_len(&self) -> usize {
        16
    }

    fn seal(&self, key: &[u8], nonce: &[u8], aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let cipher = ChaCha20Poly1305::new(ChaChaKey::from_slice(key));
        cipher
            .encrypt(ChaChaNonce::from_slice(nonce), Payload { msg: plaintext, aad })
            .expect("ChaCha20-Poly1305 encryption with correctly sized key/nonce cannot fail")
    }

    fn open(
        &self,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, ProtoError> {
        let cipher = ChaCha20Poly1305::new(ChaChaKey::from_slice(key));
        cipher
            .decrypt(ChaChaNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| ProtoErrorKind::Decrypt.into())
    }
}

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Legacy CBC cipher used by the CBC+HMAC data-channel family (§4.5).
/// Authentication is layered on top by the caller (HMAC over IV+ciphertext);
/// this trait covers only confidentiality.
pub trait CbcCipher: Send + Sync {
    fn key_len(&self) -> usize;
    fn iv_len(&self) -> usize;
    fn block_size(&self) -> usize;

    fn encrypt(&self, key: &[u8], iv: &[u8], plaintext: &[u8]) -> Vec<u8>;
    fn decrypt(&self, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, ProtoError>;
}

pub struct Aes256CbcCipher;

impl CbcCipher for Aes256CbcCipher {
    fn key_len(&self) -> usize {
        32
    }
    fn iv_len(&self) -> usize {
        16
    }
    fn block_size(&self) -> usize {
        16
    }

    fn encrypt(&self, key: &[u8], iv: &[u8], plaintext: &[u8]) -> Vec<u8> {
        Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<cbc::cipher::block_padding::Pkcs7>(plaintext)
    }

    fn decrypt(&self, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, ProtoError> {
        Aes256CbcDec::new(key.into(), iv.into())
            .decrypt_padded_vec_mut::<cbc::cipher::block_padding::Pkcs7>(ciphertext)
            .map_err(|_| ProtoErrorKind::Decrypt.into())
    }
}

/// AES-256-CTR keystream cipher used by tls-crypt (spec §4.4): the control
/// wrapper computes its own HMAC over the cleartext and uses the HMAC's
/// first 16 bytes as the CTR IV, so this trait carries no authentication of
/// its own.
pub trait CtrCipher: Send + Sync {
    fn key_len(&self) -> usize;
    fn iv_len(&self) -> usize;

    /// CTR mode is its own inverse; `apply` both encrypts and decrypts.
    fn apply(&self, key: &[u8], iv: &[u8], data: &[u8]) -> Vec<u8>;
}

pub struct Aes256CtrCipher;

impl CtrCipher for Aes256CtrCipher {
    fn key_len(&self) -> usize {
        32
    }
    fn iv_len(&self) -> usize {
        16
    }

    fn apply(&self, key: &[u8], iv: &[u8], data: &[u8]) -> Vec<u8> {
        let mut buf = data.to_vec();
        let mut cipher = Ctr128BE::<Aes256>::new(key.into(), iv.into());
        cipher.apply_keystream(&mut buf);
        buf
    }
}

/// One SSL/TLS session, as seen by [`crate::key_context::KeyContext`]. The
/// concrete implementation (rustls/OpenSSL/mbedTLS adapter) lives entirely
/// outside this crate; the engine drives it purely through this interface.
pub trait SslSession: Send {
    /// Kick off (or continue) the handshake, draining any cleartext control
    /// messages already queued for transmission into the session.
    fn start_handshake(&mut self) -> Result<(), ProtoError>;

    /// Feed a chunk of ciphertext received over the control channel.
    fn read_ciphertext(&mut self, buf: &[u8]) -> Result<(), ProtoError>;

    /// Drain ciphertext the session wants transmitted. Returns an empty
    /// vector when there is nothing pending.
    fn write_ciphertext(&mut self) -> Result<Vec<u8>, ProtoError>;

    /// Read application (post-handshake) cleartext produced by the session.
    fn read_cleartext(&mut self, out: &mut [u8]) -> Result<usize, ProtoError>;

    /// Write application cleartext to be sent over the session once
    /// established.
    fn write_cleartext(&mut self, data: &[u8]) -> Result<(), ProtoError>;

    fn is_handshake_complete(&self) -> bool;

    /// RFC 5705 keying-material export, used for the `EXPORTER-OpenVPN-datakeys`
    /// label (§3 KeyContext `data_keys`).
    fn export_keying_material(&self, label: &str, len: usize) -> Result<Vec<u8>, ProtoError>;
}

/// Bundles the crypto primitives a [`crate::key_context::KeyContext`] needs,
/// so engine construction takes one object instead of four.
pub struct CryptoProvider {
    pub rng: Box<dyn Rng>,
    pub mac: Box<dyn MacProvider>,
    pub aead: Box<dyn AeadCipher>,
    pub cbc: Box<dyn CbcCipher>,
    pub ctr: Box<dyn CtrCipher>,
}

impl CryptoProvider {
    /// Software-only defaults: OS RNG, HMAC-SHA256, AES-256-GCM, AES-256-CBC,
    /// AES-256-CTR (the last for tls-crypt control-channel wrapping).
    pub fn default_aes_gcm() -> Self {
        CryptoProvider {
            rng: Box::new(OsRng),
            mac: Box::new(HmacSha256),
            aead: Box::new(Aes256GcmCipher),
            cbc: Box::new(Aes256CbcCipher),
            ctr: Box::new(Aes256CtrCipher),
        }
    }

    pub fn default_chacha20_poly1305() -> Self {
        CryptoProvider {
            rng: Box::new(OsRng),
            mac: Box::new(HmacSha256),
            aead: Box::new(ChaCha20Poly1305Cipher),
            cbc: Box::new(Aes256CbcCipher),
            ctr: Box::new(Aes256CtrCipher),
        }
    }
}
