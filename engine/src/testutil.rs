//! Test doubles used across the crate's own unit/integration tests. Not
//! behind a `cfg(test)` gate at the module level so integration tests under
//! `tests/` can reach them too; the crate only exposes this module when the
//! `test-util` feature is enabled (see `Cargo.toml`).

use std::collections::VecDeque;

use hkdf::Hkdf;
use sha2::Sha256;

use crate::crypto::{AeadCipher, CbcCipher, CtrCipher, MacProvider, Rng, SslSession};
use crate::error::{ProtoError, ProtoErrorKind};

/// Deterministic, non-cryptographic RNG: counts up from zero and repeats the
/// counter's bytes to fill the buffer. Exists purely so tests can assert on
/// which bytes a `ProtoSessionId`/`PacketId` came from.
#[derive(Default)]
pub struct CountingRng {
    next: u64,
}

impl Rng for CountingRng {
    fn fill_bytes(&mut self, out: &mut [u8]) {
        let v = self.next;
        self.next += 1;
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = v.to_le_bytes()[i % 8];
        }
    }
}

/// MAC double that returns the first `output_len` bytes of the key XORed
/// with the data's length, wide enough to catch "used the wrong key" or
/// "didn't include AAD" bugs without pulling in a real hash.
pub struct FakeMac;

impl MacProvider for FakeMac {
    fn output_len(&self) -> usize {
        32
    }

    fn mac(&self, key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; self.output_len()];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = key.get(i % key.len().max(1)).copied().unwrap_or(0) ^ (data.len() as u8);
        }
        out
    }
}

/// AEAD double: "encryption" is XOR with the key (repeated) followed by an
/// 8-byte tag computed as XOR of aad+nonce+plaintext length bytes. Good
/// enough to exercise framing and error propagation without a real cipher.
pub struct FakeAead;

impl AeadCipher for FakeAead {
    fn key_len(&self) -> usize {
        16
    }
    fn nonce_len(&self) -> usize {
        8
    }
    fn tag_len(&self) -> usize {
        8
    }

    fn seal(&self, key: &[u8], nonce: &[u8], aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let mut out = xor_with_key(key, plaintext);
        out.extend_from_slice(&fake_tag(key, nonce, aad, plaintext.len()));
        out
    }

    fn open(
        &self,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, ProtoError> {
        if ciphertext.len() < self.tag_len() {
            return Err(ProtoErrorKind::Decrypt.into());
        }
        let (body, tag) = ciphertext.split_at(ciphertext.len() - self.tag_len());
        let plaintext = xor_with_key(key, body);
        if fake_tag(key, nonce, aad, plaintext.len()) != tag {
            return Err(ProtoErrorKind::Decrypt.into());
        }
        Ok(plaintext)
    }
}

fn xor_with_key(key: &[u8], data: &[u8]) -> Vec<u8> {
    data.iter()
        .enumerate()
        .map(|(i, b)| b ^ key[i % key.len()])
        .collect()
}

fn fake_tag(key: &[u8], nonce: &[u8], aad: &[u8], plaintext_len: usize) -> Vec<u8> {
    let mut tag = [0u8; 8];
    for (i, slot) in tag.iter_mut().enumerate() {
        let k = key.get(i % key.len()).copied().unwrap_or(0);
        let n = nonce.get(i % nonce.len().max(1)).copied().unwrap_or(0);
        let a = aad.get(i).copied().unwrap_or(0);
        *slot = k ^ n ^ a ^ (plaintext_len as u8);
    }
    tag.to_vec()
}

/// CBC double: same XOR-with-key transform, block size fixed at 16 so
/// padding logic can still be exercised.
pub struct FakeCbc;

impl CbcCipher for FakeCbc {
    fn key_len(&self) -> usize {
        16
    }
    fn iv_len(&self) -> usize {
        16
    }
    fn block_size(&self) -> usize {
        16
    }

    fn encrypt(&self, key: &[u8], _iv: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let pad = self.block_size() - (plaintext.len() % self.block_size());
        let mut padded = plaintext.to_vec();
        padded.extend(std::iter::repeat(pad as u8).take(pad));
        xor_with_key(key, &padded)
    }

    fn decrypt(&self, key: &[u8], _iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, ProtoError> {
        if ciphertext.is_empty() || ciphertext.len() % self.block_size() != 0 {
            return Err(ProtoErrorKind::Decrypt.into());
        }
        let padded = xor_with_key(key, ciphertext);
        let pad = *padded.last().unwrap() as usize;
        if pad == 0 || pad > self.block_size() || pad > padded.len() {
            return Err(ProtoErrorKind::Decrypt.into());
        }
        Ok(padded[..padded.len() - pad].to_vec())
    }
}

/// CTR double: XOR with a keystream derived from key+iv, long enough for
/// any tls-crypt control packet exercised in tests.
pub struct FakeCtr;

impl CtrCipher for FakeCtr {
    fn key_len(&self) -> usize {
        32
    }
    fn iv_len(&self) -> usize {
        16
    }

    fn apply(&self, key: &[u8], iv: &[u8], data: &[u8]) -> Vec<u8> {
        data.iter()
            .enumerate()
            .map(|(i, b)| b ^ key[i % key.len()] ^ iv[i % iv.len()])
            .collect()
    }
}

/// Loopback TLS session double: handshake "completes" after a fixed number
/// of read/write round trips, and cleartext is simply queued and echoed.
/// Lets `key_context`/`proto_engine` tests exercise the full
/// WAIT_RESET -> WAIT_AUTH -> ACTIVE flow without a real TLS stack.
///
/// This double has no per-session randomness of its own (no real ClientHello/
/// ServerHello to derive one from), so `export_keying_material` is a function
/// of `label` alone via HKDF-SHA256 — enough to give every export a
/// cryptographically-shaped, label-separated output while guaranteeing both
/// ends of the loopback land on the same exported material, which a real
/// TLS exporter gets from the shared master secret instead.
pub struct LoopbackSslSession {
    handshake_rounds_remaining: u32,
    outbound_ciphertext: VecDeque<u8>,
    cleartext_in: VecDeque<u8>,
    cleartext_out: VecDeque<u8>,
}

impl LoopbackSslSession {
    pub fn new(handshake_rounds: u32) -> Self {
        LoopbackSslSession {
            handshake_rounds_remaining: handshake_rounds,
            outbound_ciphertext: VecDeque::new(),
            cleartext_in: VecDeque::new(),
            cleartext_out: VecDeque::new(),
        }
    }
}

impl SslSession for LoopbackSslSession {
    fn start_handshake(&mut self) -> Result<(), ProtoError> {
        if self.handshake_rounds_remaining > 0 {
            self.outbound_ciphertext.extend([0xAAu8; 4]);
        }
        Ok(())
    }

    fn read_ciphertext(&mut self, buf: &[u8]) -> Result<(), ProtoError> {
        if self.handshake_rounds_remaining > 0 {
            self.handshake_rounds_remaining -= 1;
            if self.handshake_rounds_remaining > 0 {
                self.outbound_ciphertext.extend([0xAAu8; 4]);
            }
            return Ok(());
        }
        self.cleartext_out.extend(buf.iter().copied());
        Ok(())
    }

    fn write_ciphertext(&mut self) -> Result<Vec<u8>, ProtoError> {
        Ok(self.outbound_ciphertext.drain(..).collect())
    }

    fn read_cleartext(&mut self, out: &mut [u8]) -> Result<usize, ProtoError> {
        let n = out.len().min(self.cleartext_out.len());
        for slot in out.iter_mut().take(n) {
            *slot = self.cleartext_out.pop_front().unwrap();
        }
        Ok(n)
    }

    fn write_cleartext(&mut self, data: &[u8]) -> Result<(), ProtoError> {
        self.cleartext_in.extend(data.iter().copied());
        self.outbound_ciphertext.extend(data.iter().copied());
        Ok(())
    }

    fn is_handshake_complete(&self) -> bool {
        self.handshake_rounds_remaining == 0
    }

    fn export_keying_material(&self, label: &str, len: usize) -> Result<Vec<u8>, ProtoError> {
        let hk = Hkdf::<Sha256>::new(None, label.as_bytes());
        let mut okm = vec![0u8; len];
        hk.expand(label.as_bytes(), &mut okm)
            .map_err(|_| ProtoErrorKind::CcError("HKDF expansion failed"))?;
        Ok(okm)
    }
}
