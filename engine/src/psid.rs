//! ProtoSessionId — 8 random bytes identifying one side of a session
//! (spec §3). Created once at engine reset and immutable for the session's
//! lifetime; both sides' ids appear in every control packet.

use crate::crypto::Rng;

pub const PSID_LEN: usize = 8;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtoSessionId([u8; PSID_LEN]);

impl ProtoSessionId {
    pub fn random(rng: &mut dyn Rng) -> Self {
        let mut buf = [0u8; PSID_LEN];
        rng.fill_bytes(&mut buf);
        ProtoSessionId(buf)
    }

    pub fn from_bytes(bytes: [u8; PSID_LEN]) -> Self {
        ProtoSessionId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PSID_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; PSID_LEN]
    }
}

impl std::fmt::Debug for ProtoSessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ProtoSessionId({})", hex::encode(self.0))
    }
}
