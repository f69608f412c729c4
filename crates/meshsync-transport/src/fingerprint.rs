//! Device fingerprint sent as the relay pre-handshake.

use std::fmt;

/// Per-session device fingerprint.
///
/// Computed once when the session starts and reused across every reconnect
/// of that session.
#[derive(Clone, PartialEq, Eq)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Derive a fingerprint from host-supplied device traits (user agent,
    /// screen size, locale, ...) plus a random session salt.
    pub fn derive(device_traits: &[&str]) -> Self {
        let salt: [u8; 16] = rand::random();
        Self::derive_with_salt(device_traits, &salt)
    }

    /// Deterministic derivation, used when the salt is known.
    pub fn derive_with_salt(device_traits: &[&str], salt: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"meshsync-fingerprint-v0:");
        for device_trait in device_traits {
            hasher.update(device_trait.as_bytes());
            hasher.update(&[0]);
        }
        hasher.update(salt);
        Self(hex::encode(hasher.finalize().as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.0[..16])
    }
}
