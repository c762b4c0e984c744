//! Keyed slot hashing.
//!
//! Keys are mapped to one of [`SLOT_COUNT`] slots with SipHash-2-4 under a
//! cluster-wide 128-bit secret. Every node in a cluster must be configured
//! with the same secret, otherwise nodes disagree about slot ownership.

use siphasher::sip::SipHasher24;
use std::fmt;
use std::hash::Hasher;
use thiserror::Error;

/// Number of routing slots.
pub const SLOT_COUNT: usize = 1 << 16;

/// Errors produced while loading the hash key.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("hash key must be 32 hex characters, got {0}")]
    InvalidKeyLength(usize),

    #[error("hash key is not valid hex")]
    InvalidKeyHex,
}

/// The 128-bit SipHash key, split into its two 64-bit halves.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct HashKey {
    k0: u64,
    k1: u64,
}

impl HashKey {
    pub fn new(k0: u64, k1: u64) -> Self {
        Self { k0, k1 }
    }

    /// Parses a 32-character hex string; the first 16 characters form the
    /// first half of the key.
    pub fn from_hex(hex: &str) -> Result<Self, RoutingError> {
        if hex.len() != 32 {
            return Err(RoutingError::InvalidKeyLength(hex.len()));
        }
        if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(RoutingError::InvalidKeyHex);
        }
        let k0 = u64::from_str_radix(&hex[..16], 16).map_err(|_| RoutingError::InvalidKeyHex)?;
        let k1 = u64::from_str_radix(&hex[16..], 16).map_err(|_| RoutingError::InvalidKeyHex)?;
        Ok(Self { k0, k1 })
    }

    /// Returns the slot a key belongs to.
    #[inline]
    pub fn slot_for(&self, key: &[u8]) -> u16 {
        let mut hasher = SipHasher24::new_with_keys(self.k0, self.k1);
        hasher.write(key);
        (hasher.finish() & 0xFFFF) as u16
    }
}

// Never print the secret itself.
impl fmt::Debug for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HashKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "00112233445566778899aabbccddeeff";

    #[test]
    fn test_from_hex_halves() {
        let key = HashKey::from_hex(KEY).unwrap();
        assert_eq!(key, HashKey::new(0x0011223344556677, 0x8899aabbccddeeff));
        assert_eq!(
            HashKey::from_hex("00112233445566778899AABBCCDDEEFF").unwrap(),
            key
        );
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert_eq!(
            HashKey::from_hex("0011"),
            Err(RoutingError::InvalidKeyLength(4))
        );
        assert_eq!(
            HashKey::from_hex("00112233445566778899aabbccddeeffaa"),
            Err(RoutingError::InvalidKeyLength(34))
        );
        assert_eq!(
            HashKey::from_hex("0011223344556677zz99aabbccddeeff"),
            Err(RoutingError::InvalidKeyHex)
        );
        assert_eq!(
            HashKey::from_hex("+011223344556677+899aabbccddeeff"),
            Err(RoutingError::InvalidKeyHex)
        );
    }

    #[test]
    fn test_slot_is_deterministic() {
        let key = HashKey::from_hex(KEY).unwrap();
        for i in 0..100 {
            let k = format!("user:{}", i);
            assert_eq!(key.slot_for(k.as_bytes()), key.slot_for(k.as_bytes()));
        }
    }

    #[test]
    fn test_slot_depends_on_hash_key() {
        let a = HashKey::from_hex(KEY).unwrap();
        let b = HashKey::from_hex("ffeeddccbbaa99887766554433221100").unwrap();
        let differing = (0..64)
            .filter(|i| {
                let k = format!("item-{}", i);
                a.slot_for(k.as_bytes()) != b.slot_for(k.as_bytes())
            })
            .count();
        assert!(differing > 60);
    }

    #[test]
    fn test_slots_spread() {
        let key = HashKey::from_hex(KEY).unwrap();
        let mut seen = std::collections::HashSet::new();
        for i in 0..1000 {
            seen.insert(key.slot_for(format!("k{}", i).as_bytes()));
        }
        assert!(seen.len() > 980);
    }

    #[test]
    fn test_debug_hides_secret() {
        let key = HashKey::from_hex(KEY).unwrap();
        assert_eq!(format!("{:?}", key), "HashKey(..)");
    }
}
