//! Fixed-size plaintext key buffers and the closed set of key types.

use std::fmt;

use aes_gcm_siv::aead::{rand_core::RngCore, OsRng};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::cipher::CipherError;

/// Byte length of every symmetric key in the hierarchy (TMK, KEK, DEK).
pub const KEY_LEN: usize = 32;

/// Plaintext 256-bit key material.
///
/// The buffer is overwritten with zeroes when dropped, so every clone handed
/// out by the key cache or the services is scrubbed as soon as it goes out of
/// scope. `Debug` never prints the bytes.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyBytes([u8; KEY_LEN]);

impl KeyBytes {
    /// Generate a fresh key from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut key = Self([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut key.0);
        key
    }

    /// Copy key material out of a slice.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidKeyLength`] unless `bytes` is exactly
    /// [`KEY_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CipherError> {
        if bytes.len() != KEY_LEN {
            return Err(CipherError::InvalidKeyLength(bytes.len()));
        }
        let mut key = Self([0u8; KEY_LEN]);
        key.0.copy_from_slice(bytes);
        Ok(key)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for KeyBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyBytes([REDACTED])")
    }
}

impl PartialEq for KeyBytes {
    fn eq(&self, other: &Self) -> bool {
        // Not constant-time; only used by tests and cache bookkeeping.
        self.0 == other.0
    }
}

/// Tier of the key hierarchy a cache entry or audit record refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    /// Tenant master key.
    #[serde(rename = "TMK")]
    Tmk,
    /// Key-encryption key derived from a TMK.
    #[serde(rename = "KEK")]
    Kek,
    /// Per-artifact data encryption key.
    #[serde(rename = "DEK")]
    Dek,
}

impl KeyType {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyType::Tmk => "TMK",
            KeyType::Kek => "KEK",
            KeyType::Dek => "DEK",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for KeyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TMK" => Ok(KeyType::Tmk),
            "KEK" => Ok(KeyType::Kek),
            "DEK" => Ok(KeyType::Dek),
            other => Err(format!("unknown key type: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_differ() {
        assert_ne!(KeyBytes::generate(), KeyBytes::generate());
    }

    #[test]
    fn from_slice_rejects_wrong_length() {
        assert!(matches!(
            KeyBytes::from_slice(&[0u8; 16]),
            Err(CipherError::InvalidKeyLength(16))
        ));
        assert!(KeyBytes::from_slice(&[7u8; KEY_LEN]).is_ok());
    }

    #[test]
    fn debug_is_redacted() {
        let key = KeyBytes::from_slice(&[0xAB; KEY_LEN]).unwrap();
        let printed = format!("{key:?}");
        assert!(printed.contains("REDACTED"));
        assert!(!printed.contains("171"));
    }

    #[test]
    fn zeroize_clears_material() {
        let mut key = KeyBytes::from_slice(&[0x42; KEY_LEN]).unwrap();
        key.zeroize();
        assert_eq!(key.as_bytes(), &[0u8; KEY_LEN]);
    }

    #[test]
    fn key_type_parses_its_own_display() {
        for kt in [KeyType::Tmk, KeyType::Kek, KeyType::Dek] {
            assert_eq!(kt.to_string().parse::<KeyType>().unwrap(), kt);
        }
        assert!("tmk".parse::<KeyType>().is_err());
    }
}
