//! HKDF-SHA256 derivation of repository-scoped key-encryption keys.
//!
//! A KEK is never stored. It is recomputed from the tenant master key and the
//! repository context every time a DEK is wrapped or unwrapped.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use super::cipher::CipherError;
use super::keys::{KeyBytes, KEY_LEN};

/// Domain-separation salt for every KEK derivation.
const KEK_SALT: &[u8] = b"keyring/kek/v1";

/// Derive a KEK from a TMK and a context string.
///
/// Pure and deterministic: the same TMK and context always yield the same KEK,
/// and different contexts yield unrelated keys.
pub fn derive_kek(tmk: &KeyBytes, context: &str) -> Result<KeyBytes, CipherError> {
    let hk = Hkdf::<Sha256>::new(Some(KEK_SALT), tmk.as_bytes());
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(context.as_bytes(), okm.as_mut())
        .map_err(|_| CipherError::KeyDerivation)?;
    KeyBytes::from_slice(okm.as_ref())
}

/// Context string binding a KEK to one repository.
pub fn kek_context(repository: &str) -> String {
    format!("repository:{repository}")
}

/// Bookkeeping label for the KEK of `repository` under TMK `version`.
pub fn kek_label(repository: &str, version: u32) -> String {
    format!("kek-{repository}-v{version}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let tmk = KeyBytes::generate();
        let a = derive_kek(&tmk, &kek_context("maven-central")).unwrap();
        let b = derive_kek(&tmk, &kek_context("maven-central")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn contexts_are_separated() {
        let tmk = KeyBytes::generate();
        let a = derive_kek(&tmk, &kek_context("npm")).unwrap();
        let b = derive_kek(&tmk, &kek_context("pypi")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn different_tmks_give_different_keks() {
        let ctx = kek_context("npm");
        let a = derive_kek(&KeyBytes::generate(), &ctx).unwrap();
        let b = derive_kek(&KeyBytes::generate(), &ctx).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn kek_never_equals_tmk() {
        let tmk = KeyBytes::generate();
        assert_ne!(derive_kek(&tmk, &kek_context("npm")).unwrap(), tmk);
    }

    #[test]
    fn label_format() {
        assert_eq!(kek_label("docker-hub", 3), "kek-docker-hub-v3");
    }
}
