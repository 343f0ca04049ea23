//! AES-256-GCM-SIV sealing of artifact payloads and wrapping of 32-byte keys.
//!
//! **Algorithm choice:** AES-256-GCM-SIV (RFC 8452) is nonce-misuse-resistant.
//! A fresh random 96-bit nonce is still drawn for every operation; SIV only
//! limits the damage if the CSPRNG ever repeats one.
//!
//! The 16-byte authentication tag is appended to every ciphertext. Any change
//! to the nonce, ciphertext or tag makes [`open`] fail with
//! [`CipherError::AuthenticationFailed`]; there is no code path that returns
//! unauthenticated plaintext.

use aes_gcm_siv::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    Aes256GcmSiv, Nonce,
};
use thiserror::Error;
use zeroize::Zeroizing;

use super::keys::{KeyBytes, KEY_LEN};

/// Identifier recorded in every envelope and metadata record.
pub const ALGORITHM: &str = "AES-256-GCM-SIV";

/// Byte length of an AES-GCM-SIV nonce (12 bytes = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Byte length of the authentication tag appended to each ciphertext.
pub const TAG_LEN: usize = 16;

/// Byte length of a wrapped key: `nonce || encrypted key || tag`.
pub const WRAPPED_KEY_LEN: usize = NONCE_LEN + KEY_LEN + TAG_LEN;

/// Errors produced by the cipher layer.
#[derive(Debug, Error)]
pub enum CipherError {
    /// Key material is the wrong length (must be [`KEY_LEN`] bytes).
    #[error("invalid key length: expected {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),

    /// The AEAD tag did not verify: wrong key, or tampered nonce/ciphertext.
    #[error("authentication failed: ciphertext, nonce or wrapped key was altered or the key is wrong")]
    AuthenticationFailed,

    /// A nonce or wrapped key blob has the wrong shape.
    #[error("invalid format: {0}")]
    InvalidFormat(&'static str),

    /// Key derivation produced no output (unreachable for 32-byte outputs).
    #[error("key derivation failed")]
    KeyDerivation,
}

/// Output of [`seal`]: the random nonce and the ciphertext with its tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

/// Encrypt `plaintext` under `key` with a freshly generated nonce.
///
/// # Errors
///
/// Returns [`CipherError::AuthenticationFailed`] on an internal AEAD error
/// (unreachable with a valid key and a payload under the 64 GiB limit).
pub fn seal(key: &KeyBytes, plaintext: &[u8]) -> Result<Sealed, CipherError> {
    let cipher = build_cipher(key)?;

    let nonce_bytes = generate_nonce();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CipherError::AuthenticationFailed)?;

    Ok(Sealed {
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Authenticate and decrypt a payload produced by [`seal`].
///
/// # Errors
///
/// Returns [`CipherError::InvalidFormat`] if `nonce` is not [`NONCE_LEN`]
/// bytes, and [`CipherError::AuthenticationFailed`] if the tag does not verify.
pub fn open(key: &KeyBytes, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
    if nonce.len() != NONCE_LEN {
        return Err(CipherError::InvalidFormat("nonce must be 12 bytes"));
    }
    let cipher = build_cipher(key)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CipherError::AuthenticationFailed)
}

/// Wrap a 32-byte key under a key-encryption key.
///
/// The result is `nonce || ciphertext || tag`, [`WRAPPED_KEY_LEN`] bytes.
pub fn wrap_key(kek: &KeyBytes, key: &KeyBytes) -> Result<Vec<u8>, CipherError> {
    let sealed = seal(kek, key.as_bytes())?;
    let mut wrapped = Vec::with_capacity(WRAPPED_KEY_LEN);
    wrapped.extend_from_slice(&sealed.nonce);
    wrapped.extend_from_slice(&sealed.ciphertext);
    Ok(wrapped)
}

/// Unwrap a key produced by [`wrap_key`].
///
/// # Errors
///
/// Returns [`CipherError::InvalidFormat`] if the blob is not
/// [`WRAPPED_KEY_LEN`] bytes and [`CipherError::AuthenticationFailed`] if it
/// was altered or wrapped under a different KEK.
pub fn unwrap_key(kek: &KeyBytes, wrapped: &[u8]) -> Result<KeyBytes, CipherError> {
    if wrapped.len() != WRAPPED_KEY_LEN {
        return Err(CipherError::InvalidFormat("wrapped key has unexpected length"));
    }
    let (nonce, ciphertext) = wrapped.split_at(NONCE_LEN);
    let plaintext = Zeroizing::new(open(kek, nonce, ciphertext)?);
    KeyBytes::from_slice(&plaintext)
}

fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn build_cipher(key: &KeyBytes) -> Result<Aes256GcmSiv, CipherError> {
    Aes256GcmSiv::new_from_slice(key.as_bytes()).map_err(|_| CipherError::InvalidKeyLength(KEY_LEN))
}
