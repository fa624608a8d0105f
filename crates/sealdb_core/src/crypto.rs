//! Value encryption.
//!
//! Every value stored in the engine is sealed with XChaCha20-Poly1305.
//! The engine key of the value is fed in as associated data, so a
//! ciphertext copied under a different key fails authentication. Keys
//! stay plaintext: the engine has to sort them for prefix iteration, so
//! sensitive selectors must never appear in keys.

use crate::error::{Error, Result};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of a key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the extended nonce in bytes.
pub const NONCE_SIZE: usize = 24;
/// Size of the Poly1305 authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// A 256-bit key.
///
/// Used both for the user-supplied master key and for the internally
/// generated content key. Zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    /// Generates a new random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(Error::InvalidKeySize {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self { bytes: key })
    }

    /// Returns the key material.
    ///
    /// Don't log or serialize the result.
    #[must_use]
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Seals and opens values under one key.
pub(crate) struct Cipher {
    aead: XChaCha20Poly1305,
}

impl Cipher {
    /// Creates a cipher from a key.
    pub(crate) fn new(key: &MasterKey) -> Self {
        let aead = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        Self { aead }
    }

    /// Encrypts `plaintext` bound to `engine_key`.
    ///
    /// Output layout: `nonce (24) ∥ ciphertext ∥ tag (16)`. The nonce is
    /// random per call, which keeps the cipher safe across forks.
    pub(crate) fn seal(&self, engine_key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = self
            .aead
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: engine_key,
                },
            )
            .map_err(|_| Error::AuthFailure)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Decrypts a value previously sealed under `engine_key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthFailure`] when the ciphertext is truncated,
    /// tampered with, sealed under a different key, or bound to a
    /// different engine key.
    pub(crate) fn open(&self, engine_key: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(Error::AuthFailure);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.aead
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: engine_key,
                },
            )
            .map_err(|_| Error::AuthFailure)
    }
}
