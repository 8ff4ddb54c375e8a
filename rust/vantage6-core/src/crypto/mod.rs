//! The encryption capability.
//!
//! Task inputs are encrypted by the initiating organization for each receiving
//! organization, and results are encrypted by the node for the initiating
//! organization. Which primitive does the work is opaque to the rest of the
//! code: everything goes through the [`Cryptor`] trait.
//!
//! Two cryptors exist:
//!
//! - [`SealedBoxCryptor`], backed by the [sodiumoxide] sealed boxes. Public keys
//!   are exchanged as base64 strings.
//! - [`DummyCryptor`], for collaborations that the server marks as unencrypted.
//!   It only applies the base64 transport encoding.
//!
//! [sodiumoxide]: https://docs.rs/sodiumoxide/

mod dummy;
mod sealed;

use std::io;

use thiserror::Error;

pub use self::{dummy::DummyCryptor, sealed::SealedBoxCryptor};

/// Errors of the encryption capability.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("failed to initialize the crypto library")]
    Init,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid secret key")]
    InvalidSecretKey,
    #[error("decryption of a message failed")]
    Decryption,
    #[error("invalid base64 encoding: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("failed to access the key file: {0}")]
    Io(#[from] io::Error),
}

/// Encrypts and decrypts payloads exchanged between organizations.
pub trait Cryptor: Send + Sync {
    /// Encrypts `plaintext` for the holder of `recipient_public_key` (base64).
    fn encrypt(&self, plaintext: &[u8], recipient_public_key: &str) -> Result<Vec<u8>, CryptoError>;

    /// Decrypts a ciphertext that was encrypted for this cryptor's key.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Checks whether `candidate` (base64) is this cryptor's public key.
    fn verify_public_key(&self, candidate: &str) -> bool;

    /// The base64 public key to publish at the organization, if any.
    fn public_key_str(&self) -> Option<String>;

    /// Encrypts `plaintext` and applies the transport encoding.
    fn encrypt_bytes_to_str(
        &self,
        plaintext: &[u8],
        recipient_public_key: &str,
    ) -> Result<String, CryptoError> {
        self.encrypt(plaintext, recipient_public_key)
            .map(base64::encode)
    }

    /// Removes the transport encoding of `data` and decrypts it.
    fn decrypt_str_to_bytes(&self, data: &str) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = base64::decode(data.trim())?;
        self.decrypt(&ciphertext)
    }
}

/// Initializes the crypto library. It's safe to call this more than once.
pub fn init() -> Result<(), CryptoError> {
    sodiumoxide::init().map_err(|_| CryptoError::Init)
}
