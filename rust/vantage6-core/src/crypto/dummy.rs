use super::{CryptoError, Cryptor};

/// A cryptor that leaves payloads as they are.
///
/// Only valid for collaborations the server marks as unencrypted.
#[derive(Debug, Clone, Copy, Default)]
pub struct DummyCryptor;

impl Cryptor for DummyCryptor {
    fn encrypt(&self, plaintext: &[u8], _: &str) -> Result<Vec<u8>, CryptoError> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(ciphertext.to_vec())
    }

    fn verify_public_key(&self, _: &str) -> bool {
        true
    }

    fn public_key_str(&self) -> Option<String> {
        None
    }
}
