use std::{
    fmt,
    fs::{self, OpenOptions},
    io::Write,
    path::Path,
};

use sodiumoxide::crypto::{box_, sealedbox};
use tracing::info;

use super::{init, CryptoError, Cryptor};

/// A cryptor based on `C25519` sealed boxes.
///
/// A sealed box attaches an ephemeral public key to the ciphertext, so only the
/// recipient's public key is needed to encrypt.
pub struct SealedBoxCryptor {
    public: box_::PublicKey,
    secret: box_::SecretKey,
}

impl fmt::Debug for SealedBoxCryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedBoxCryptor")
            .field("public", &base64::encode(self.public.as_ref()))
            .finish()
    }
}

impl SealedBoxCryptor {
    /// Generates a new random key pair.
    pub fn generate() -> Result<Self, CryptoError> {
        init()?;
        let (public, secret) = box_::gen_keypair();
        Ok(Self { public, secret })
    }

    /// Restores a cryptor from the raw bytes of a secret key.
    pub fn from_secret_key(bytes: &[u8]) -> Result<Self, CryptoError> {
        init()?;
        let secret = box_::SecretKey::from_slice(bytes).ok_or(CryptoError::InvalidSecretKey)?;
        let public = secret.public_key();
        Ok(Self { public, secret })
    }

    /// Reads a base64 encoded secret key from `path`.
    pub fn from_file(path: &Path) -> Result<Self, CryptoError> {
        let encoded = fs::read_to_string(path)?;
        let bytes = base64::decode(encoded.trim())?;
        Self::from_secret_key(&bytes)
    }

    /// Reads the secret key at `path`, or generates one and stores it there
    /// if the file doesn't exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            return Self::from_file(path);
        }
        info!("no private key at {}: generating a new one", path.display());
        let cryptor = Self::generate()?;
        cryptor.save(path)?;
        Ok(cryptor)
    }

    /// Writes the secret key, base64 encoded, to `path`. On unix the file is
    /// only readable by its owner.
    pub fn save(&self, path: &Path) -> Result<(), CryptoError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
            options.mode(0o600);
            let mut file = options.open(path)?;
            // the mode only applies to new files
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
            file.write_all(base64::encode(self.secret.as_ref()).as_bytes())?;
        }
        #[cfg(not(unix))]
        options
            .open(path)?
            .write_all(base64::encode(self.secret.as_ref()).as_bytes())?;
        Ok(())
    }
}

fn parse_public_key(encoded: &str) -> Result<box_::PublicKey, CryptoError> {
    let bytes = base64::decode(encoded.trim())?;
    box_::PublicKey::from_slice(&bytes).ok_or(CryptoError::InvalidPublicKey)
}

impl Cryptor for SealedBoxCryptor {
    fn encrypt(&self, plaintext: &[u8], recipient_public_key: &str) -> Result<Vec<u8>, CryptoError> {
        let recipient = parse_public_key(recipient_public_key)?;
        Ok(sealedbox::seal(plaintext, &recipient))
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        sealedbox::open(ciphertext, &self.public, &self.secret).map_err(|_| CryptoError::Decryption)
    }

    fn verify_public_key(&self, candidate: &str) -> bool {
        parse_public_key(candidate)
            .map(|pk| pk == self.public)
            .unwrap_or(false)
    }

    fn public_key_str(&self) -> Option<String> {
        Some(base64::encode(self.public.as_ref()))
    }
}
