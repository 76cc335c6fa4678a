use std::{
    fs,
    path::Path,
};

use aes_gcm::{
    aead::{generic_array::typenum::Unsigned, Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretVec};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

#[derive(thiserror::Error, Debug)]
pub enum VaultError {
    #[error("key error: {0}")]
    Key(String),
    #[error("encryption error")]
    Encryption,
    #[error("decryption error")]
    Decryption,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, VaultError>;

/// Symmetric vault for credential blobs. AES-256-GCM with a fresh random
/// nonce per call; output is base64(nonce || ciphertext). No I/O after
/// construction, and the key never appears in logs or errors.
pub struct Vault {
    key: SecretVec<u8>,
}

impl Vault {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != 32 {
            return Err(VaultError::Key("expected 32 byte key".into()));
        }
        Ok(Self {
            key: SecretVec::new(bytes),
        })
    }

    /// Loads the master key from `dir/master.key`, creating it with mode
    /// 0600 on first run.
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        let key_path = dir.join("master.key");
        let key = if key_path.exists() {
            let key = fs::read(&key_path)?;
            if key.len() != 32 {
                return Err(VaultError::Key("stored key has invalid length".into()));
            }
            key
        } else {
            let mut key = vec![0u8; 32];
            OsRng.fill_bytes(&mut key);
            fs::write(&key_path, &key)?;
            #[cfg(unix)]
            {
                let mut perms = fs::metadata(&key_path)?.permissions();
                perms.set_mode(0o600);
                fs::set_permissions(&key_path, perms)?;
            }
            key
        };
        Self::from_bytes(key)
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(self.key.expose_secret())
            .map_err(|_| VaultError::Key("invalid key length".into()))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let cipher = self.cipher()?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut payload = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| VaultError::Encryption)?;
        let mut combined = nonce.to_vec();
        combined.append(&mut payload);
        Ok(general_purpose::STANDARD.encode(combined))
    }

    pub fn encrypt_str(&self, value: &str) -> Result<String> {
        self.encrypt(value.as_bytes())
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>> {
        let combined = general_purpose::STANDARD
            .decode(ciphertext)
            .map_err(|_| VaultError::Decryption)?;
        let nonce_len = <Aes256Gcm as AeadCore>::NonceSize::to_usize();
        if combined.len() < nonce_len {
            return Err(VaultError::Decryption);
        }
        let (nonce_bytes, payload) = combined.split_at(nonce_len);
        let nonce = Nonce::from_slice(nonce_bytes);
        let cipher = self.cipher()?;
        cipher
            .decrypt(nonce, payload)
            .map_err(|_| VaultError::Decryption)
    }

    pub fn decrypt_str(&self, ciphertext: &str) -> Result<String> {
        let bytes = self.decrypt(ciphertext)?;
        String::from_utf8(bytes).map_err(|_| VaultError::Decryption)
    }

    /// Short digest of the key, safe to log. Lets an operator tell which
    /// master key a database was written with.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(self.key.expose_secret());
        hex::encode(&digest[..4])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vault() -> Vault {
        Vault::from_bytes(vec![7u8; 32]).unwrap()
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let vault = test_vault();
        let ciphertext = vault.encrypt_str("imap-password").unwrap();
        assert_eq!(vault.decrypt_str(&ciphertext).unwrap(), "imap-password");
    }

    #[test]
    fn nonce_is_fresh_per_call() {
        let vault = test_vault();
        let a = vault.encrypt_str("same input").unwrap();
        let b = vault.encrypt_str("same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_with_decryption_error() {
        let vault = test_vault();
        let ciphertext = vault.encrypt_str("secret").unwrap();
        let other = Vault::from_bytes(vec![9u8; 32]).unwrap();
        assert!(matches!(
            other.decrypt_str(&ciphertext),
            Err(VaultError::Decryption)
        ));
    }

    #[test]
    fn malformed_ciphertext_fails_cleanly() {
        let vault = test_vault();
        assert!(matches!(
            vault.decrypt("not base64 at all!"),
            Err(VaultError::Decryption)
        ));
        assert!(matches!(vault.decrypt("AAAA"), Err(VaultError::Decryption)));
    }

    #[test]
    fn fingerprint_is_stable_and_not_the_key() {
        let vault = test_vault();
        assert_eq!(vault.fingerprint(), test_vault().fingerprint());
        assert_eq!(vault.fingerprint().len(), 8);
        assert_ne!(vault.fingerprint(), hex::encode([7u8; 4]));
    }

    #[test]
    fn rejects_short_keys() {
        assert!(matches!(
            Vault::from_bytes(vec![1u8; 16]),
            Err(VaultError::Key(_))
        ));
    }
}
