//! Credential Vault
//!
//! Protects stored passwords. Values are tagged so the reader knows how to undo them:
//!
//! - `ENC:<base64>`: sealed with AES-256-GCM under a master key (nonce prepended)
//! - `B64:<base64>`: plain Base64, written when no secure storage is available
//! - anything else: legacy plaintext, returned unchanged
//!
//! The master key lives in the OS keychain ([`KeyringStorage`]). It is created on
//! first use and cached for the life of the process.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use rand::RngCore;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{QuarryError, Result};

const SEALED_PREFIX: &str = "ENC:";
const ENCODED_PREFIX: &str = "B64:";
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Keychain service name for the master key
pub const KEYRING_SERVICE: &str = "quarry";
/// Keychain account name for the master key
pub const KEYRING_ACCOUNT: &str = "master-key";

/// Platform secret storage able to seal and open byte strings
pub trait SecureStorage: Send + Sync {
    /// Whether sealing can be attempted at all
    fn is_available(&self) -> bool;

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>>;
}

/// Seal with AES-256-GCM, output is `nonce || ciphertext`
fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| QuarryError::vault(format!("Encryption failed: {e}")))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(key: &[u8; KEY_LEN], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN {
        return Err(QuarryError::vault("Sealed value is too short"));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| QuarryError::vault("Decryption failed: wrong key or corrupted value"))
}

/// Master key in the OS keychain (macOS Keychain, Windows Credential Manager, Secret Service)
pub struct KeyringStorage {
    service: String,
    account: String,
    key: Mutex<Option<[u8; KEY_LEN]>>,
}

impl Default for KeyringStorage {
    fn default() -> Self {
        Self::new(KEYRING_SERVICE, KEYRING_ACCOUNT)
    }
}

impl KeyringStorage {
    #[must_use]
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self { service: service.into(), account: account.into(), key: Mutex::new(None) }
    }

    /// Load the master key, creating and storing one on first use
    fn master_key(&self) -> Result<[u8; KEY_LEN]> {
        let mut cached = self.key.lock();
        if let Some(key) = *cached {
            return Ok(key);
        }

        let entry = keyring::Entry::new(&self.service, &self.account)
            .map_err(|e| QuarryError::vault(format!("Keychain unavailable: {e}")))?;

        let key = match entry.get_password() {
            Ok(encoded) => {
                let bytes = BASE64
                    .decode(encoded.trim())
                    .map_err(|e| QuarryError::vault(format!("Stored master key is not Base64: {e}")))?;
                <[u8; KEY_LEN]>::try_from(bytes.as_slice())
                    .map_err(|_| QuarryError::vault("Stored master key has the wrong length"))?
            }
            Err(keyring::Error::NoEntry) => {
                let mut key = [0u8; KEY_LEN];
                rand::thread_rng().fill_bytes(&mut key);
                entry
                    .set_password(&BASE64.encode(key))
                    .map_err(|e| QuarryError::vault(format!("Failed to store master key: {e}")))?;
                debug!(service = %self.service, "created vault master key");
                key
            }
            Err(e) => return Err(QuarryError::vault(format!("Failed to read master key: {e}"))),
        };

        *cached = Some(key);
        Ok(key)
    }
}

impl SecureStorage for KeyringStorage {
    fn is_available(&self) -> bool {
        match self.master_key() {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "keychain storage unavailable");
                false
            }
        }
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        seal(&self.master_key()?, plaintext)
    }

    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        open(&self.master_key()?, sealed)
    }
}

/// Fixed in-process key; nothing touches the keychain
pub struct MemoryKeyStorage {
    key: [u8; KEY_LEN],
}

impl MemoryKeyStorage {
    #[must_use]
    pub const fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// Fresh random key, lost when the process exits
    #[must_use]
    pub fn random() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }
}

impl SecureStorage for MemoryKeyStorage {
    fn is_available(&self) -> bool {
        true
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        seal(&self.key, plaintext)
    }

    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        open(&self.key, sealed)
    }
}

/// Tags and untags stored secrets
#[derive(Clone)]
pub struct CredentialVault {
    storage: Arc<dyn SecureStorage>,
}

impl Default for CredentialVault {
    fn default() -> Self {
        Self::new(Arc::new(KeyringStorage::default()))
    }
}

impl CredentialVault {
    #[must_use]
    pub fn new(storage: Arc<dyn SecureStorage>) -> Self {
        Self { storage }
    }

    /// Protect `plaintext` for storage
    ///
    /// Falls back to the `B64:` encoding when secure storage is unavailable or
    /// sealing fails; the fallback is logged.
    #[must_use]
    pub fn encrypt(&self, plaintext: &str) -> String {
        if self.storage.is_available() {
            match self.storage.encrypt(plaintext.as_bytes()) {
                Ok(sealed) => return format!("{SEALED_PREFIX}{}", BASE64.encode(sealed)),
                Err(e) => warn!(error = %e, "sealing failed, storing credential Base64-encoded"),
            }
        } else {
            warn!("secure storage unavailable, storing credential Base64-encoded");
        }
        format!("{ENCODED_PREFIX}{}", BASE64.encode(plaintext.as_bytes()))
    }

    /// Recover the plaintext of a stored value
    ///
    /// `ENC:` values need the secure storage; when it is unavailable this is an
    /// error rather than a silent loss of the secret.
    pub fn decrypt(&self, stored: &str) -> Result<String> {
        if let Some(payload) = stored.strip_prefix(SEALED_PREFIX) {
            if !self.storage.is_available() {
                return Err(QuarryError::vault(
                    "Credential was encrypted but secure storage is unavailable",
                ));
            }
            let sealed = BASE64
                .decode(payload)
                .map_err(|e| QuarryError::vault(format!("Corrupted encrypted credential: {e}")))?;
            let plaintext = self.storage.decrypt(&sealed)?;
            return String::from_utf8(plaintext)
                .map_err(|_| QuarryError::vault("Decrypted credential is not valid UTF-8"));
        }

        if let Some(payload) = stored.strip_prefix(ENCODED_PREFIX) {
            let bytes = BASE64
                .decode(payload)
                .map_err(|e| QuarryError::vault(format!("Corrupted encoded credential: {e}")))?;
            return String::from_utf8(bytes)
                .map_err(|_| QuarryError::vault("Encoded credential is not valid UTF-8"));
        }

        Ok(stored.to_string())
    }
}
