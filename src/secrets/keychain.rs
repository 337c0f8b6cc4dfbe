//! Keychain-backed secret store
//!
//! Passwords live in the system keychain through the `keyring` crate.
//! The account name is prefixed with the OS user so the identity stays
//! stable across app re-signing on macOS.

use keyring::Entry;
use tracing::{debug, warn};

use super::store::{SecretError, SecretStore};

/// Service name for keychain entries
const SERVICE_NAME: &str = "com.oxideterm.ssh";

pub struct KeyringSecretStore {
    service: String,
}

impl KeyringSecretStore {
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }

    /// Use a custom service name (tests, side-by-side installs)
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, SecretError> {
        let account = format!("{}@{}", whoami::username(), key);
        Ok(Entry::new(&self.service, &account)?)
    }
}

impl Default for KeyringSecretStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStore for KeyringSecretStore {
    fn load_secret(&self, key: &str) -> Result<Option<String>, SecretError> {
        match self.entry(key)?.get_password() {
            Ok(secret) => {
                debug!("Keychain hit for {}", key);
                Ok(Some(secret))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => {
                warn!("Keychain read failed for {}: {:?}", key, e);
                Err(SecretError::Keyring(e))
            }
        }
    }

    fn save_secret(&self, key: &str, secret: &str) -> Result<(), SecretError> {
        let entry = self.entry(key)?;
        entry.set_password(secret)?;

        // Some backends report success without persisting; read it back.
        match entry.get_password() {
            Ok(read_back) if read_back == secret => {
                debug!("Keychain store verified for {}", key);
                Ok(())
            }
            Ok(_) => Err(SecretError::Unavailable(
                "keychain returned different content after store".into(),
            )),
            Err(e) => Err(SecretError::Keyring(e)),
        }
    }

    fn delete_secret(&self, key: &str) -> Result<(), SecretError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(SecretError::Keyring(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Touches the real system keychain
    #[test]
    #[ignore] // Run manually: cargo test keychain -- --ignored
    fn test_keychain_roundtrip() {
        let store = KeyringSecretStore::with_service("com.oxideterm.ssh.test");
        let key = format!("ssh:test-{}@localhost:22", uuid::Uuid::new_v4());

        store.save_secret(&key, "hunter2").unwrap();
        assert_eq!(store.load_secret(&key).unwrap().as_deref(), Some("hunter2"));

        store.delete_secret(&key).unwrap();
        assert_eq!(store.load_secret(&key).unwrap(), None);
        store.delete_secret(&key).unwrap();
    }
}
