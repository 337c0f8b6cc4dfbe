//! Secret store collaborator

use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Secret store unavailable: {0}")]
    Unavailable(String),
}

/// Load/store/delete interface to wherever passwords are persisted
pub trait SecretStore: Send + Sync {
    fn load_secret(&self, key: &str) -> Result<Option<String>, SecretError>;

    fn save_secret(&self, key: &str, secret: &str) -> Result<(), SecretError>;

    /// Deleting a missing entry is not an error
    fn delete_secret(&self, key: &str) -> Result<(), SecretError>;
}

/// Process-local store, for tests and embedders without an OS keychain
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: DashMap<String, String>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(self, key: impl Into<String>, secret: impl Into<String>) -> Self {
        self.secrets.insert(key.into(), secret.into());
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.secrets.contains_key(key)
    }
}

impl SecretStore for MemorySecretStore {
    fn load_secret(&self, key: &str) -> Result<Option<String>, SecretError> {
        Ok(self.secrets.get(key).map(|s| s.value().clone()))
    }

    fn save_secret(&self, key: &str, secret: &str) -> Result<(), SecretError> {
        self.secrets.insert(key.to_string(), secret.to_string());
        Ok(())
    }

    fn delete_secret(&self, key: &str) -> Result<(), SecretError> {
        self.secrets.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemorySecretStore::new();
        assert_eq!(store.load_secret("k").unwrap(), None);

        store.save_secret("k", "v").unwrap();
        assert_eq!(store.load_secret("k").unwrap().as_deref(), Some("v"));

        store.delete_secret("k").unwrap();
        store.delete_secret("k").unwrap();
        assert!(!store.contains("k"));
    }
}
