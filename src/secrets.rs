//! OS keychain access for saved SSH passwords.
//!
//! All keychain traffic flows through this module; secrets are keyed by
//! host alias (or tunnel id for tunnel-scoped passwords) under one fixed
//! service name and are never logged.

use log::debug;

use crate::error::{Error, Result};

/// Service name under which every secret is filed.
pub const KEYCHAIN_SERVICE: &str = "DevTools-SSH-Gate";

/// Backend for secret storage. The default implementation talks to the OS
/// keychain; tests substitute an in-memory map.
pub trait SecretBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// Keychain-backed secret store.
pub struct KeychainBackend;

impl SecretBackend for KeychainBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entry = keyring::Entry::new(KEYCHAIN_SERVICE, key)
            .map_err(|err| Error::Keychain(err.to_string()))?;
        match entry.get_password() {
            Ok(password) => Ok(Some(password)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(Error::Keychain(err.to_string())),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let entry = keyring::Entry::new(KEYCHAIN_SERVICE, key)
            .map_err(|err| Error::Keychain(err.to_string()))?;
        entry
            .set_password(value)
            .map_err(|err| Error::Keychain(err.to_string()))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let entry = keyring::Entry::new(KEYCHAIN_SERVICE, key)
            .map_err(|err| Error::Keychain(err.to_string()))?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(Error::Keychain(err.to_string())),
        }
    }
}

/// Façade the rest of the crate uses.
pub struct SecretStore {
    backend: Box<dyn SecretBackend>,
}

impl SecretStore {
    pub fn new() -> Self {
        Self {
            backend: Box::new(KeychainBackend),
        }
    }

    pub fn with_backend(backend: Box<dyn SecretBackend>) -> Self {
        Self { backend }
    }

    /// Looks up a saved password. `None` when nothing is stored.
    pub fn password_for(&self, key: &str) -> Result<Option<String>> {
        let found = self.backend.get(key)?;
        debug!(
            "keychain lookup for '{key}': {}",
            if found.is_some() { "hit" } else { "miss" }
        );
        Ok(found)
    }

    /// Persists a password for an alias or tunnel id.
    pub fn save_password(&self, key: &str, password: &str) -> Result<()> {
        self.backend.set(key, password)?;
        debug!("keychain entry saved for '{key}'");
        Ok(())
    }

    /// Removes a stored password; succeeds when none exists.
    pub fn delete_password(&self, key: &str) -> Result<()> {
        self.backend.delete(key)?;
        debug!("keychain entry removed for '{key}'");
        Ok(())
    }
}

impl Default for SecretStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory backend for tests; never touches the OS keychain.
    #[derive(Default)]
    pub struct MemoryBackend {
        entries: Mutex<HashMap<String, String>>,
    }

    impl SecretBackend for MemoryBackend {
        fn get(&self, key: &str) -> Result<Option<String>> {
            Ok(self.entries.lock().unwrap().get(key).cloned())
        }

        fn set(&self, key: &str, value: &str) -> Result<()> {
            self.entries
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
            Ok(())
        }

        fn delete(&self, key: &str) -> Result<()> {
            self.entries.lock().unwrap().remove(key);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryBackend;
    use super::*;

    #[test]
    fn round_trip_and_delete() {
        let store = SecretStore::with_backend(Box::new(MemoryBackend::default()));
        assert_eq!(store.password_for("web").unwrap(), None);
        store.save_password("web", "hunter2").unwrap();
        assert_eq!(store.password_for("web").unwrap().as_deref(), Some("hunter2"));
        store.delete_password("web").unwrap();
        assert_eq!(store.password_for("web").unwrap(), None);
    }

    #[test]
    fn deleting_missing_entry_succeeds() {
        let store = SecretStore::with_backend(Box::new(MemoryBackend::default()));
        assert!(store.delete_password("nobody").is_ok());
    }
}
