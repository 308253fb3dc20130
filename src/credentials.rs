//! Durable, provider-scoped credential storage.
//!
//! Credentials are kept in the platform keyring under a fixed service
//! name. The keyring has no native listing capability, so the store
//! maintains a JSON index of every saved key under a reserved entry.
//! Saves are existence-checked: writing a key that is already indexed
//! fails instead of overwriting.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const SERVICE: &str = "corral";
const INDEX_ENTRY: &str = "index";

/// Identifier of one stored credential: the pair (name, provider).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CredentialKey {
    /// Operator-chosen credential name.
    pub name: String,
    /// Provider the credential belongs to.
    pub provider: String,
}

impl CredentialKey {
    fn entry_name(&self) -> String {
        format!("{}-{}", self.name, self.provider)
    }
}

/// Errors raised by the credential store.
#[derive(Debug, Error)]
pub enum CredentialStoreError {
    /// Raised when saving a key that is already indexed.
    #[error("credentials {name} for provider {provider} already exist")]
    AlreadyExists {
        /// Credential name that collided.
        name: String,
        /// Provider of the colliding key.
        provider: String,
    },
    /// Raised when a requested key is not present.
    #[error("credentials {name} for provider {provider} not found")]
    NotFound {
        /// Credential name that was requested.
        name: String,
        /// Provider of the requested key.
        provider: String,
    },
    /// Raised when the secret backend fails.
    #[error("secret backend error: {message}")]
    Backend {
        /// Underlying error message.
        message: String,
    },
    /// Raised when credential content cannot be encoded or decoded.
    #[error("failed to encode credentials: {message}")]
    Encoding {
        /// Underlying error message.
        message: String,
    },
}

/// Minimal secret storage interface backing the credential store.
///
/// The production implementation is the platform keyring; tests use the
/// in-memory variant.
pub trait SecretBackend {
    /// Reads a secret, returning `None` when the entry does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialStoreError::Backend`] on backend failures.
    fn get(&self, entry: &str) -> Result<Option<String>, CredentialStoreError>;

    /// Writes a secret, overwriting any existing value.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialStoreError::Backend`] on backend failures.
    fn set(&self, entry: &str, value: &str) -> Result<(), CredentialStoreError>;

    /// Deletes a secret.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialStoreError::Backend`] on backend failures; a
    /// missing entry is not an error.
    fn delete(&self, entry: &str) -> Result<(), CredentialStoreError>;
}

/// Secret backend persisting to the operating system keyring.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeyringSecrets;

impl KeyringSecrets {
    fn entry(entry: &str) -> Result<keyring::Entry, CredentialStoreError> {
        keyring::Entry::new(SERVICE, entry).map_err(|err| CredentialStoreError::Backend {
            message: err.to_string(),
        })
    }
}

impl SecretBackend for KeyringSecrets {
    fn get(&self, entry: &str) -> Result<Option<String>, CredentialStoreError> {
        match Self::entry(entry)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(CredentialStoreError::Backend {
                message: err.to_string(),
            }),
        }
    }

    fn set(&self, entry: &str, value: &str) -> Result<(), CredentialStoreError> {
        Self::entry(entry)?
            .set_password(value)
            .map_err(|err| CredentialStoreError::Backend {
                message: err.to_string(),
            })
    }

    fn delete(&self, entry: &str) -> Result<(), CredentialStoreError> {
        match Self::entry(entry)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(CredentialStoreError::Backend {
                message: err.to_string(),
            }),
        }
    }
}

/// In-memory secret backend used by tests.
#[derive(Debug, Default)]
pub struct MemorySecrets {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemorySecrets {
    /// Creates an empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretBackend for MemorySecrets {
    fn get(&self, entry: &str) -> Result<Option<String>, CredentialStoreError> {
        let entries = self.entries.lock().map_err(|err| {
            CredentialStoreError::Backend {
                message: err.to_string(),
            }
        })?;
        Ok(entries.get(entry).cloned())
    }

    fn set(&self, entry: &str, value: &str) -> Result<(), CredentialStoreError> {
        let mut entries = self.entries.lock().map_err(|err| {
            CredentialStoreError::Backend {
                message: err.to_string(),
            }
        })?;
        entries.insert(entry.to_owned(), value.to_owned());
        Ok(())
    }

    fn delete(&self, entry: &str) -> Result<(), CredentialStoreError> {
        let mut entries = self.entries.lock().map_err(|err| {
            CredentialStoreError::Backend {
                message: err.to_string(),
            }
        })?;
        entries.remove(entry);
        Ok(())
    }
}

/// Credential store combining a secret backend with a key index.
#[derive(Debug)]
pub struct CredentialStore<B: SecretBackend> {
    backend: B,
}

impl CredentialStore<KeyringSecrets> {
    /// Builds a store backed by the operating system keyring.
    #[must_use]
    pub const fn with_keyring() -> Self {
        Self {
            backend: KeyringSecrets,
        }
    }
}

impl<B: SecretBackend> CredentialStore<B> {
    /// Builds a store over an explicit secret backend.
    #[must_use]
    pub const fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Retrieves and decodes the credentials stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialStoreError::NotFound`] when the key does not
    /// exist, or [`CredentialStoreError::Encoding`] when the stored
    /// content cannot be decoded.
    pub fn get<T: DeserializeOwned>(&self, key: &CredentialKey) -> Result<T, CredentialStoreError> {
        let content = self.backend.get(&key.entry_name())?.ok_or_else(|| {
            CredentialStoreError::NotFound {
                name: key.name.clone(),
                provider: key.provider.clone(),
            }
        })?;
        serde_json::from_str(&content).map_err(|err| CredentialStoreError::Encoding {
            message: err.to_string(),
        })
    }

    /// Encodes and saves credentials under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialStoreError::AlreadyExists`] when the key is
    /// already indexed.
    pub fn save<T: Serialize>(
        &self,
        key: &CredentialKey,
        value: &T,
    ) -> Result<(), CredentialStoreError> {
        let mut index = self.list()?;
        if index
            .iter()
            .any(|existing| existing.name == key.name && existing.provider == key.provider)
        {
            return Err(CredentialStoreError::AlreadyExists {
                name: key.name.clone(),
                provider: key.provider.clone(),
            });
        }

        let content = serde_json::to_string(value).map_err(|err| {
            CredentialStoreError::Encoding {
                message: err.to_string(),
            }
        })?;
        self.backend.set(&key.entry_name(), &content)?;

        index.push(key.clone());
        self.write_index(&index)
    }

    /// Deletes the credentials stored under `key` and drops it from the
    /// index.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialStoreError::NotFound`] when the key was never
    /// indexed.
    pub fn delete(&self, key: &CredentialKey) -> Result<(), CredentialStoreError> {
        let mut index = self.list()?;
        let before = index.len();
        index.retain(|existing| existing.name != key.name || existing.provider != key.provider);
        if index.len() == before {
            return Err(CredentialStoreError::NotFound {
                name: key.name.clone(),
                provider: key.provider.clone(),
            });
        }

        self.backend.delete(&key.entry_name())?;
        self.write_index(&index)
    }

    /// Lists every stored credential key.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialStoreError::Encoding`] when the index content
    /// is corrupt.
    pub fn list(&self) -> Result<Vec<CredentialKey>, CredentialStoreError> {
        let Some(content) = self.backend.get(INDEX_ENTRY)? else {
            return Ok(Vec::new());
        };
        serde_json::from_str(&content).map_err(|err| CredentialStoreError::Encoding {
            message: err.to_string(),
        })
    }

    fn write_index(&self, index: &[CredentialKey]) -> Result<(), CredentialStoreError> {
        let content = serde_json::to_string(index).map_err(|err| {
            CredentialStoreError::Encoding {
                message: err.to_string(),
            }
        })?;
        self.backend.set(INDEX_ENTRY, &content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str, provider: &str) -> CredentialKey {
        CredentialKey {
            name: name.to_owned(),
            provider: provider.to_owned(),
        }
    }

    #[derive(Serialize, Deserialize, PartialEq, Eq, Debug)]
    struct FakeCredentials {
        token: String,
    }

    #[test]
    fn save_round_trips_through_the_backend() {
        let store = CredentialStore::new(MemorySecrets::new());
        let credentials = FakeCredentials {
            token: String::from("s3cret"),
        };
        store
            .save(&key("acct1", "aws"), &credentials)
            .unwrap_or_else(|err| panic!("{err}"));

        let loaded: FakeCredentials = store
            .get(&key("acct1", "aws"))
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(loaded, credentials);
    }

    #[test]
    fn duplicate_save_fails_and_index_stays_unique() {
        let store = CredentialStore::new(MemorySecrets::new());
        let credentials = FakeCredentials {
            token: String::from("s3cret"),
        };
        store
            .save(&key("acct1", "aws"), &credentials)
            .unwrap_or_else(|err| panic!("{err}"));

        let second = store.save(&key("acct1", "aws"), &credentials);
        assert!(matches!(
            second,
            Err(CredentialStoreError::AlreadyExists { ref name, ref provider })
                if name == "acct1" && provider == "aws"
        ));

        let index = store.list().unwrap_or_else(|err| panic!("{err}"));
        let matching = index
            .iter()
            .filter(|entry| entry.name == "acct1" && entry.provider == "aws")
            .count();
        assert_eq!(matching, 1);
    }

    #[test]
    fn same_name_different_provider_coexists() {
        let store = CredentialStore::new(MemorySecrets::new());
        let credentials = FakeCredentials {
            token: String::from("s3cret"),
        };
        store
            .save(&key("acct1", "aws"), &credentials)
            .unwrap_or_else(|err| panic!("{err}"));
        store
            .save(&key("acct1", "scaleway"), &credentials)
            .unwrap_or_else(|err| panic!("{err}"));

        let index = store.list().unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn delete_removes_entry_and_index() {
        let store = CredentialStore::new(MemorySecrets::new());
        let credentials = FakeCredentials {
            token: String::from("s3cret"),
        };
        store
            .save(&key("acct1", "aws"), &credentials)
            .unwrap_or_else(|err| panic!("{err}"));
        store
            .delete(&key("acct1", "aws"))
            .unwrap_or_else(|err| panic!("{err}"));

        assert!(store
            .list()
            .unwrap_or_else(|err| panic!("{err}"))
            .is_empty());
        let missing: Result<FakeCredentials, _> = store.get(&key("acct1", "aws"));
        assert!(matches!(
            missing,
            Err(CredentialStoreError::NotFound { .. })
        ));
    }

    #[test]
    fn delete_of_unknown_key_errors() {
        let store = CredentialStore::new(MemorySecrets::new());
        let result = store.delete(&key("ghost", "aws"));
        assert!(matches!(result, Err(CredentialStoreError::NotFound { .. })));
    }

    #[test]
    fn list_on_empty_store_is_empty() {
        let store = CredentialStore::new(MemorySecrets::new());
        assert!(store
            .list()
            .unwrap_or_else(|err| panic!("{err}"))
            .is_empty());
    }
}
