//! Signing-key resolution for issued credentials.

use crate::error::{KeyError, KeyStoreError};
use futures::future::BoxFuture;
use nkeys::KeyPair;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// External source of account signing seeds, keyed by account name.
pub trait KeyStore: Send + Sync {
    fn get_key<'a>(&'a self, account: &'a str) -> BoxFuture<'a, Result<String, KeyStoreError>>;
}

/// Thread-safe in-memory key store. Holds plaintext seeds; meant for tests and local setups.
#[derive(Clone, Default)]
pub struct MemoryKeyStore {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, account: impl Into<String>, seed: impl Into<String>) {
        self.inner.write().insert(account.into(), seed.into());
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl FromIterator<(String, String)> for MemoryKeyStore {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            inner: Arc::new(RwLock::new(iter.into_iter().collect())),
        }
    }
}

impl KeyStore for MemoryKeyStore {
    fn get_key<'a>(&'a self, account: &'a str) -> BoxFuture<'a, Result<String, KeyStoreError>> {
        let found = self.inner.read().get(account).cloned();
        Box::pin(async move { found.ok_or_else(|| KeyStoreError::NotFound(account.to_string())) })
    }
}

#[derive(Clone)]
pub enum SigningIdentity {
    Static(Arc<KeyPair>),
    Store(Arc<dyn KeyStore>),
}

impl fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(key) => f.debug_tuple("Static").field(&key.public_key()).finish(),
            Self::Store(_) => f.write_str("Store"),
        }
    }
}

/// Picks the key that signs credentials for a target account.
///
/// With a key store every account is looked up by name and its seed used once; with a static
/// key that key signs for every account.
#[derive(Clone, Debug)]
pub struct KeyResolver {
    identity: Option<SigningIdentity>,
    issuer: String,
}

impl KeyResolver {
    pub fn new(
        signing_key: Option<Arc<KeyPair>>,
        store: Option<Arc<dyn KeyStore>>,
        issuer: impl Into<String>,
    ) -> Result<Self, KeyError> {
        let identity = match (signing_key, store) {
            (Some(_), Some(_)) => return Err(KeyError::Conflict),
            (Some(key), None) => Some(SigningIdentity::Static(key)),
            (None, Some(store)) => Some(SigningIdentity::Store(store)),
            (None, None) => None,
        };
        Ok(Self {
            identity,
            issuer: issuer.into(),
        })
    }

    /// Static mode; the issuer is the key's own public key.
    pub fn from_key(key: Arc<KeyPair>) -> Self {
        let issuer = key.public_key();
        Self {
            identity: Some(SigningIdentity::Static(key)),
            issuer,
        }
    }

    pub fn from_store(store: Arc<dyn KeyStore>, issuer: impl Into<String>) -> Self {
        Self {
            identity: Some(SigningIdentity::Store(store)),
            issuer: issuer.into(),
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn identity(&self) -> Option<&SigningIdentity> {
        self.identity.as_ref()
    }

    pub async fn resolve(&self, account: &str) -> Result<Arc<KeyPair>, KeyError> {
        match &self.identity {
            Some(SigningIdentity::Store(store)) => {
                let seed = store.get_key(account).await?;
                KeyPair::from_seed(&seed)
                    .map(Arc::new)
                    .map_err(|e| KeyError::InvalidSeed {
                        account: account.to_string(),
                        reason: e.to_string(),
                    })
            }
            Some(SigningIdentity::Static(key)) => Ok(Arc::clone(key)),
            None => Err(KeyError::NotConfigured(account.to_string())),
        }
    }

    /// Key for the auth account itself, which signs every response envelope.
    pub async fn resolve_auth(&self) -> Result<Arc<KeyPair>, KeyError> {
        self.resolve(&self.issuer).await
    }
}
