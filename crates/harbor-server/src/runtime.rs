//! Process-wide state shared by every configuration generation.

use crate::collector::CollectorFactory;
use crate::engine::{EngineFactory, UserOptions};
use crate::error::ServerError;
use crate::generation::GenerationTracker;
use crate::supervisor::{CollectorSupervisor, ServerSupervisor};
use harbor_auth::PinnedTokenStore;
use nkeys::KeyPair;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Credentials the in-process auth service connects with.
#[derive(Clone, PartialEq, Eq)]
pub struct BootstrapUser {
    pub user: String,
    pub password: String,
}

impl BootstrapUser {
    pub fn to_options(&self) -> UserOptions {
        UserOptions {
            user: self.user.clone(),
            password: self.password.clone(),
        }
    }
}

impl fmt::Debug for BootstrapUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapUser")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Generated keys that must survive reloads: the default account signing key and the
/// auth service's own user.
#[derive(Default)]
pub struct AuthIdentity {
    signing_key: Mutex<Option<Arc<KeyPair>>>,
    bootstrap: Mutex<Option<BootstrapUser>>,
}

impl AuthIdentity {
    pub fn signing_key(&self) -> Arc<KeyPair> {
        let mut key = self.signing_key.lock();
        Arc::clone(key.get_or_insert_with(|| Arc::new(KeyPair::new_account())))
    }

    /// The nkey user is its own name and its seed the password.
    pub fn bootstrap_user(&self) -> Result<BootstrapUser, ServerError> {
        let mut bootstrap = self.bootstrap.lock();
        if let Some(user) = bootstrap.as_ref() {
            return Ok(user.clone());
        }
        let key = KeyPair::new_user();
        let password = key
            .seed()
            .map_err(|e| ServerError::Identity(e.to_string()))?;
        let user = BootstrapUser {
            user: key.public_key(),
            password,
        };
        *bootstrap = Some(user.clone());
        Ok(user)
    }
}

pub struct Runtime<F: EngineFactory, C: CollectorFactory> {
    generations: GenerationTracker,
    servers: ServerSupervisor<F>,
    collectors: CollectorSupervisor<C>,
    identity: AuthIdentity,
    pinned: Arc<PinnedTokenStore>,
}

impl<F: EngineFactory, C: CollectorFactory> Runtime<F, C> {
    pub fn new(engines: F, collectors: C) -> Self {
        Self {
            generations: GenerationTracker::new(),
            servers: ServerSupervisor::new(engines),
            collectors: CollectorSupervisor::new(collectors),
            identity: AuthIdentity::default(),
            pinned: Arc::new(PinnedTokenStore::new()),
        }
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.servers = self.servers.with_ready_timeout(timeout);
        self
    }

    pub fn generations(&self) -> &GenerationTracker {
        &self.generations
    }

    pub fn servers(&self) -> &ServerSupervisor<F> {
        &self.servers
    }

    pub fn collectors(&self) -> &CollectorSupervisor<C> {
        &self.collectors
    }

    pub fn identity(&self) -> &AuthIdentity {
        &self.identity
    }

    pub fn pinned(&self) -> &Arc<PinnedTokenStore> {
        &self.pinned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_key_is_generated_once() {
        let identity = AuthIdentity::default();
        let first = identity.signing_key();
        let second = identity.signing_key();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.public_key().starts_with('A'));
    }

    #[test]
    fn bootstrap_user_is_a_stable_nkey_user() {
        let identity = AuthIdentity::default();
        let user = identity.bootstrap_user().unwrap();

        assert!(user.user.starts_with('U'));
        assert!(user.password.starts_with("SU"));
        assert_eq!(identity.bootstrap_user().unwrap(), user);

        let key = KeyPair::from_seed(&user.password).unwrap();
        assert_eq!(key.public_key(), user.user);
        assert!(!format!("{user:?}").contains(&user.password));
    }
}
