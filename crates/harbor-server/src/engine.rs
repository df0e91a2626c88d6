//! The embedded messaging engine as seen by the supervisors.

use crate::error::EngineError;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

pub const GLOBAL_ACCOUNT: &str = "$G";
pub const SYSTEM_ACCOUNT: &str = "$SYS";

/// Full option set handed to the engine, rendered as a `nats-server` JSON config.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineOptions {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub server_name: String,
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
    pub debug: bool,
    pub trace: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub accounts: BTreeMap<String, AccountOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<AuthorizationOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_auth_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_account: Option<String>,
    #[serde(rename = "operator", skip_serializing_if = "Vec::is_empty")]
    pub trusted_operators: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jetstream: Option<JetStreamOptions>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            server_name: String::new(),
            host: "0.0.0.0".to_string(),
            port: 4222,
            http_port: None,
            debug: false,
            trace: false,
            accounts: BTreeMap::new(),
            authorization: None,
            no_auth_user: None,
            system_account: None,
            trusted_operators: Vec::new(),
            jetstream: None,
        }
    }
}

impl EngineOptions {
    /// URL internal clients use to reach the engine.
    pub fn client_url(&self) -> String {
        let host = match self.host.as_str() {
            "" | "0.0.0.0" | "::" | "[::]" => "127.0.0.1",
            host => host,
        };
        format!("nats://{host}:{}", self.port)
    }

    pub fn has_account(&self, name: &str) -> bool {
        match name {
            GLOBAL_ACCOUNT => self.accounts.is_empty() || self.accounts.contains_key(name),
            SYSTEM_ACCOUNT => true,
            name => self.accounts.contains_key(name),
        }
    }

    pub fn auth_callout(&self) -> Option<&AuthCalloutOptions> {
        self.authorization.as_ref()?.auth_callout.as_ref()
    }

    /// Adds the auth service's own user to the auth account and exempts it from the callout.
    pub fn with_auth_user(mut self, account: &str, user: UserOptions) -> Self {
        let authorization = self.authorization.get_or_insert_with(Default::default);
        if let Some(callout) = authorization.auth_callout.as_mut()
            && !callout.auth_users.contains(&user.user)
        {
            callout.auth_users.push(user.user.clone());
        }
        if account == GLOBAL_ACCOUNT && self.accounts.is_empty() {
            authorization.users.retain(|u| u.user != user.user);
            authorization.users.push(user);
        } else {
            let entry = self.accounts.entry(account.to_string()).or_default();
            entry.users.retain(|u| u.user != user.user);
            entry.users.push(user);
        }
        self
    }

    /// Option categories that differ from `other` and need a fresh engine.
    pub fn reload_blockers(&self, other: &EngineOptions) -> Vec<&'static str> {
        let mut blockers = Vec::new();
        if self.server_name != other.server_name {
            blockers.push("server_name");
        }
        if self.host != other.host {
            blockers.push("host");
        }
        if self.port != other.port {
            blockers.push("port");
        }
        if self.http_port != other.http_port {
            blockers.push("http_port");
        }
        if self.jetstream != other.jetstream {
            blockers.push("jetstream");
        }
        if self.trusted_operators != other.trusted_operators {
            blockers.push("trusted_operators");
        }
        blockers
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AccountOptions {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<UserOptions>,
    #[serde(serialize_with = "enabled", skip_serializing_if = "std::ops::Not::not")]
    pub jetstream: bool,
}

fn enabled<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(if *value { "enabled" } else { "disabled" })
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserOptions {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for UserOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserOptions")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuthorizationOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<UserOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_callout: Option<AuthCalloutOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuthCalloutOptions {
    pub issuer: String,
    pub auth_users: Vec<String>,
    pub account: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xkey: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JetStreamOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_dir: Option<String>,
}

/// A running (or startable) messaging engine.
pub trait Engine: Send + Sync + 'static {
    fn start(&self) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Applies `options` in place. Fails with a [`crate::error::RELOAD_NOT_SUPPORTED`] error
    /// when a changed option needs a fresh engine.
    fn reload(&self, options: &EngineOptions) -> impl Future<Output = Result<(), EngineError>> + Send;

    fn ready_for_connections(&self, timeout: Duration) -> impl Future<Output = bool> + Send;

    fn shutdown(&self) -> impl Future<Output = ()> + Send;

    fn is_running(&self) -> bool;

    fn client_url(&self) -> String;

    fn lookup_account(&self, name: &str) -> Result<(), EngineError>;
}

pub trait EngineFactory: Send + Sync + 'static {
    type Engine: Engine;

    fn create(&self, options: &EngineOptions) -> Result<Self::Engine, EngineError>;
}
