//! JSON configuration and its translation into engine, collector and auth settings.

use crate::collector::{CollectorOptions, DEFAULT_INTERVAL};
use crate::engine::{
    AccountOptions, AuthCalloutOptions, AuthorizationOptions, EngineOptions, GLOBAL_ACCOUNT,
    JetStreamOptions, UserOptions,
};
use crate::error::ConfigError;
use crate::flow::FlowConfig;
use crate::runtime::AuthIdentity;
use harbor_auth::{
    AuthorizationPolicies, CredentialIssuer, KeyResolver, KeyStore, MemoryKeyStore,
    PinnedTokenStore, PolicyConfig,
};
use nkeys::KeyPair;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Auth account used when named accounts are configured and none is given.
pub const DEFAULT_AUTH_ACCOUNT: &str = "AUTH";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    pub disabled: bool,
    pub name: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub http_port: Option<u16>,
    pub debug: bool,
    pub trace: bool,
    pub no_auth_user: Option<String>,
    pub system_account: Option<String>,
    /// Trusted operator JWTs.
    pub operators: Option<Vec<String>>,
    pub jetstream: Option<JetStreamConfig>,
    pub authorization: Option<AuthorizationConfig>,
    pub accounts: Option<Vec<AccountConfig>>,
    pub auth_callout: Option<AuthCalloutConfig>,
    pub metrics: Option<MetricsConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JetStreamConfig {
    pub store_dir: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthorizationConfig {
    pub token: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub users: Vec<UserOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AccountConfig {
    pub name: String,
    pub users: Vec<UserOptions>,
    pub jetstream: bool,
    pub authorization_policies: Vec<PolicyConfig>,
    pub flows: Vec<FlowConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthCalloutConfig {
    pub account: Option<String>,
    pub issuer: Option<String>,
    pub signing_key: Option<String>,
    pub signing_key_store: Option<KeyStoreConfig>,
    pub auth_users: Vec<String>,
    pub queue_group: Option<String>,
    pub xkey: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyStoreConfig {
    /// Account name (or issuer public key) to account seed.
    Memory { keys: BTreeMap<String, String> },
}

impl KeyStoreConfig {
    pub fn build(&self) -> Arc<dyn KeyStore> {
        match self {
            Self::Memory { keys } => Arc::new(keys.clone().into_iter().collect::<MemoryKeyStore>()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    pub server_label: Option<String>,
    pub server_url: Option<String>,
    /// Scrape interval in seconds.
    pub interval: Option<u64>,
}

/// Auth-callout wiring for one generation.
pub struct AuthPlan {
    pub account: String,
    /// `None` when an external service answers the callout.
    pub issuer: Option<Arc<CredentialIssuer>>,
    pub policies: Arc<AuthorizationPolicies>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountFlow {
    pub account: String,
    pub flow: FlowConfig,
}

/// Everything a generation needs to start.
pub struct Provisioned {
    pub enabled: bool,
    pub engine: EngineOptions,
    pub collector: Option<CollectorOptions>,
    pub auth: Option<AuthPlan>,
    pub flows: Vec<AccountFlow>,
}

/// Reads and parses a JSON config file.
pub fn load(path: impl AsRef<Path>) -> Result<Options, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_json::from_slice(&raw)?)
}

impl Options {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    fn has_operators(&self) -> bool {
        self.operators.as_ref().is_some_and(|ops| !ops.is_empty())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(accounts) = &self.accounts {
            if accounts.is_empty() {
                return Err(ConfigError::invalid("accounts must not be an empty list"));
            }
            if self.has_operators() {
                return Err(ConfigError::invalid(
                    "accounts cannot be configured together with operators",
                ));
            }
            if self.authorization.is_some() {
                return Err(ConfigError::invalid(
                    "authorization cannot be configured together with accounts",
                ));
            }
            let mut seen = HashSet::new();
            for account in accounts {
                if account.name.is_empty() {
                    return Err(ConfigError::invalid("account name must not be empty"));
                }
                if !seen.insert(account.name.as_str()) {
                    return Err(ConfigError::invalid(format!(
                        "duplicate account {}",
                        account.name
                    )));
                }
            }
        }
        if self.no_auth_user.is_some() && self.has_operators() {
            return Err(ConfigError::invalid(
                "no_auth_user cannot be configured together with operators",
            ));
        }
        if let Some(authorization) = &self.authorization {
            if self.auth_callout.is_some() {
                return Err(ConfigError::invalid(
                    "authorization cannot be configured together with auth_callout",
                ));
            }
            if authorization.token.is_some() && authorization.user.is_some() {
                return Err(ConfigError::invalid(
                    "authorization token and user are mutually exclusive",
                ));
            }
            if authorization.user.is_some() != authorization.password.is_some() {
                return Err(ConfigError::invalid(
                    "authorization user and password must be set together",
                ));
            }
        }
        if let Some(callout) = &self.auth_callout {
            if callout.signing_key.is_some() && callout.issuer.is_some() {
                return Err(ConfigError::invalid(
                    "auth_callout signing_key and issuer are mutually exclusive",
                ));
            }
            if callout.signing_key_store.is_some() && callout.issuer.is_none() {
                return Err(ConfigError::invalid(
                    "auth_callout signing_key_store requires issuer",
                ));
            }
        }
        if self.metrics.is_some() && self.http_port.is_none() {
            return Err(ConfigError::invalid(
                "metrics require http_port to be configured",
            ));
        }
        Ok(())
    }

    /// Auth-callout account: explicit, else `$G` without named accounts, else `AUTH`.
    pub fn auth_account(&self) -> Option<String> {
        let callout = self.auth_callout.as_ref()?;
        Some(match (&callout.account, &self.accounts) {
            (Some(account), _) if !account.is_empty() => account.clone(),
            (_, None) => GLOBAL_ACCOUNT.to_string(),
            (_, Some(_)) => DEFAULT_AUTH_ACCOUNT.to_string(),
        })
    }

    pub fn engine_options(&self) -> EngineOptions {
        let defaults = EngineOptions::default();
        let accounts = self
            .accounts
            .iter()
            .flatten()
            .map(|account| {
                (
                    account.name.clone(),
                    AccountOptions {
                        users: account.users.clone(),
                        jetstream: account.jetstream,
                    },
                )
            })
            .collect();
        let authorization = self.authorization.as_ref().map(|a| AuthorizationOptions {
            token: a.token.clone(),
            user: a.user.clone(),
            password: a.password.clone(),
            users: a.users.clone(),
            auth_callout: None,
        });

        EngineOptions {
            server_name: self.name.clone(),
            host: self.host.clone().unwrap_or(defaults.host),
            port: self.port.unwrap_or(defaults.port),
            http_port: self.http_port,
            debug: self.debug,
            trace: self.trace,
            accounts,
            authorization,
            no_auth_user: self.no_auth_user.clone(),
            system_account: self.system_account.clone(),
            trusted_operators: self.operators.clone().unwrap_or_default(),
            jetstream: self.jetstream.as_ref().map(|js| JetStreamOptions {
                store_dir: js.store_dir.clone(),
            }),
        }
    }

    pub fn collector_options(&self) -> Result<Option<CollectorOptions>, ConfigError> {
        let Some(metrics) = &self.metrics else {
            return Ok(None);
        };
        let Some(http_port) = self.http_port else {
            return Err(ConfigError::invalid(
                "metrics require http_port to be configured",
            ));
        };
        let server_label = metrics
            .server_label
            .clone()
            .filter(|label| !label.is_empty())
            .or_else(|| Some(self.name.clone()).filter(|name| !name.is_empty()))
            .ok_or_else(|| {
                ConfigError::invalid("metrics server_label is required when name is not set")
            })?;
        let server_url = metrics
            .server_url
            .clone()
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| format!("http://localhost:{http_port}"));
        let interval = metrics
            .interval
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_INTERVAL);

        Ok(Some(CollectorOptions {
            server_label,
            server_url,
            interval,
        }))
    }

    /// Policies of every account, in configuration order.
    pub fn policies(&self) -> AuthorizationPolicies {
        let mut policies = AuthorizationPolicies::default();
        for account in self.accounts.iter().flatten() {
            policies.extend(
                account
                    .authorization_policies
                    .iter()
                    .map(|policy| policy.build(&account.name)),
            );
        }
        policies
    }

    pub fn flows(&self) -> Vec<AccountFlow> {
        self.accounts
            .iter()
            .flatten()
            .flat_map(|account| {
                account.flows.iter().map(|flow| AccountFlow {
                    account: account.name.clone(),
                    flow: flow.clone(),
                })
            })
            .collect()
    }

    /// Validates and resolves the configuration. Runs whether or not the server is disabled.
    pub fn provision(
        &self,
        identity: &AuthIdentity,
        pinned: Arc<PinnedTokenStore>,
    ) -> Result<Provisioned, ConfigError> {
        self.validate()?;
        let mut engine = self.engine_options();
        let collector = self.collector_options()?;
        let policies = Arc::new(self.policies());

        let auth = match (&self.auth_callout, self.auth_account()) {
            (Some(callout), Some(account)) => {
                let (keys, issuer) = resolve_keys(callout, identity)?;
                if account != GLOBAL_ACCOUNT || !engine.accounts.is_empty() {
                    engine.accounts.entry(account.clone()).or_default();
                }
                let authorization = engine.authorization.get_or_insert_with(Default::default);
                authorization.auth_callout = Some(AuthCalloutOptions {
                    issuer,
                    auth_users: callout.auth_users.clone(),
                    account: account.clone(),
                    xkey: callout.xkey.clone(),
                });

                let issuer = keys.map(|keys| {
                    let issuer = CredentialIssuer::new(keys, pinned).with_policies(policies.clone());
                    let issuer = match &callout.queue_group {
                        Some(group) if !group.is_empty() => issuer.with_queue_group(group),
                        _ => issuer,
                    };
                    Arc::new(issuer)
                });
                Some(AuthPlan {
                    account,
                    issuer,
                    policies,
                })
            }
            _ => {
                if !policies.is_empty() {
                    warn!("authorization policies are ignored without auth_callout");
                }
                None
            }
        };

        Ok(Provisioned {
            enabled: !self.disabled,
            engine,
            collector,
            auth,
            flows: self.flows(),
        })
    }
}

/// In-process key resolver (if any) and the issuer public key the engine trusts.
fn resolve_keys(
    callout: &AuthCalloutConfig,
    identity: &AuthIdentity,
) -> Result<(Option<KeyResolver>, String), ConfigError> {
    let signing_key = callout
        .signing_key
        .as_deref()
        .map(parse_account_seed)
        .transpose()?;
    let store = callout.signing_key_store.as_ref().map(KeyStoreConfig::build);

    match (signing_key, store, callout.issuer.clone()) {
        (None, None, Some(issuer)) => Ok((None, issuer)),
        (None, None, None) => {
            let keys = KeyResolver::from_key(identity.signing_key());
            let issuer = keys.issuer().to_string();
            Ok((Some(keys), issuer))
        }
        (signing_key, store, issuer) => {
            let issuer = issuer
                .or_else(|| signing_key.as_ref().map(|key| key.public_key()))
                .unwrap_or_default();
            let keys = KeyResolver::new(signing_key, store, issuer)
                .map_err(|e| ConfigError::invalid(format!("auth_callout: {e}")))?;
            let issuer = keys.issuer().to_string();
            Ok((Some(keys), issuer))
        }
    }
}

fn parse_account_seed(seed: &str) -> Result<Arc<KeyPair>, ConfigError> {
    let key = KeyPair::from_seed(seed)
        .map_err(|e| ConfigError::invalid(format!("invalid auth_callout signing_key: {e}")))?;
    if !key.public_key().starts_with('A') {
        return Err(ConfigError::invalid(
            "auth_callout signing_key must be an account seed",
        ));
    }
    Ok(Arc::new(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_auth::SigningIdentity;

    fn provision(raw: &str) -> Result<Provisioned, ConfigError> {
        Options::from_json(raw)?.provision(&AuthIdentity::default(), Arc::new(PinnedTokenStore::new()))
    }

    fn invalid(raw: &str) -> String {
        match provision(raw) {
            Err(e) => e.to_string(),
            Ok(_) => panic!("expected {raw} to be rejected"),
        }
    }

    #[test]
    fn minimal_config_uses_engine_defaults() {
        let provisioned = provision("{}").unwrap();

        assert!(provisioned.enabled);
        assert_eq!(provisioned.engine, EngineOptions::default());
        assert!(provisioned.collector.is_none());
        assert!(provisioned.auth.is_none());
        assert!(provisioned.flows.is_empty());
    }

    #[test]
    fn disabled_config_is_still_provisioned() {
        let provisioned = provision(r#"{"disabled": true, "port": 4333}"#).unwrap();
        assert!(!provisioned.enabled);
        assert_eq!(provisioned.engine.port, 4333);

        assert!(provision(r#"{"disabled": true, "accounts": []}"#).is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(matches!(
            Options::from_json(r#"{"cluster": {}}"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn structural_conflicts_are_rejected() {
        assert!(invalid(r#"{"accounts": []}"#).contains("empty"));
        assert!(invalid(r#"{"accounts": [{"name": "A"}], "operators": ["eyJ..."]}"#)
            .contains("operators"));
        assert!(invalid(r#"{"accounts": [{"name": "A"}], "authorization": {"token": "t"}}"#)
            .contains("authorization"));
        assert!(invalid(r#"{"accounts": [{"name": "A"}, {"name": "A"}]}"#).contains("duplicate"));
        assert!(invalid(r#"{"no_auth_user": "u", "operators": ["eyJ..."]}"#)
            .contains("no_auth_user"));
        assert!(invalid(r#"{"authorization": {"token": "t"}, "auth_callout": {}}"#)
            .contains("auth_callout"));
        assert!(invalid(r#"{"authorization": {"user": "u"}}"#).contains("password"));
    }

    #[test]
    fn signing_identity_conflicts_are_rejected() {
        let seed = KeyPair::new_account().seed().unwrap();
        let issuer = KeyPair::new_account().public_key();

        let both = format!(r#"{{"auth_callout": {{"signing_key": "{seed}", "issuer": "{issuer}"}}}}"#);
        assert!(invalid(&both).contains("mutually exclusive"));

        let store_only =
            r#"{"auth_callout": {"signing_key_store": {"type": "memory", "keys": {}}}}"#;
        assert!(invalid(store_only).contains("requires issuer"));

        let user_seed = KeyPair::new_user().seed().unwrap();
        let wrong = format!(r#"{{"auth_callout": {{"signing_key": "{user_seed}"}}}}"#);
        assert!(invalid(&wrong).contains("account seed"));
    }

    #[test]
    fn static_key_and_store_cannot_both_sign() {
        let callout = AuthCalloutConfig {
            signing_key: Some(KeyPair::new_account().seed().unwrap()),
            signing_key_store: Some(KeyStoreConfig::Memory {
                keys: BTreeMap::new(),
            }),
            ..AuthCalloutConfig::default()
        };
        let err = resolve_keys(&callout, &AuthIdentity::default()).unwrap_err();
        assert!(err.to_string().contains("auth_callout"));
    }

    #[test]
    fn generated_key_is_shared_across_provisions() {
        let identity = AuthIdentity::default();
        let pinned = Arc::new(PinnedTokenStore::new());
        let options = Options::from_json(r#"{"auth_callout": {}}"#).unwrap();

        let first = options.provision(&identity, Arc::clone(&pinned)).unwrap();
        let second = options.provision(&identity, pinned).unwrap();

        let issuer = |p: &Provisioned| p.engine.auth_callout().unwrap().issuer.clone();
        assert_eq!(issuer(&first), identity.signing_key().public_key());
        assert_eq!(issuer(&first), issuer(&second));

        let auth = first.auth.unwrap();
        assert_eq!(auth.account, "$G");
        assert!(auth.issuer.is_some());
        assert!(first.engine.accounts.is_empty());
    }

    #[test]
    fn static_key_issues_under_its_public_key() {
        let key = KeyPair::new_account();
        let raw = format!(
            r#"{{"auth_callout": {{"signing_key": "{}", "queue_group": "edge"}}}}"#,
            key.seed().unwrap()
        );
        let provisioned = provision(&raw).unwrap();

        assert_eq!(
            provisioned.engine.auth_callout().unwrap().issuer,
            key.public_key()
        );
        let issuer = provisioned.auth.unwrap().issuer.unwrap();
        assert_eq!(issuer.queue_group(), "edge");
        assert_eq!(issuer.keys().issuer(), key.public_key());
    }

    #[test]
    fn store_mode_resolves_through_store() {
        let issuer = KeyPair::new_account();
        let raw = format!(
            r#"{{"accounts": [{{"name": "orders"}}],
                "auth_callout": {{"issuer": "{pk}", "signing_key_store": {{"type": "memory", "keys": {{"{pk}": "{seed}"}}}}}}}}"#,
            pk = issuer.public_key(),
            seed = issuer.seed().unwrap()
        );
        let provisioned = provision(&raw).unwrap();

        let auth = provisioned.auth.unwrap();
        assert_eq!(auth.account, "AUTH");
        assert!(provisioned.engine.accounts.contains_key("AUTH"));
        let resolver = auth.issuer.unwrap();
        assert!(matches!(
            resolver.keys().identity(),
            Some(SigningIdentity::Store(_))
        ));
    }

    #[test]
    fn issuer_only_defers_to_external_service() {
        let issuer = KeyPair::new_account().public_key();
        let raw = format!(
            r#"{{"auth_callout": {{"issuer": "{issuer}", "auth_users": ["svc"], "account": "AUTH"}}}}"#
        );
        let provisioned = provision(&raw).unwrap();

        let callout = provisioned.engine.auth_callout().unwrap();
        assert_eq!(callout.issuer, issuer);
        assert_eq!(callout.auth_users, vec!["svc"]);
        assert_eq!(callout.account, "AUTH");
        assert!(provisioned.auth.unwrap().issuer.is_none());
    }

    #[test]
    fn policies_and_flows_follow_account_order() {
        let raw = r#"{
            "accounts": [
                {"name": "orders", "jetstream": true,
                 "authorization_policies": [{"callout": {"module": "allow"}}],
                 "flows": [{"type": "republish", "from": "in", "to": "out"}]},
                {"name": "billing",
                 "authorization_policies": [{"callout": {"module": "deny", "message": "closed"}}]}
            ],
            "auth_callout": {}
        }"#;
        let provisioned = provision(raw).unwrap();

        assert_eq!(provisioned.auth.as_ref().unwrap().policies.len(), 2);
        assert_eq!(
            provisioned.flows,
            vec![AccountFlow {
                account: "orders".to_string(),
                flow: FlowConfig::Republish {
                    from: "in".to_string(),
                    to: "out".to_string()
                }
            }]
        );
        assert!(provisioned.engine.accounts["orders"].jetstream);
        assert!(provisioned.engine.accounts.contains_key("AUTH"));
    }

    #[test]
    fn metrics_defaults_and_requirements() {
        let provisioned =
            provision(r#"{"name": "edge-1", "http_port": 8222, "metrics": {}}"#).unwrap();
        let collector = provisioned.collector.unwrap();
        assert_eq!(collector.server_label, "edge-1");
        assert_eq!(collector.server_url, "http://localhost:8222");
        assert_eq!(collector.interval, DEFAULT_INTERVAL);

        let custom = provision(
            r#"{"http_port": 8222, "metrics": {"server_label": "x", "server_url": "http://mon:1", "interval": 3}}"#,
        )
        .unwrap()
        .collector
        .unwrap();
        assert_eq!(custom.server_url, "http://mon:1");
        assert_eq!(custom.interval, Duration::from_secs(3));

        assert!(invalid(r#"{"metrics": {}}"#).contains("http_port"));
        assert!(invalid(r#"{"http_port": 8222, "metrics": {}}"#).contains("server_label"));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = load("/nonexistent/harbor.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn load_reads_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harbor.json");
        std::fs::write(&path, r#"{"name": "edge", "port": 4555}"#).unwrap();

        let options = load(&path).unwrap();
        assert_eq!(options.name, "edge");
        assert_eq!(options.port, Some(4555));
    }
}
