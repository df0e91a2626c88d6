//! Authorization policies consulted for connections that carry no pinned token.

use crate::claims::{AuthorizationRequestClaims, Permission, ResponsePermission, UserClaims};
use crate::error::PolicyError;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Decides what a connecting client may do.
pub trait PolicyEvaluator: Send + Sync {
    fn match_and_authorize<'a>(
        &'a self,
        request: &'a AuthorizationRequestClaims,
    ) -> BoxFuture<'a, Result<UserClaims, PolicyError>>;
}

/// One entry of an account's policy list.
pub trait AuthorizationPolicy: Send + Sync {
    fn matches(&self, request: &AuthorizationRequestClaims) -> Result<bool, PolicyError>;

    fn authorize<'a>(
        &'a self,
        request: &'a AuthorizationRequestClaims,
    ) -> BoxFuture<'a, Result<UserClaims, PolicyError>>;
}

/// Ordered policy list; the first policy that matches decides.
#[derive(Clone, Default)]
pub struct AuthorizationPolicies(Vec<Arc<dyn AuthorizationPolicy>>);

impl AuthorizationPolicies {
    pub fn new(policies: Vec<Arc<dyn AuthorizationPolicy>>) -> Self {
        Self(policies)
    }

    pub fn push(&mut self, policy: Arc<dyn AuthorizationPolicy>) {
        self.0.push(policy);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Extend<Arc<dyn AuthorizationPolicy>> for AuthorizationPolicies {
    fn extend<I: IntoIterator<Item = Arc<dyn AuthorizationPolicy>>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl PolicyEvaluator for AuthorizationPolicies {
    fn match_and_authorize<'a>(
        &'a self,
        request: &'a AuthorizationRequestClaims,
    ) -> BoxFuture<'a, Result<UserClaims, PolicyError>> {
        Box::pin(async move {
            for (index, policy) in self.0.iter().enumerate() {
                match policy.matches(request) {
                    Ok(true) => {
                        debug!(index, user_nkey = %request.nats.user_nkey, "policy matched");
                        return policy.authorize(request).await;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        debug!(index, error = %e, "policy matcher failed");
                        break;
                    }
                }
            }
            Err(PolicyError::NoMatchingPolicy)
        })
    }
}

/// Expands `{placeholder}`s from the authorization request.
///
/// Known keys: `user_nkey`, `connect_opts.{username,password,lang,version,protocol}` and
/// `client_info.{id,name,host,user,kind,type,mqtt}`. Unknown placeholders are kept verbatim
/// unless `drop_unknown` is set.
pub fn expand_placeholders(
    input: &str,
    request: &AuthorizationRequestClaims,
    drop_unknown: bool,
) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find('{') {
        let Some(len) = rest[start..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let key = &rest[start + 1..start + len];
        match placeholder_value(key, request) {
            Some(value) => out.push_str(&value),
            None if drop_unknown => {}
            None => out.push_str(&rest[start..=start + len]),
        }
        rest = &rest[start + len + 1..];
    }
    out.push_str(rest);
    out
}

fn placeholder_value(key: &str, request: &AuthorizationRequestClaims) -> Option<String> {
    let nats = &request.nats;
    let opts = &nats.connect_options;
    let info = &nats.client_information;
    let value = match key {
        "user_nkey" => nats.user_nkey.clone(),
        "connect_opts.username" => opts.username.clone(),
        "connect_opts.password" => opts.password.clone(),
        "connect_opts.lang" => opts.lang.clone(),
        "connect_opts.version" => opts.version.clone(),
        "connect_opts.protocol" => opts.protocol.to_string(),
        "client_info.id" => info.id.to_string(),
        "client_info.name" => info.name.clone(),
        "client_info.host" => info.host.clone(),
        "client_info.user" => info.user.clone(),
        "client_info.kind" => info.kind.clone(),
        "client_info.type" => info.client_type.clone(),
        "client_info.mqtt" => info.mqtt.clone(),
        _ => return None,
    };
    Some(value)
}

/// Overrides applied to issued user claims. Unset fields keep the claim defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserTemplate {
    #[serde(rename = "pub", default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<Permission>,
    #[serde(rename = "sub", default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<Permission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resp: Option<ResponsePermission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<Vec<String>>,
    #[serde(rename = "times_location", default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_connection_types: Option<Vec<String>>,
    #[serde(default)]
    pub bearer_token: bool,
}

impl UserTemplate {
    pub fn render(&self, request: &AuthorizationRequestClaims, user: &mut UserClaims) {
        let expand = |values: &[String]| -> Vec<String> {
            values
                .iter()
                .map(|v| expand_placeholders(v, request, false))
                .collect()
        };
        let nats = &mut user.nats;

        if let Some(subs) = self.subs {
            nats.limits.subs = subs;
        }
        if let Some(data) = self.data {
            nats.limits.data = data;
        }
        if let Some(payload) = self.payload {
            nats.limits.payload = payload;
        }
        if let Some(publish) = &self.publish {
            nats.permissions.publish = Permission {
                allow: expand(&publish.allow),
                deny: expand(&publish.deny),
            };
        }
        if let Some(subscribe) = &self.subscribe {
            nats.permissions.subscribe = Permission {
                allow: expand(&subscribe.allow),
                deny: expand(&subscribe.deny),
            };
        }
        if let Some(resp) = &self.resp {
            nats.permissions.resp = Some(resp.clone());
        }
        if let Some(src) = &self.src {
            nats.limits.src = expand(src);
        }
        if let Some(locale) = &self.locale {
            nats.limits.locale = expand_placeholders(locale, request, false);
        }
        if let Some(types) = &self.allowed_connection_types {
            nats.allowed_connection_types = expand(types);
        }
        if self.bearer_token {
            nats.bearer_token = true;
        }
    }
}

/// Issues user claims for a fixed target account.
#[derive(Debug, Clone)]
pub struct AllowPolicy {
    account: String,
    template: Option<UserTemplate>,
}

impl AllowPolicy {
    pub fn new(account: impl Into<String>, template: Option<UserTemplate>) -> Self {
        Self {
            account: account.into(),
            template,
        }
    }
}

impl AuthorizationPolicy for AllowPolicy {
    fn matches(&self, _request: &AuthorizationRequestClaims) -> Result<bool, PolicyError> {
        Ok(true)
    }

    fn authorize<'a>(
        &'a self,
        request: &'a AuthorizationRequestClaims,
    ) -> BoxFuture<'a, Result<UserClaims, PolicyError>> {
        Box::pin(async move {
            let mut user = UserClaims::new(request.nats.user_nkey.clone());
            if let Some(template) = &self.template {
                template.render(request, &mut user);
            }
            user.data.aud = expand_placeholders(&self.account, request, true);
            if user.data.aud.is_empty() {
                return Err(PolicyError::NoTargetAccount);
            }
            Ok(user)
        })
    }
}

/// Rejects every request with a fixed message.
#[derive(Debug, Clone)]
pub struct DenyPolicy {
    message: String,
}

impl DenyPolicy {
    pub const DEFAULT_MESSAGE: &'static str = "access denied";

    pub fn new(message: Option<String>) -> Self {
        Self {
            message: message
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| Self::DEFAULT_MESSAGE.to_string()),
        }
    }
}

impl AuthorizationPolicy for DenyPolicy {
    fn matches(&self, _request: &AuthorizationRequestClaims) -> Result<bool, PolicyError> {
        Ok(true)
    }

    fn authorize<'a>(
        &'a self,
        _request: &'a AuthorizationRequestClaims,
    ) -> BoxFuture<'a, Result<UserClaims, PolicyError>> {
        Box::pin(async move { Err(PolicyError::Denied(self.message.clone())) })
    }
}

/// Policy as written in configuration: `{"callout": {"module": "allow", "template": {...}}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub callout: CalloutConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "module", rename_all = "snake_case")]
pub enum CalloutConfig {
    Allow {
        #[serde(default)]
        template: Option<UserTemplate>,
    },
    Deny {
        #[serde(default)]
        message: Option<String>,
    },
}

impl PolicyConfig {
    /// Instantiates the policy for the account it is configured under.
    pub fn build(&self, account: &str) -> Arc<dyn AuthorizationPolicy> {
        match &self.callout {
            CalloutConfig::Allow { template } => {
                Arc::new(AllowPolicy::new(account, template.clone()))
            }
            CalloutConfig::Deny { message } => Arc::new(DenyPolicy::new(message.clone())),
        }
    }
}
