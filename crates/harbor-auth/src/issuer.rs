use crate::claims::{AuthorizationRequestClaims, AuthorizationResponseClaims, UserClaims};
use crate::error::IssueError;
use crate::keys::KeyResolver;
use crate::pinned::PinnedTokenStore;
use crate::policy::{AuthorizationPolicies, PolicyEvaluator};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_QUEUE_GROUP: &str = "auth_callout";

/// Answers authorization requests for the auth-callout account.
pub struct CredentialIssuer {
    keys: KeyResolver,
    pinned: Arc<PinnedTokenStore>,
    policies: RwLock<Arc<dyn PolicyEvaluator>>,
    queue_group: String,
}

impl CredentialIssuer {
    pub fn new(keys: KeyResolver, pinned: Arc<PinnedTokenStore>) -> Self {
        Self {
            keys,
            pinned,
            policies: RwLock::new(Arc::new(AuthorizationPolicies::default())),
            queue_group: DEFAULT_QUEUE_GROUP.to_string(),
        }
    }

    pub fn with_queue_group(mut self, queue_group: impl Into<String>) -> Self {
        self.queue_group = queue_group.into();
        self
    }

    pub fn with_policies(self, policies: Arc<dyn PolicyEvaluator>) -> Self {
        self.set_policies(policies);
        self
    }

    pub fn queue_group(&self) -> &str {
        &self.queue_group
    }

    pub fn keys(&self) -> &KeyResolver {
        &self.keys
    }

    /// Swaps the evaluator consulted by subsequent requests.
    pub fn set_policies(&self, policies: Arc<dyn PolicyEvaluator>) {
        *self.policies.write() = policies;
    }

    /// Produces the signed response JWT for a raw request, or `None` when nothing may be sent.
    #[instrument(name = "auth_callout.handle", skip_all)]
    pub async fn handle(&self, payload: &[u8]) -> Option<String> {
        let token = match std::str::from_utf8(payload) {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "authorization request is not utf-8");
                return None;
            }
        };
        let request = match AuthorizationRequestClaims::decode(token) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "failed to decode authorization request");
                return None;
            }
        };

        let mut response = self.respond_to(&request).await;
        match self.sign_response(&mut response).await {
            Ok(jwt) => Some(jwt),
            Err(e) => {
                warn!(
                    error = %e,
                    user_nkey = %request.nats.user_nkey,
                    "failed to sign authorization response"
                );
                None
            }
        }
    }

    async fn respond_to(&self, request: &AuthorizationRequestClaims) -> AuthorizationResponseClaims {
        let user_nkey = &request.nats.user_nkey;
        let presented = &request.nats.connect_options.token;

        let decision = match self.pinned.lookup(presented) {
            Some((account, mut claims)) => {
                debug!(%user_nkey, %account, "pinned token accepted");
                claims.data.sub = user_nkey.clone();
                claims.data.aud = account;
                Ok(claims)
            }
            None => {
                let policies = Arc::clone(&*self.policies.read());
                policies
                    .match_and_authorize(request)
                    .await
                    .map_err(IssueError::from)
            }
        };

        let outcome = match decision {
            Ok(claims) => self.success_response(request, claims).await,
            Err(e) => Err(e),
        };
        outcome.unwrap_or_else(|e| {
            info!(%user_nkey, error = %e, "connection refused");
            error_response(request, &e)
        })
    }

    async fn success_response(
        &self,
        request: &AuthorizationRequestClaims,
        mut claims: UserClaims,
    ) -> Result<AuthorizationResponseClaims, IssueError> {
        let signer = self.keys.resolve(&claims.data.aud).await?;
        let jwt = claims.encode(&signer)?;
        info!(
            user_nkey = %request.nats.user_nkey,
            account = %claims.data.aud,
            "connection authorized"
        );

        let mut response = AuthorizationResponseClaims::new(request.nats.user_nkey.clone());
        response.data.aud = request.nats.server.id.clone();
        response.nats.jwt = jwt;
        Ok(response)
    }

    async fn sign_response(
        &self,
        response: &mut AuthorizationResponseClaims,
    ) -> Result<String, IssueError> {
        let signer = self.keys.resolve_auth().await?;
        Ok(response.encode(&signer)?)
    }
}

fn error_response(request: &AuthorizationRequestClaims, err: &IssueError) -> AuthorizationResponseClaims {
    let mut response = AuthorizationResponseClaims::new(request.nats.user_nkey.clone());
    response.data.aud = request.nats.server.id.clone();
    response.nats.error = err.to_string();
    response
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::keys::MemoryKeyStore;
    use crate::policy::{AllowPolicy, DenyPolicy};
    use nkeys::KeyPair;

    pub(crate) struct Fixture {
        pub server: KeyPair,
        pub user: KeyPair,
        pub auth: Arc<KeyPair>,
        pub pinned: Arc<PinnedTokenStore>,
    }

    impl Fixture {
        pub(crate) fn new() -> Self {
            Self {
                server: KeyPair::new_server(),
                user: KeyPair::new_user(),
                auth: Arc::new(KeyPair::new_account()),
                pinned: Arc::new(PinnedTokenStore::new()),
            }
        }

        pub(crate) fn issuer(&self) -> CredentialIssuer {
            CredentialIssuer::new(
                KeyResolver::from_key(Arc::clone(&self.auth)),
                Arc::clone(&self.pinned),
            )
        }

        pub(crate) fn request(&self, token: &str) -> String {
            let mut request = AuthorizationRequestClaims::new(self.user.public_key());
            request.data.aud = "nats-authorization-request".to_string();
            request.nats.user_nkey = self.user.public_key();
            request.nats.server.id = self.server.public_key();
            request.nats.server.name = "harbor".to_string();
            request.nats.connect_options.token = token.to_string();
            request.encode(&self.server).unwrap()
        }
    }

    fn response(jwt: &str) -> AuthorizationResponseClaims {
        AuthorizationResponseClaims::decode(jwt).unwrap()
    }

    #[tokio::test]
    async fn pinned_token_fast_path_addresses_user_and_account() {
        let fx = Fixture::new();
        let token = fx.pinned.get_or_create("orders").unwrap();

        let reply = fx.issuer().handle(fx.request(token.as_str()).as_bytes()).await.unwrap();
        let response = response(&reply);

        assert_eq!(response.data.iss, fx.auth.public_key());
        assert_eq!(response.data.sub, fx.user.public_key());
        assert_eq!(response.data.aud, fx.server.public_key());
        assert!(response.nats.error.is_empty());

        let user = UserClaims::decode(&response.nats.jwt).unwrap();
        assert_eq!(user.data.aud, "orders");
        assert_eq!(user.data.sub, fx.user.public_key());
        assert_eq!(user.data.iss, fx.auth.public_key());
    }

    #[tokio::test]
    async fn chosen_token_resolves_through_fast_path() {
        let fx = Fixture::new();
        let mut claims = UserClaims::new("");
        claims.data.aud = "orders".to_string();
        claims.nats.permissions.subscribe.allow = vec!["orders.>".to_string()];
        fx.pinned.pin("tok-123", "orders", Some(claims)).unwrap();

        let response = response(&fx.issuer().handle(fx.request("tok-123").as_bytes()).await.unwrap());

        assert!(response.nats.error.is_empty());
        let user = UserClaims::decode(&response.nats.jwt).unwrap();
        assert_eq!(user.data.aud, "orders");
        assert_eq!(user.data.sub, fx.user.public_key());
        assert_eq!(user.nats.permissions.subscribe.allow, vec!["orders.>"]);
    }

    #[tokio::test]
    async fn fast_path_matches_slow_path_addressing() {
        let fx = Fixture::new();
        let token = fx.pinned.get_or_create("orders").unwrap();
        let issuer = fx
            .issuer()
            .with_policies(Arc::new(AuthorizationPolicies::new(vec![Arc::new(
                AllowPolicy::new("orders", None),
            )])));

        let fast = response(&issuer.handle(fx.request(token.as_str()).as_bytes()).await.unwrap());
        let slow = response(&issuer.handle(fx.request("").as_bytes()).await.unwrap());

        assert_eq!(fast.data.sub, slow.data.sub);
        assert_eq!(fast.data.aud, slow.data.aud);
        let fast_user = UserClaims::decode(&fast.nats.jwt).unwrap();
        let slow_user = UserClaims::decode(&slow.nats.jwt).unwrap();
        assert_eq!(fast_user.data.sub, slow_user.data.sub);
        assert_eq!(fast_user.data.aud, slow_user.data.aud);
    }

    #[tokio::test]
    async fn unknown_token_without_policies_is_refused_and_signed() {
        let fx = Fixture::new();

        let reply = fx.issuer().handle(fx.request("bogus").as_bytes()).await.unwrap();
        let response = response(&reply);

        assert_eq!(response.nats.error, "no matching policy");
        assert!(response.nats.jwt.is_empty());
        assert_eq!(response.data.iss, fx.auth.public_key());
        assert_eq!(response.data.sub, fx.user.public_key());
    }

    #[tokio::test]
    async fn deny_policy_message_reaches_client() {
        let fx = Fixture::new();
        let issuer = fx.issuer().with_policies(Arc::new(AuthorizationPolicies::new(vec![
            Arc::new(DenyPolicy::new(None)),
        ])));

        let response = response(&issuer.handle(fx.request("").as_bytes()).await.unwrap());
        assert_eq!(response.nats.error, "access denied");
    }

    #[tokio::test]
    async fn set_policies_applies_to_next_request() {
        let fx = Fixture::new();
        let issuer = fx.issuer();

        let before = response(&issuer.handle(fx.request("").as_bytes()).await.unwrap());
        assert_eq!(before.nats.error, "no matching policy");

        issuer.set_policies(Arc::new(AuthorizationPolicies::new(vec![Arc::new(
            AllowPolicy::new("billing", None),
        )])));
        let after = response(&issuer.handle(fx.request("").as_bytes()).await.unwrap());
        assert_eq!(UserClaims::decode(&after.nats.jwt).unwrap().data.aud, "billing");
    }

    #[tokio::test]
    async fn undecodable_request_gets_no_reply() {
        let fx = Fixture::new();
        let issuer = fx.issuer();

        assert!(issuer.handle(b"garbage").await.is_none());
        assert!(issuer.handle(&[0xff, 0xfe]).await.is_none());

        let forged = fx.request("").replace('.', ".x");
        assert!(issuer.handle(forged.as_bytes()).await.is_none());
    }

    #[tokio::test]
    async fn key_store_signs_inner_token_with_target_account_key() {
        let fx = Fixture::new();
        let orders = KeyPair::new_account();
        let store = MemoryKeyStore::new();
        store.insert("orders", orders.seed().unwrap());
        store.insert("AUTH", fx.auth.seed().unwrap());
        let issuer = CredentialIssuer::new(
            KeyResolver::from_store(Arc::new(store), "AUTH"),
            Arc::clone(&fx.pinned),
        );
        let token = fx.pinned.get_or_create("orders").unwrap();

        let response = response(&issuer.handle(fx.request(token.as_str()).as_bytes()).await.unwrap());

        assert_eq!(response.data.iss, fx.auth.public_key());
        let user = UserClaims::decode(&response.nats.jwt).unwrap();
        assert_eq!(user.data.iss, orders.public_key());
    }

    #[tokio::test]
    async fn missing_target_key_becomes_signed_error() {
        let fx = Fixture::new();
        let store = MemoryKeyStore::new();
        store.insert("AUTH", fx.auth.seed().unwrap());
        let issuer = CredentialIssuer::new(
            KeyResolver::from_store(Arc::new(store), "AUTH"),
            Arc::clone(&fx.pinned),
        );
        let token = fx.pinned.get_or_create("orders").unwrap();

        let response = response(&issuer.handle(fx.request(token.as_str()).as_bytes()).await.unwrap());

        assert!(response.nats.error.contains("orders"));
        assert!(response.nats.jwt.is_empty());
        assert_eq!(response.data.iss, fx.auth.public_key());
    }

    #[tokio::test]
    async fn unsignable_response_is_dropped() {
        let fx = Fixture::new();
        let issuer = CredentialIssuer::new(
            KeyResolver::from_store(Arc::new(MemoryKeyStore::new()), "AUTH"),
            Arc::clone(&fx.pinned),
        );

        assert!(issuer.handle(fx.request("").as_bytes()).await.is_none());
    }

    #[test]
    fn default_queue_group() {
        let fx = Fixture::new();
        assert_eq!(fx.issuer().queue_group(), "auth_callout");
        assert_eq!(
            fx.issuer().with_queue_group("workers").queue_group(),
            "workers"
        );
    }
}
