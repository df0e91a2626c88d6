//! # harbor-auth
//!
//! The auth-callout side of an embedded NATS server: the server forwards each connecting
//! client to `$SYS.REQ.USER.AUTH`, and [`CredentialIssuer`] answers with a signed decision.
//!
//! - [`claims`]: NATS JWT claim sets and their `ed25519-nkey` envelope
//! - [`PinnedTokenStore`]: pre-authorized tokens for the server's internal clients
//! - [`KeyResolver`]: which key signs credentials for a given account
//! - [`policy`]: first-match policy evaluation with `allow` and `deny` policies
//! - [`serve`]: the responder loop over any [`harbor_nats`] client

pub mod claims;
pub mod error;
pub mod issuer;
pub mod keys;
pub mod pinned;
pub mod policy;
pub mod service;

pub use claims::{AuthorizationRequestClaims, AuthorizationResponseClaims, UserClaims};
pub use error::{
    IssueError, JwtError, KeyError, KeyStoreError, PinnedTokenError, PolicyError, ServiceError,
};
pub use issuer::{CredentialIssuer, DEFAULT_QUEUE_GROUP};
pub use keys::{KeyResolver, KeyStore, MemoryKeyStore, SigningIdentity};
pub use pinned::{PinnedToken, PinnedTokenStore};
pub use policy::{
    AllowPolicy, AuthorizationPolicies, AuthorizationPolicy, DenyPolicy, PolicyConfig,
    PolicyEvaluator, UserTemplate,
};
pub use service::{AUTH_CALLOUT_SUBJECT, serve};
