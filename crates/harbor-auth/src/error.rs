use thiserror::Error;

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("malformed token: expected three dot-separated segments")]
    Malformed,

    #[error("invalid base64 segment: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid claims json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported algorithm {0:?}")]
    UnsupportedAlgorithm(String),

    #[error("expected {expected} claims, found {found:?}")]
    UnexpectedClaimType {
        expected: &'static str,
        found: String,
    },

    #[error("{claim_type} claims cannot be signed by {issuer}")]
    InvalidSigner {
        claim_type: &'static str,
        issuer: String,
    },

    #[error("signature error: {0}")]
    Signature(String),

    #[error("token expired")]
    Expired,

    #[error("token not yet valid")]
    NotYetValid,
}

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("no signing key stored for account {0}")]
    NotFound(String),

    #[error("key store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("signing_key and signing_key_store are mutually exclusive")]
    Conflict,

    #[error("no signing key configured for account {0}")]
    NotConfigured(String),

    #[error(transparent)]
    Store(#[from] KeyStoreError),

    #[error("invalid signing key for account {account}: {reason}")]
    InvalidSeed { account: String, reason: String },
}

#[derive(Debug, Error)]
pub enum PinnedTokenError {
    #[error("account {0} already has a pinned token")]
    AlreadyPinned(String),

    #[error("token is already pinned to another account")]
    TokenInUse,

    #[error("pinned token must not be empty")]
    EmptyToken,

    #[error("failed to mint token: {0}")]
    Mint(String),
}

/// Errors from policy evaluation. The display text is what the connecting client is told.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("no matching policy")]
    NoMatchingPolicy,

    #[error("{0}")]
    Denied(String),

    #[error("no target account specified")]
    NoTargetAccount,
}

#[derive(Debug, Error)]
pub enum IssueError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Jwt(#[from] JwtError),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("failed to subscribe to {subject}: {reason}")]
    Subscribe { subject: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_errors_render_client_facing_text() {
        assert_eq!(PolicyError::NoMatchingPolicy.to_string(), "no matching policy");
        assert_eq!(
            PolicyError::Denied("access denied".to_string()).to_string(),
            "access denied"
        );
        assert_eq!(
            PolicyError::NoTargetAccount.to_string(),
            "no target account specified"
        );
    }

    #[test]
    fn issue_error_is_transparent() {
        let err = IssueError::from(KeyError::NotConfigured("orders".to_string()));
        assert_eq!(
            err.to_string(),
            "no signing key configured for account orders"
        );
    }
}
