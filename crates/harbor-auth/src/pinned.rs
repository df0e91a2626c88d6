use crate::claims::UserClaims;
use crate::error::PinnedTokenError;
use nkeys::KeyPair;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;

/// Opaque connect token bound to one account. The secret is an nkey user seed.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PinnedToken(String);

impl PinnedToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for PinnedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PinnedToken").field(&"***").finish()
    }
}

#[derive(Default)]
struct Entries {
    by_token: HashMap<String, (String, UserClaims)>,
    by_account: HashMap<String, PinnedToken>,
}

/// Tokens that skip policy evaluation, used by the server's own internal clients.
///
/// Entries live for the lifetime of the store; there is no removal path.
#[derive(Default)]
pub struct PinnedTokenStore {
    entries: RwLock<Entries>,
}

impl PinnedTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account and pre-authorized claims bound to `token`.
    pub fn lookup(&self, token: &str) -> Option<(String, UserClaims)> {
        if token.is_empty() {
            return None;
        }
        self.entries.read().by_token.get(token).cloned()
    }

    pub fn get(&self, account: &str) -> Option<PinnedToken> {
        self.entries.read().by_account.get(account).cloned()
    }

    /// Mints a token for `account`. Without `claims`, the token grants unlimited access to the
    /// account.
    pub fn add(
        &self,
        account: &str,
        claims: Option<UserClaims>,
    ) -> Result<PinnedToken, PinnedTokenError> {
        let mut entries = self.entries.write();
        if entries.by_account.contains_key(account) {
            return Err(PinnedTokenError::AlreadyPinned(account.to_string()));
        }
        insert(&mut entries, account, claims)
    }

    /// Binds a caller-chosen `token` to `account`, for tokens provisioned outside this process.
    pub fn pin(
        &self,
        token: impl Into<String>,
        account: &str,
        claims: Option<UserClaims>,
    ) -> Result<PinnedToken, PinnedTokenError> {
        let token = PinnedToken(token.into());
        if token.0.is_empty() {
            return Err(PinnedTokenError::EmptyToken);
        }
        let mut entries = self.entries.write();
        if entries.by_account.contains_key(account) {
            return Err(PinnedTokenError::AlreadyPinned(account.to_string()));
        }
        if entries.by_token.contains_key(&token.0) {
            return Err(PinnedTokenError::TokenInUse);
        }
        bind(&mut entries, token.clone(), account, claims);
        Ok(token)
    }

    /// Token for `account`, minting it on first use.
    pub fn get_or_create(&self, account: &str) -> Result<PinnedToken, PinnedTokenError> {
        if let Some(token) = self.get(account) {
            return Ok(token);
        }
        let mut entries = self.entries.write();
        if let Some(token) = entries.by_account.get(account) {
            return Ok(token.clone());
        }
        insert(&mut entries, account, None)
    }

    pub fn len(&self) -> usize {
        self.entries.read().by_account.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn insert(
    entries: &mut Entries,
    account: &str,
    claims: Option<UserClaims>,
) -> Result<PinnedToken, PinnedTokenError> {
    let token = mint()?;
    bind(entries, token.clone(), account, claims);
    Ok(token)
}

fn bind(entries: &mut Entries, token: PinnedToken, account: &str, claims: Option<UserClaims>) {
    let claims = claims.unwrap_or_else(|| default_claims(account));
    entries
        .by_token
        .insert(token.0.clone(), (account.to_string(), claims));
    entries.by_account.insert(account.to_string(), token);
}

fn mint() -> Result<PinnedToken, PinnedTokenError> {
    KeyPair::new_user()
        .seed()
        .map(PinnedToken)
        .map_err(|e| PinnedTokenError::Mint(e.to_string()))
}

fn default_claims(account: &str) -> UserClaims {
    let mut claims = UserClaims::new("");
    claims.data.aud = account.to_string();
    claims
}
