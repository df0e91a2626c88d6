//! NATS JWT claims and their `ed25519-nkey` envelope.

use crate::error::JwtError;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use data_encoding::BASE32_NOPAD;
use nkeys::KeyPair;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512_256};
use std::time::{SystemTime, UNIX_EPOCH};

pub const ALGORITHM: &str = "ed25519-nkey";
pub const CLAIMS_VERSION: u8 = 2;
/// `-1` disables a limit.
pub const NO_LIMIT: i64 = -1;

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    typ: String,
    alg: String,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            typ: "JWT".to_string(),
            alg: ALGORITHM.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimsData {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub jti: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub iat: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub iss: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub aud: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub exp: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub nbf: i64,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenericFields {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(rename = "type", default)]
    pub claim_type: String,
    #[serde(default)]
    pub version: u8,
}

/// The `nats` section of a claim set.
pub trait ClaimBody: Serialize + DeserializeOwned + Default {
    const CLAIM_TYPE: &'static str;
    /// Public-key prefix required of the signer (`A` account, `N` server).
    const SIGNER_PREFIX: char;

    fn generic(&self) -> &GenericFields;
    fn generic_mut(&mut self) -> &mut GenericFields;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims<T> {
    #[serde(flatten)]
    pub data: ClaimsData,
    pub nats: T,
}

pub type UserClaims = Claims<User>;
pub type AuthorizationRequestClaims = Claims<AuthorizationRequest>;
pub type AuthorizationResponseClaims = Claims<AuthorizationResponse>;

impl<T: ClaimBody> Claims<T> {
    pub fn new(subject: impl Into<String>) -> Self {
        let mut nats = T::default();
        let generic = nats.generic_mut();
        generic.claim_type = T::CLAIM_TYPE.to_string();
        generic.version = CLAIMS_VERSION;
        Self {
            data: ClaimsData {
                sub: subject.into(),
                ..ClaimsData::default()
            },
            nats,
        }
    }

    /// Signs the claims, setting `iss`, `iat` and `jti` on `self`.
    pub fn encode(&mut self, signer: &KeyPair) -> Result<String, JwtError> {
        let issuer = signer.public_key();
        if !issuer.starts_with(T::SIGNER_PREFIX) {
            return Err(JwtError::InvalidSigner {
                claim_type: T::CLAIM_TYPE,
                issuer,
            });
        }
        let generic = self.nats.generic_mut();
        generic.claim_type = T::CLAIM_TYPE.to_string();
        generic.version = CLAIMS_VERSION;

        self.data.iss = issuer;
        self.data.iat = now();
        self.data.jti = String::new();
        let digest = Sha512_256::digest(serde_json::to_vec(&*self)?);
        self.data.jti = BASE32_NOPAD.encode(&digest);

        let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&Header::default())?);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&*self)?);
        let signing_input = format!("{header}.{payload}");
        let signature = signer
            .sign(signing_input.as_bytes())
            .map_err(|e| JwtError::Signature(e.to_string()))?;
        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    /// Parses and verifies a token: algorithm, claim type, signature against `iss`, time bounds.
    pub fn decode(token: &str) -> Result<Self, JwtError> {
        let mut parts = token.trim().split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(JwtError::Malformed);
        };

        let parsed: Header = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(header)?)?;
        if parsed.alg != ALGORITHM {
            return Err(JwtError::UnsupportedAlgorithm(parsed.alg));
        }

        let claims: Self = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload)?)?;
        let found = &claims.nats.generic().claim_type;
        if found != T::CLAIM_TYPE {
            return Err(JwtError::UnexpectedClaimType {
                expected: T::CLAIM_TYPE,
                found: found.clone(),
            });
        }

        let verifier = KeyPair::from_public_key(&claims.data.iss)
            .map_err(|e| JwtError::Signature(e.to_string()))?;
        let signature = URL_SAFE_NO_PAD.decode(signature)?;
        verifier
            .verify(format!("{header}.{payload}").as_bytes(), &signature)
            .map_err(|e| JwtError::Signature(e.to_string()))?;

        let now = now();
        if claims.data.exp > 0 && now > claims.data.exp {
            return Err(JwtError::Expired);
        }
        if claims.data.nbf > 0 && now < claims.data.nbf {
            return Err(JwtError::NotYetValid);
        }
        Ok(claims)
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny: Vec<String>,
}

impl Permission {
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePermission {
    #[serde(rename = "max", default)]
    pub max_msgs: i64,
    /// Nanoseconds.
    #[serde(rename = "ttl", default)]
    pub expires: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(rename = "pub", default, skip_serializing_if = "Permission::is_empty")]
    pub publish: Permission,
    #[serde(rename = "sub", default, skip_serializing_if = "Permission::is_empty")]
    pub subscribe: Permission,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resp: Option<ResponsePermission>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub src: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub times: Vec<TimeRange>,
    #[serde(rename = "times_location", default, skip_serializing_if = "String::is_empty")]
    pub locale: String,
    #[serde(default = "no_limit")]
    pub subs: i64,
    #[serde(default = "no_limit")]
    pub data: i64,
    #[serde(default = "no_limit")]
    pub payload: i64,
}

fn no_limit() -> i64 {
    NO_LIMIT
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            src: Vec::new(),
            times: Vec::new(),
            locale: String::new(),
            subs: NO_LIMIT,
            data: NO_LIMIT,
            payload: NO_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(flatten)]
    pub permissions: Permissions,
    #[serde(flatten)]
    pub limits: Limits,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bearer_token: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_connection_types: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub issuer_account: String,
    #[serde(flatten)]
    pub generic: GenericFields,
}

impl ClaimBody for User {
    const CLAIM_TYPE: &'static str = "user";
    const SIGNER_PREFIX: char = 'A';

    fn generic(&self) -> &GenericFields {
        &self.generic
    }

    fn generic_mut(&mut self) -> &mut GenericFields {
        &mut self.generic
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerId {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub xkey: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientInformation {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub id: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name_tag: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub client_type: String,
    #[serde(rename = "mqtt_id", default, skip_serializing_if = "String::is_empty")]
    pub mqtt: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nonce: String,
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

/// What the client sent in its CONNECT.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectOptions {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub jwt: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nkey: String,
    #[serde(rename = "sig", default, skip_serializing_if = "String::is_empty")]
    pub signed_nonce: String,
    #[serde(rename = "auth_token", default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    #[serde(rename = "user", default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(rename = "pass", default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub lang: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default)]
    pub protocol: i64,
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("username", &self.username)
            .field("has_token", &!self.token.is_empty())
            .field("has_password", &!self.password.is_empty())
            .field("name", &self.name)
            .field("lang", &self.lang)
            .field("version", &self.version)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    #[serde(rename = "server_id", default)]
    pub server: ServerId,
    #[serde(default)]
    pub user_nkey: String,
    #[serde(rename = "client_info", default)]
    pub client_information: ClientInformation,
    #[serde(rename = "connect_opts", default)]
    pub connect_options: ConnectOptions,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_nonce: String,
    #[serde(flatten)]
    pub generic: GenericFields,
}

impl ClaimBody for AuthorizationRequest {
    const CLAIM_TYPE: &'static str = "authorization_request";
    const SIGNER_PREFIX: char = 'N';

    fn generic(&self) -> &GenericFields {
        &self.generic
    }

    fn generic_mut(&mut self) -> &mut GenericFields {
        &mut self.generic
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationResponse {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub jwt: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub issuer_account: String,
    #[serde(flatten)]
    pub generic: GenericFields,
}

impl ClaimBody for AuthorizationResponse {
    const CLAIM_TYPE: &'static str = "authorization_response";
    const SIGNER_PREFIX: char = 'A';

    fn generic(&self) -> &GenericFields {
        &self.generic
    }

    fn generic_mut(&mut self) -> &mut GenericFields {
        &mut self.generic
    }
}
