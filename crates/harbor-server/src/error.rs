use thiserror::Error;

/// Marker the engine puts in reload errors for option categories it cannot hot-swap.
pub const RELOAD_NOT_SUPPORTED: &str = "config reload not supported for";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to create server: {0}")]
    Create(String),

    #[error("failed to start server: {0}")]
    Start(String),

    #[error("{0}")]
    Reload(String),

    #[error("account {0} not found")]
    AccountNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to render server config: {0}")]
    Render(#[from] serde_json::Error),
}

impl EngineError {
    pub fn reload_not_supported(fields: &[&str]) -> Self {
        Self::Reload(format!("{RELOAD_NOT_SUPPORTED} {}", fields.join(", ")))
    }

    /// Whether the engine refused a reload because a changed option needs a fresh server.
    pub fn is_reload_unsupported(&self) -> bool {
        matches!(self, Self::Reload(msg) if msg.contains(RELOAD_NOT_SUPPORTED))
    }
}

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("collector cannot apply new options in place")]
    ReloadUnsupported,

    #[error("invalid collector url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("collector already started")]
    AlreadyStarted,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{0}")]
    Invalid(String),
}

impl ConfigError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Collector(#[from] CollectorError),

    #[error("server not ready for connections after {0:?}")]
    NotReady(std::time::Duration),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("cannot {action} a server that is {state}")]
    InvalidState {
        action: &'static str,
        state: &'static str,
    },

    #[error("cannot create internal client: {0}")]
    InternalClient(String),

    #[error(transparent)]
    Connect(#[from] harbor_nats::ConnectError),

    #[error(transparent)]
    PinnedToken(#[from] harbor_auth::PinnedTokenError),

    #[error("failed to generate auth identity: {0}")]
    Identity(String),
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("failed to subscribe to {subject}: {reason}")]
    Subscribe { subject: String, reason: String },
}
