use crate::auth::{NatsAuth, NatsConfig};
use async_nats::{Client, ConnectOptions, Event};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("no NATS servers configured")]
    NoServers,
    #[error("NATS servers {servers:?} unreachable: {source}")]
    Unreachable {
        servers: Vec<String>,
        #[source]
        source: async_nats::ConnectError,
    },
}

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Internal clients talk to a server on the same host, so backoff stays short.
fn reconnect_delay(attempts: usize) -> Duration {
    let exponent = attempts.min(16) as u32;
    Duration::from_millis(100u64 << exponent).min(MAX_RECONNECT_DELAY)
}

fn log_event(event: &Event) {
    match event {
        Event::Disconnected | Event::LameDuckMode | Event::SlowConsumer(_) => {
            warn!(event = %event, "internal client degraded")
        }
        Event::ServerError(e) => warn!(error = %e, "server reported an error"),
        Event::ClientError(e) => warn!(error = %e, "client error"),
        Event::Connected | Event::Closed | Event::Draining => {
            debug!(event = %event, "internal client state changed")
        }
    }
}

fn options_for(config: &NatsConfig) -> ConnectOptions {
    let mut opts = match &config.auth {
        NatsAuth::UserPassword { user, password } => {
            ConnectOptions::with_user_and_password(user.clone(), password.clone())
        }
        NatsAuth::Token(token) => ConnectOptions::with_token(token.clone()),
        NatsAuth::None => ConnectOptions::new(),
    };
    if let Some(name) = &config.name {
        opts = opts.name(name.clone());
    }
    opts.connection_timeout(CONNECTION_TIMEOUT)
        .reconnect_delay_callback(reconnect_delay)
        .event_callback(|event| async move { log_event(&event) })
}

/// Opens an internal client against the embedded server.
#[instrument(name = "nats.connect", skip(config), fields(servers = ?config.servers, auth = %config.auth.description()))]
pub async fn connect(config: &NatsConfig) -> Result<Client, ConnectError> {
    if config.servers.is_empty() {
        return Err(ConnectError::NoServers);
    }

    let client = options_for(config)
        .connect(&config.servers)
        .await
        .map_err(|source| ConnectError::Unreachable {
            servers: config.servers.clone(),
            source,
        })?;
    info!(name = config.name.as_deref().unwrap_or_default(), "internal client connected");
    Ok(client)
}
