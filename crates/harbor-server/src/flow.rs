//! Per-account background data flows.

use crate::error::FlowError;
use async_nats::HeaderMap;
use futures::StreamExt;
use harbor_nats::MessagingClient;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowConfig {
    /// Copies every message on `from` to `to`, headers included.
    Republish { from: String, to: String },
}

impl FlowConfig {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Republish { .. } => "republish",
        }
    }

    /// Runs until `cancel` fires or the subscription ends.
    #[instrument(name = "flow.run", skip_all, fields(flow = self.name()))]
    pub async fn run<N>(&self, client: N, cancel: CancellationToken) -> Result<(), FlowError>
    where
        N: MessagingClient,
    {
        match self {
            Self::Republish { from, to } => republish(client, from, to, cancel).await,
        }
    }
}

async fn republish<N>(
    client: N,
    from: &str,
    to: &str,
    cancel: CancellationToken,
) -> Result<(), FlowError>
where
    N: MessagingClient,
{
    let mut messages =
        client
            .subscribe(from.to_string())
            .await
            .map_err(|e| FlowError::Subscribe {
                subject: from.to_string(),
                reason: e.to_string(),
            })?;
    info!(from, to, "republish flow running");

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = messages.next() => message,
        };
        let Some(message) = message else {
            warn!(from, "republish subscription closed");
            break;
        };
        let headers = message.headers.unwrap_or_else(HeaderMap::new);
        if let Err(e) = client
            .publish_with_headers(to.to_string(), headers, message.payload)
            .await
        {
            warn!(error = %e, to, "failed to republish message");
        }
    }
    Ok(())
}
