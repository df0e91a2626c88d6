use crate::error::ServiceError;
use crate::issuer::CredentialIssuer;
use async_nats::{HeaderMap, Message};
use futures::StreamExt;
use harbor_nats::{MessagingClient, PublishClient};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

pub const AUTH_CALLOUT_SUBJECT: &str = "$SYS.REQ.USER.AUTH";

/// Answers authorization requests until `shutdown` fires or the subscription ends.
///
/// Each request is handled on its own task; in-flight requests are awaited before returning.
#[instrument(name = "auth_callout.serve", skip_all, fields(queue_group = %issuer.queue_group()))]
pub async fn serve<N>(
    client: N,
    issuer: Arc<CredentialIssuer>,
    shutdown: CancellationToken,
) -> Result<(), ServiceError>
where
    N: MessagingClient,
{
    let mut requests = client
        .queue_subscribe(AUTH_CALLOUT_SUBJECT.to_string(), issuer.queue_group().to_string())
        .await
        .map_err(|e| ServiceError::Subscribe {
            subject: AUTH_CALLOUT_SUBJECT.to_string(),
            reason: e.to_string(),
        })?;
    info!(subject = AUTH_CALLOUT_SUBJECT, "auth callout service listening");

    let mut in_flight = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            message = requests.next() => {
                let Some(message) = message else {
                    warn!("auth callout subscription closed");
                    break;
                };
                in_flight.spawn(respond(client.clone(), Arc::clone(&issuer), message));
            }
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
        }
    }

    while in_flight.join_next().await.is_some() {}
    info!("auth callout service stopped");
    Ok(())
}

async fn respond<N: PublishClient>(client: N, issuer: Arc<CredentialIssuer>, message: Message) {
    let Some(reply) = message.reply else {
        warn!(subject = %message.subject, "authorization request without reply subject");
        return;
    };
    let Some(jwt) = issuer.handle(&message.payload).await else {
        return;
    };
    if let Err(e) = client
        .publish_with_headers(reply.clone(), HeaderMap::new(), jwt.into())
        .await
    {
        warn!(error = %e, reply = %reply, "failed to send authorization response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::{AuthorizationResponseClaims, UserClaims};
    use crate::issuer::tests::Fixture;
    use harbor_nats::MockNatsClient;
    use std::time::Duration;

    async fn wait_for_subscription(client: &MockNatsClient) {
        for _ in 0..200 {
            if !client.subscribed_to().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("service never subscribed");
    }

    async fn wait_for_publishes(client: &MockNatsClient, n: usize) {
        for _ in 0..200 {
            if client.published().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {n} publishes, saw {}", client.published().len());
    }

    #[tokio::test]
    async fn replies_with_signed_response() {
        let fx = Fixture::new();
        let token = fx.pinned.get_or_create("orders").unwrap();
        let client = MockNatsClient::new();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve(
            client.clone(),
            Arc::new(fx.issuer()),
            shutdown.clone(),
        ));

        wait_for_subscription(&client).await;
        assert_eq!(client.subscribed_to(), vec![AUTH_CALLOUT_SUBJECT]);
        assert_eq!(client.queue_groups(), vec![Some("auth_callout".to_string())]);

        let delivered = client.deliver(
            AUTH_CALLOUT_SUBJECT,
            Some("_INBOX.reply"),
            fx.request(token.as_str()),
        );
        assert_eq!(delivered, 1);
        wait_for_publishes(&client, 1).await;

        let published = client.published();
        assert_eq!(published[0].subject, "_INBOX.reply");
        let response = AuthorizationResponseClaims::decode(
            std::str::from_utf8(&published[0].payload).unwrap(),
        )
        .unwrap();
        let user = UserClaims::decode(&response.nats.jwt).unwrap();
        assert_eq!(user.data.aud, "orders");

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn garbage_gets_no_reply() {
        let fx = Fixture::new();
        let client = MockNatsClient::new();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve(
            client.clone(),
            Arc::new(fx.issuer()),
            shutdown.clone(),
        ));
        wait_for_subscription(&client).await;

        client.deliver(AUTH_CALLOUT_SUBJECT, Some("_INBOX.a"), "garbage");
        client.deliver(AUTH_CALLOUT_SUBJECT, None, fx.request(""));
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.cancel();
        task.await.unwrap().unwrap();
        assert!(client.published().is_empty());
    }

    #[tokio::test]
    async fn reply_failure_does_not_stop_service() {
        let fx = Fixture::new();
        let client = MockNatsClient::new();
        client.fail_publish_count(1);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve(
            client.clone(),
            Arc::new(fx.issuer()),
            shutdown.clone(),
        ));
        wait_for_subscription(&client).await;

        client.deliver(AUTH_CALLOUT_SUBJECT, Some("_INBOX.1"), fx.request(""));
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.deliver(AUTH_CALLOUT_SUBJECT, Some("_INBOX.2"), fx.request(""));
        wait_for_publishes(&client, 1).await;

        assert_eq!(client.published_messages(), vec!["_INBOX.2"]);
        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn ends_when_subscription_closes() {
        let fx = Fixture::new();
        let client = MockNatsClient::new();
        let task = tokio::spawn(serve(
            client.clone(),
            Arc::new(fx.issuer()),
            CancellationToken::new(),
        ));
        wait_for_subscription(&client).await;

        client.close_subscriptions();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn subscribe_failure_is_reported() {
        let fx = Fixture::new();
        let client = MockNatsClient::new();
        client.fail_subscribe();

        let err = serve(client, Arc::new(fx.issuer()), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains(AUTH_CALLOUT_SUBJECT));
    }
}
