use async_nats::subject::ToSubject;
use async_nats::{Client as NatsAsyncClient, HeaderMap, Message, Subscriber};
use bytes::Bytes;
use futures::Stream;
use std::error::Error;
use std::future::Future;

/// Plain and queue-group subscriptions.
///
/// The subscription type is a message stream so that responders and flows can be driven by an
/// in-memory client in tests.
pub trait SubscribeClient: Send + Sync + Clone + 'static {
    type SubscribeError: Error + Send + Sync;
    type Subscription: Stream<Item = Message> + Send + Unpin + 'static;

    fn subscribe<S: ToSubject + Send>(
        &self,
        subject: S,
    ) -> impl Future<Output = Result<Self::Subscription, Self::SubscribeError>> + Send;

    fn queue_subscribe<S: ToSubject + Send>(
        &self,
        subject: S,
        queue_group: String,
    ) -> impl Future<Output = Result<Self::Subscription, Self::SubscribeError>> + Send;
}

pub trait PublishClient: Send + Sync + Clone + 'static {
    type PublishError: Error + Send + Sync;

    fn publish_with_headers<S: ToSubject + Send>(
        &self,
        subject: S,
        headers: HeaderMap,
        payload: Bytes,
    ) -> impl Future<Output = Result<(), Self::PublishError>> + Send;
}

/// A client that can both listen and answer; what responders and flows need.
pub trait MessagingClient: SubscribeClient + PublishClient {}

impl<T: SubscribeClient + PublishClient> MessagingClient for T {}

impl SubscribeClient for NatsAsyncClient {
    type SubscribeError = async_nats::client::SubscribeError;
    type Subscription = Subscriber;

    async fn subscribe<S: ToSubject + Send>(
        &self,
        subject: S,
    ) -> Result<Subscriber, Self::SubscribeError> {
        self.subscribe(subject).await
    }

    async fn queue_subscribe<S: ToSubject + Send>(
        &self,
        subject: S,
        queue_group: String,
    ) -> Result<Subscriber, Self::SubscribeError> {
        self.queue_subscribe(subject, queue_group).await
    }
}

impl PublishClient for NatsAsyncClient {
    type PublishError = async_nats::client::PublishError;

    async fn publish_with_headers<S: ToSubject + Send>(
        &self,
        subject: S,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Result<(), Self::PublishError> {
        self.publish_with_headers(subject, headers, payload).await
    }
}
