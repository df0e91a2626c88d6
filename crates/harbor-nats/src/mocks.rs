use crate::client::{PublishClient, SubscribeClient};
use async_nats::subject::ToSubject;
use async_nats::{HeaderMap, Message};
use bytes::Bytes;
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct MockError(pub String);

#[derive(Clone, Debug)]
pub struct PublishedMessage {
    pub subject: String,
    pub headers: HeaderMap,
    pub payload: Bytes,
}

#[derive(Debug)]
struct Subscription {
    subject: String,
    queue_group: Option<String>,
    sender: UnboundedSender<Message>,
}

#[derive(Debug, Default)]
struct State {
    published: Vec<PublishedMessage>,
    subscriptions: Vec<Subscription>,
    publish_fail_count: u32,
    fail_subscribe: bool,
}

/// In-memory client: subscriptions are channels fed by [`MockNatsClient::deliver`], publishes
/// are recorded for inspection.
#[derive(Clone, Debug, Default)]
pub struct MockNatsClient {
    state: Arc<Mutex<State>>,
}

impl MockNatsClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` publishes.
    pub fn fail_publish_count(&self, n: u32) {
        self.state.lock().unwrap().publish_fail_count = n;
    }

    pub fn fail_subscribe(&self) {
        self.state.lock().unwrap().fail_subscribe = true;
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn published_messages(&self) -> Vec<String> {
        self.published().into_iter().map(|m| m.subject).collect()
    }

    pub fn subscribed_to(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .iter()
            .map(|s| s.subject.clone())
            .collect()
    }

    pub fn queue_groups(&self) -> Vec<Option<String>> {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .iter()
            .map(|s| s.queue_group.clone())
            .collect()
    }

    /// Hands a message to every live subscription on `subject`; returns how many received it.
    pub fn deliver(&self, subject: &str, reply: Option<&str>, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        let state = self.state.lock().unwrap();
        state
            .subscriptions
            .iter()
            .filter(|s| s.subject == subject)
            .filter(|s| {
                s.sender
                    .unbounded_send(Message {
                        subject: subject.into(),
                        reply: reply.map(Into::into),
                        payload: payload.clone(),
                        headers: None,
                        status: None,
                        description: None,
                        length: payload.len(),
                    })
                    .is_ok()
            })
            .count()
    }

    /// Ends every subscription stream, as a server disconnect would.
    pub fn close_subscriptions(&self) {
        self.state.lock().unwrap().subscriptions.clear();
    }

    fn register(
        &self,
        subject: String,
        queue_group: Option<String>,
    ) -> Result<UnboundedReceiver<Message>, MockError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_subscribe {
            return Err(MockError(format!("subscribe to {subject} refused")));
        }
        let (sender, receiver) = unbounded();
        state.subscriptions.push(Subscription {
            subject,
            queue_group,
            sender,
        });
        Ok(receiver)
    }
}

impl SubscribeClient for MockNatsClient {
    type SubscribeError = MockError;
    type Subscription = UnboundedReceiver<Message>;

    async fn subscribe<S: ToSubject + Send>(
        &self,
        subject: S,
    ) -> Result<Self::Subscription, MockError> {
        self.register(subject.to_subject().to_string(), None)
    }

    async fn queue_subscribe<S: ToSubject + Send>(
        &self,
        subject: S,
        queue_group: String,
    ) -> Result<Self::Subscription, MockError> {
        self.register(subject.to_subject().to_string(), Some(queue_group))
    }
}

impl PublishClient for MockNatsClient {
    type PublishError = MockError;

    async fn publish_with_headers<S: ToSubject + Send>(
        &self,
        subject: S,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Result<(), MockError> {
        let subject = subject.to_subject().to_string();
        let mut state = self.state.lock().unwrap();
        if state.publish_fail_count > 0 {
            state.publish_fail_count -= 1;
            return Err(MockError(format!("publish to {subject} failed")));
        }
        state.published.push(PublishedMessage {
            subject,
            headers,
            payload,
        });
        Ok(())
    }
}
