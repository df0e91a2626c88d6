//! # harbor-nats
//!
//! NATS client plumbing shared by the harbor crates.
//!
//! - Per-operation client traits, so responders and flows can run against an in-memory client
//! - Connection to the embedded server with reconnection and event logging
//! - Mock NATS client for testing (with `test-support` feature)
//!
//! ```rust,no_run
//! use harbor_nats::{NatsAuth, NatsConfig, connect};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = NatsConfig::new(
//!         vec!["nats://127.0.0.1:4222".to_string()],
//!         NatsAuth::Token("s3cr3t".to_string()),
//!     );
//!     let client = connect(&config).await.expect("Failed to connect");
//! }
//! ```

pub mod auth;
pub mod client;
pub mod connect;

#[cfg(any(test, feature = "test-support"))]
pub mod mocks;

pub use auth::{NatsAuth, NatsConfig};
pub use client::{MessagingClient, PublishClient, SubscribeClient};
pub use connect::{ConnectError, connect};

#[cfg(feature = "test-support")]
pub use mocks::{MockError, MockNatsClient, PublishedMessage};
