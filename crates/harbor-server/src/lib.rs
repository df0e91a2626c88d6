//! # harbor-server
//!
//! Keeps exactly one embedded NATS server (and one metrics collector) alive across
//! configuration reloads, and wires the in-process auth callout service into it.
//!
//! - [`config`]: JSON configuration, validated and resolved per generation
//! - [`server::Server`]: one generation's provision, start and stop
//! - [`supervisor`]: reload-or-restart decisions for the shared engine and collector
//! - [`host::Host`]: generation swaps with rollback on failed reloads
//! - [`process::ProcessEngine`]: the engine as a `nats-server` child process

pub mod collector;
pub mod config;
pub mod engine;
pub mod error;
pub mod flow;
pub mod generation;
pub mod host;
pub mod process;
pub mod runtime;
pub mod server;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use config::Options;
pub use engine::{Engine, EngineFactory, EngineOptions};
pub use error::{ConfigError, EngineError, ServerError, SupervisorError};
pub use generation::{Generation, GenerationTracker};
pub use host::Host;
pub use runtime::Runtime;
pub use server::Server;
