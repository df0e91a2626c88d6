//! Create, reuse or restart decisions for the process-wide engine and collector.

use crate::collector::{Collector, CollectorFactory, CollectorOptions};
use crate::engine::{Engine, EngineFactory, EngineOptions};
use crate::error::{CollectorError, SupervisorError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// At most one live `T`. Writers only swap the reference.
pub struct Singleton<T> {
    slot: Mutex<Option<Arc<T>>>,
}

impl<T> Default for Singleton<T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl<T> Singleton<T> {
    pub fn get(&self) -> Option<Arc<T>> {
        self.slot.lock().clone()
    }

    pub fn replace(&self, value: Arc<T>) -> Option<Arc<T>> {
        self.slot.lock().replace(value)
    }

    pub fn take(&self) -> Option<Arc<T>> {
        self.slot.lock().take()
    }

    /// Clears the slot only if it still holds `value`.
    pub fn take_if(&self, value: &Arc<T>) -> bool {
        let mut slot = self.slot.lock();
        match slot.as_ref() {
            Some(current) if Arc::ptr_eq(current, value) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }
}

pub struct ServerSupervisor<F: EngineFactory> {
    factory: F,
    singleton: Singleton<F::Engine>,
    ready_timeout: Duration,
}

impl<F: EngineFactory> ServerSupervisor<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            singleton: Singleton::default(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn current(&self) -> Option<Arc<F::Engine>> {
        self.singleton.get()
    }

    /// Reloads the running engine with `options`, or creates one.
    ///
    /// An engine that refuses the reload as unsupported is replaced by a fresh one; any other
    /// reload error is returned and the running engine is left alone.
    #[instrument(name = "server_supervisor.ensure_running", skip_all)]
    pub async fn ensure_running(
        &self,
        options: &EngineOptions,
    ) -> Result<Arc<F::Engine>, SupervisorError> {
        if let Some(engine) = self.singleton.get() {
            match engine.reload(options).await {
                Ok(()) => {
                    info!("server reloaded in place");
                    return Ok(engine);
                }
                Err(e) if e.is_reload_unsupported() => {
                    info!(reason = %e, "server cannot reload these options, restarting");
                    engine.shutdown().await;
                    self.singleton.take_if(&engine);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let engine = Arc::new(self.factory.create(options)?);
        if let Err(e) = engine.start().await {
            engine.shutdown().await;
            return Err(e.into());
        }
        if let Some(previous) = self.singleton.replace(Arc::clone(&engine)) {
            warn!("replacing a server started concurrently");
            previous.shutdown().await;
        }
        info!(url = %engine.client_url(), "server started");
        Ok(engine)
    }

    /// Waits for `engine` to accept connections; on timeout it is shut down and forgotten.
    pub async fn await_ready(&self, engine: &Arc<F::Engine>) -> Result<(), SupervisorError> {
        if engine.ready_for_connections(self.ready_timeout).await {
            return Ok(());
        }
        warn!(timeout = ?self.ready_timeout, "server not ready, shutting it down");
        engine.shutdown().await;
        self.singleton.take_if(engine);
        Err(SupervisorError::NotReady(self.ready_timeout))
    }

    pub async fn shutdown(&self) {
        if let Some(engine) = self.singleton.take() {
            engine.shutdown().await;
            info!("server stopped");
        }
    }
}

pub struct CollectorSupervisor<C: CollectorFactory> {
    factory: C,
    singleton: Singleton<C::Collector>,
}

impl<C: CollectorFactory> CollectorSupervisor<C> {
    pub fn new(factory: C) -> Self {
        Self {
            factory,
            singleton: Singleton::default(),
        }
    }

    pub fn current(&self) -> Option<Arc<C::Collector>> {
        self.singleton.get()
    }

    #[instrument(name = "collector_supervisor.ensure_running", skip_all)]
    pub async fn ensure_running(
        &self,
        options: &CollectorOptions,
    ) -> Result<Arc<C::Collector>, SupervisorError> {
        if let Some(collector) = self.singleton.get() {
            match collector.reload(options) {
                Ok(()) => return Ok(collector),
                Err(CollectorError::ReloadUnsupported) => {
                    info!("collector options changed, restarting");
                    collector.stop().await;
                    self.singleton.take_if(&collector);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let collector = Arc::new(self.factory.create(options)?);
        collector.start()?;
        if let Some(previous) = self.singleton.replace(Arc::clone(&collector)) {
            previous.stop().await;
        }
        Ok(collector)
    }

    pub async fn shutdown(&self) {
        if let Some(collector) = self.singleton.take() {
            collector.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::testing::{FakeCollectorFactory, FakeEngineFactory};

    fn options(port: u16) -> EngineOptions {
        EngineOptions {
            port,
            ..EngineOptions::default()
        }
    }

    #[test]
    fn take_if_ignores_replaced_values() {
        let singleton = Singleton::default();
        let first = Arc::new(1);
        let second = Arc::new(2);
        singleton.replace(Arc::clone(&first));
        singleton.replace(Arc::clone(&second));

        assert!(!singleton.take_if(&first));
        assert!(singleton.take_if(&second));
        assert!(singleton.get().is_none());
    }

    #[tokio::test]
    async fn first_start_creates_engine() {
        let factory = FakeEngineFactory::default();
        let supervisor = ServerSupervisor::new(factory.clone());

        let engine = supervisor.ensure_running(&options(4222)).await.unwrap();
        supervisor.await_ready(&engine).await.unwrap();

        assert_eq!(factory.created(), 1);
        assert!(engine.is_running());
        assert!(Arc::ptr_eq(&supervisor.current().unwrap(), &engine));
    }

    #[tokio::test]
    async fn compatible_reload_reuses_engine() {
        let factory = FakeEngineFactory::default();
        let supervisor = ServerSupervisor::new(factory.clone());

        let first = supervisor.ensure_running(&options(4222)).await.unwrap();
        let mut changed = options(4222);
        changed.debug = true;
        let second = supervisor.ensure_running(&changed).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.created(), 1);
        assert_eq!(second.reloads(), 1);
        assert!(second.options().debug);
    }

    #[tokio::test]
    async fn unsupported_reload_restarts_engine() {
        let factory = FakeEngineFactory::default();
        let supervisor = ServerSupervisor::new(factory.clone());

        let first = supervisor.ensure_running(&options(4222)).await.unwrap();
        let second = supervisor.ensure_running(&options(5222)).await.unwrap();
        supervisor.await_ready(&second).await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!first.is_running());
        assert!(second.is_running());
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test]
    async fn other_reload_errors_are_fatal() {
        let factory = FakeEngineFactory::default();
        let supervisor = ServerSupervisor::new(factory.clone());

        let engine = supervisor.ensure_running(&options(4222)).await.unwrap();
        engine.fail_next_reload(EngineError::Reload("permission denied".to_string()));

        let err = supervisor.ensure_running(&options(4222)).await.unwrap_err();
        assert!(err.to_string().contains("permission denied"));
        assert!(engine.is_running());
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn readiness_timeout_shuts_down_and_clears() {
        let factory = FakeEngineFactory::default();
        factory.never_ready();
        let supervisor =
            ServerSupervisor::new(factory.clone()).with_ready_timeout(Duration::from_millis(10));

        let engine = supervisor.ensure_running(&options(4222)).await.unwrap();
        let err = supervisor.await_ready(&engine).await.unwrap_err();

        assert!(matches!(err, SupervisorError::NotReady(_)));
        assert!(!engine.is_running());
        assert!(supervisor.current().is_none());
    }

    #[tokio::test]
    async fn failed_start_leaves_no_singleton() {
        let factory = FakeEngineFactory::default();
        factory.fail_start();
        let supervisor = ServerSupervisor::new(factory.clone());

        assert!(supervisor.ensure_running(&options(4222)).await.is_err());
        assert!(supervisor.current().is_none());
    }

    #[tokio::test]
    async fn collector_restarts_only_on_changed_options() {
        let factory = FakeCollectorFactory::default();
        let supervisor = CollectorSupervisor::new(factory.clone());
        let base = CollectorOptions {
            server_label: "a".to_string(),
            server_url: "http://localhost:8222".to_string(),
            interval: Duration::from_secs(1),
        };

        let first = supervisor.ensure_running(&base).await.unwrap();
        let same = supervisor.ensure_running(&base).await.unwrap();
        assert!(Arc::ptr_eq(&first, &same));

        let changed = CollectorOptions {
            server_label: "b".to_string(),
            ..base
        };
        let second = supervisor.ensure_running(&changed).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(first.is_stopped());
        assert_eq!(factory.created(), 2);

        supervisor.shutdown().await;
        assert!(second.is_stopped());
        assert!(supervisor.current().is_none());
    }
}
