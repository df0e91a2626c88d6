//! In-process engine and collector doubles.

use crate::collector::{Collector, CollectorFactory, CollectorOptions};
use crate::engine::{Engine, EngineFactory, EngineOptions};
use crate::error::{CollectorError, EngineError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
struct EngineFactoryState {
    created: AtomicUsize,
    never_ready: AtomicBool,
    fail_start: AtomicBool,
    engines: Mutex<Vec<Arc<FakeEngineState>>>,
}

#[derive(Clone, Default)]
pub struct FakeEngineFactory {
    state: Arc<EngineFactoryState>,
}

impl FakeEngineFactory {
    pub fn created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    pub fn never_ready(&self) {
        self.state.never_ready.store(true, Ordering::SeqCst);
    }

    pub fn fail_start(&self) {
        self.state.fail_start.store(true, Ordering::SeqCst);
    }

    /// Options of the most recently created engine, as last started or reloaded.
    pub fn last_options(&self) -> Option<EngineOptions> {
        self.state
            .engines
            .lock()
            .last()
            .map(|e| e.options.lock().clone())
    }

    /// Engines created so far that are still running.
    pub fn running(&self) -> usize {
        self.state
            .engines
            .lock()
            .iter()
            .filter(|e| e.running.load(Ordering::SeqCst))
            .count()
    }
}

impl EngineFactory for FakeEngineFactory {
    type Engine = FakeEngine;

    fn create(&self, options: &EngineOptions) -> Result<FakeEngine, EngineError> {
        self.state.created.fetch_add(1, Ordering::SeqCst);
        let state = Arc::new(FakeEngineState {
            options: Mutex::new(options.clone()),
            running: AtomicBool::new(false),
            ready: !self.state.never_ready.load(Ordering::SeqCst),
            fail_start: self.state.fail_start.load(Ordering::SeqCst),
            reloads: AtomicUsize::new(0),
            next_reload_error: Mutex::new(None),
        });
        self.state.engines.lock().push(Arc::clone(&state));
        Ok(FakeEngine { state })
    }
}

#[derive(Debug)]
struct FakeEngineState {
    options: Mutex<EngineOptions>,
    running: AtomicBool,
    ready: bool,
    fail_start: bool,
    reloads: AtomicUsize,
    next_reload_error: Mutex<Option<EngineError>>,
}

#[derive(Debug)]
pub struct FakeEngine {
    state: Arc<FakeEngineState>,
}

impl FakeEngine {
    pub fn reloads(&self) -> usize {
        self.state.reloads.load(Ordering::SeqCst)
    }

    pub fn options(&self) -> EngineOptions {
        self.state.options.lock().clone()
    }

    pub fn fail_next_reload(&self, error: EngineError) {
        *self.state.next_reload_error.lock() = Some(error);
    }
}

impl Engine for FakeEngine {
    async fn start(&self) -> Result<(), EngineError> {
        if self.state.fail_start {
            return Err(EngineError::Start("scripted failure".to_string()));
        }
        self.state.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn reload(&self, options: &EngineOptions) -> Result<(), EngineError> {
        if let Some(error) = self.state.next_reload_error.lock().take() {
            return Err(error);
        }
        let mut current = self.state.options.lock();
        let blockers = current.reload_blockers(options);
        if !blockers.is_empty() {
            return Err(EngineError::reload_not_supported(&blockers));
        }
        *current = options.clone();
        self.state.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ready_for_connections(&self, timeout: Duration) -> bool {
        if self.state.ready && self.is_running() {
            return true;
        }
        tokio::time::sleep(timeout).await;
        false
    }

    async fn shutdown(&self) {
        self.state.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    fn client_url(&self) -> String {
        self.state.options.lock().client_url()
    }

    fn lookup_account(&self, name: &str) -> Result<(), EngineError> {
        if self.state.options.lock().has_account(name) {
            Ok(())
        } else {
            Err(EngineError::AccountNotFound(name.to_string()))
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeCollectorFactory {
    created: Arc<AtomicUsize>,
}

impl FakeCollectorFactory {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl CollectorFactory for FakeCollectorFactory {
    type Collector = FakeCollector;

    fn create(&self, options: &CollectorOptions) -> Result<FakeCollector, CollectorError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(FakeCollector {
            options: options.clone(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }
}

pub struct FakeCollector {
    options: CollectorOptions,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl FakeCollector {
    pub fn options(&self) -> &CollectorOptions {
        &self.options
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Collector for FakeCollector {
    fn start(&self) -> Result<(), CollectorError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CollectorError::AlreadyStarted);
        }
        Ok(())
    }

    fn reload(&self, options: &CollectorOptions) -> Result<(), CollectorError> {
        if *options == self.options {
            Ok(())
        } else {
            Err(CollectorError::ReloadUnsupported)
        }
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}
