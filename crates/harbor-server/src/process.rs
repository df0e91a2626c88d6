//! Engine backed by a `nats-server` child process.

use crate::engine::{Engine, EngineFactory, EngineOptions};
use crate::error::EngineError;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, trace, warn};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(25);
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(5);
const RELOAD_CONFIRM_TIMEOUT: Duration = Duration::from_secs(2);

const RELOAD_APPLIED: &str = "Reloaded server configuration";
const RELOAD_FAILED: &str = "Failed to reload server configuration: ";

/// What `nats-server` logged after a reload signal; `Err` carries its reason.
type ReloadOutcome = Result<(), String>;

pub struct ProcessEngineFactory {
    binary: PathBuf,
    work_dir: Arc<TempDir>,
    created: AtomicU64,
}

impl ProcessEngineFactory {
    /// Config files are written to a private temporary directory removed on drop.
    pub fn new(binary: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let work_dir = tempfile::Builder::new().prefix("harbor-").tempdir()?;
        Ok(Self {
            binary: binary.into(),
            work_dir: Arc::new(work_dir),
            created: AtomicU64::new(0),
        })
    }

    pub fn work_dir(&self) -> &Path {
        self.work_dir.path()
    }
}

impl EngineFactory for ProcessEngineFactory {
    type Engine = ProcessEngine;

    fn create(&self, options: &EngineOptions) -> Result<ProcessEngine, EngineError> {
        if options.port == 0 {
            return Err(EngineError::Create(
                "a fixed client port is required".to_string(),
            ));
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let (reloads, _) = broadcast::channel(8);
        Ok(ProcessEngine {
            binary: self.binary.clone(),
            config_path: self.work_dir.path().join(format!("nats-server-{n}.json")),
            _work_dir: Arc::clone(&self.work_dir),
            options: Mutex::new(options.clone()),
            child: Mutex::new(None),
            reloads,
        })
    }
}

pub struct ProcessEngine {
    binary: PathBuf,
    config_path: PathBuf,
    _work_dir: Arc<TempDir>,
    options: Mutex<EngineOptions>,
    child: Mutex<Option<Child>>,
    reloads: broadcast::Sender<ReloadOutcome>,
}

impl ProcessEngine {
    /// The JSON config `nats-server` was started with.
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    fn pid(&self) -> Option<u32> {
        self.child.lock().as_ref().and_then(Child::id)
    }

    async fn write_config(&self, options: &EngineOptions) -> Result<(), EngineError> {
        let rendered = serde_json::to_vec_pretty(options)?;
        tokio::fs::write(&self.config_path, rendered).await?;
        Ok(())
    }

    /// Writes `options` and signals a reload, then waits for the server's verdict.
    async fn apply(&self, options: &EngineOptions, pid: u32) -> Result<(), EngineError> {
        self.write_config(options).await?;
        let mut outcomes = self.reloads.subscribe();
        self.signal("reload", pid).await?;
        confirm_reload(&mut outcomes, pid).await
    }

    async fn signal(&self, signal: &str, pid: u32) -> Result<(), EngineError> {
        let status = Command::new(&self.binary)
            .arg("--signal")
            .arg(format!("{signal}={pid}"))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(EngineError::Reload(format!(
                "signal {signal} to pid {pid} failed with {status}"
            )))
        }
    }
}

impl Engine for ProcessEngine {
    #[instrument(name = "engine.start", skip(self), fields(config = %self.config_path.display()))]
    async fn start(&self) -> Result<(), EngineError> {
        let options = self.options.lock().clone();
        self.write_config(&options).await?;

        let mut child = Command::new(&self.binary)
            .arg("-c")
            .arg(&self.config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Start(format!("{}: {e}", self.binary.display())))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_logs(stderr, self.reloads.clone()));
        }
        info!(pid = child.id(), url = %options.client_url(), "nats-server spawned");
        *self.child.lock() = Some(child);
        Ok(())
    }

    #[instrument(name = "engine.reload", skip_all)]
    async fn reload(&self, options: &EngineOptions) -> Result<(), EngineError> {
        let previous = {
            let current = self.options.lock();
            let blockers = current.reload_blockers(options);
            if !blockers.is_empty() {
                return Err(EngineError::reload_not_supported(&blockers));
            }
            current.clone()
        };
        let Some(pid) = self.pid() else {
            return Err(EngineError::Reload("server is not running".to_string()));
        };

        if let Err(e) = self.apply(options, pid).await {
            if let Err(restore) = self.write_config(&previous).await {
                error!(error = %restore, "failed to restore the previous nats-server config");
            }
            return Err(e);
        }
        *self.options.lock() = options.clone();
        info!(pid, "nats-server reloaded");
        Ok(())
    }

    async fn ready_for_connections(&self, timeout: Duration) -> bool {
        let address = {
            let options = self.options.lock();
            let url = options.client_url();
            url.trim_start_matches("nats://").to_string()
        };
        let probe = async {
            loop {
                if !self.is_running() {
                    return false;
                }
                if TcpStream::connect(&address).await.is_ok() {
                    return true;
                }
                tokio::time::sleep(READY_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, probe).await.unwrap_or(false)
    }

    #[instrument(name = "engine.shutdown", skip(self))]
    async fn shutdown(&self) {
        let Some(mut child) = self.child.lock().take() else {
            return;
        };
        if let Some(pid) = child.id()
            && let Err(e) = self.signal("quit", pid).await
        {
            warn!(error = %e, pid, "graceful stop failed");
        }
        match tokio::time::timeout(GRACEFUL_STOP_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => info!(%status, "nats-server exited"),
            Ok(Err(e)) => warn!(error = %e, "failed to wait for nats-server"),
            Err(_) => {
                warn!("nats-server did not exit in time, killing");
                if let Err(e) = child.kill().await {
                    error!(error = %e, "failed to kill nats-server");
                }
            }
        }
    }

    fn is_running(&self) -> bool {
        match self.child.lock().as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn client_url(&self) -> String {
        self.options.lock().client_url()
    }

    fn lookup_account(&self, name: &str) -> Result<(), EngineError> {
        if self.options.lock().has_account(name) {
            Ok(())
        } else {
            Err(EngineError::AccountNotFound(name.to_string()))
        }
    }
}

async fn confirm_reload(
    outcomes: &mut broadcast::Receiver<ReloadOutcome>,
    pid: u32,
) -> Result<(), EngineError> {
    match tokio::time::timeout(RELOAD_CONFIRM_TIMEOUT, outcomes.recv()).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(reason))) => Err(EngineError::Reload(reason)),
        Ok(Err(e)) => {
            warn!(error = %e, pid, "reload outcome lost, assuming applied");
            Ok(())
        }
        // Logs may be routed to a file, leaving nothing to observe.
        Err(_) => {
            warn!(pid, "nats-server logged no reload outcome, assuming applied");
            Ok(())
        }
    }
}

fn reload_outcome(message: &str) -> Option<ReloadOutcome> {
    if message.starts_with(RELOAD_APPLIED) {
        return Some(Ok(()));
    }
    message
        .strip_prefix(RELOAD_FAILED)
        .map(|reason| Err(reason.to_string()))
}

/// Re-emits `nats-server` log lines (`[pid] date time [LVL] msg`) through tracing and
/// publishes reload outcomes to `reloads`.
async fn forward_logs<R: AsyncRead + Unpin>(stream: R, reloads: broadcast::Sender<ReloadOutcome>) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let (level, message) = split_level(&line);
                emit(level, message);
                if let Some(outcome) = reload_outcome(message) {
                    let _ = reloads.send(outcome);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "nats-server log stream closed");
                break;
            }
        }
    }
}

fn emit(level: &str, message: &str) {
    match level {
        "FTL" | "ERR" => error!(target: "nats_server", "{message}"),
        "WRN" => warn!(target: "nats_server", "{message}"),
        "DBG" => debug!(target: "nats_server", "{message}"),
        "TRC" => trace!(target: "nats_server", "{message}"),
        _ => info!(target: "nats_server", "{message}"),
    }
}

fn split_level(line: &str) -> (&str, &str) {
    for level in ["FTL", "ERR", "WRN", "INF", "DBG", "TRC"] {
        let tag = format!("[{level}] ");
        if let Some(index) = line.find(&tag) {
            return (level, &line[index + tag.len()..]);
        }
    }
    ("INF", line)
}
