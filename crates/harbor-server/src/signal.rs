//! Process signals `harbord` acts on: SIGINT/SIGTERM stop it, SIGHUP re-reads the config.

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Shutdown,
    Reload,
}

/// Signal streams registered once at startup; deliveries between calls to
/// [`Signals::next`] are buffered, not lost.
pub struct Signals {
    #[cfg(unix)]
    interrupt: Option<tokio::signal::unix::Signal>,
    #[cfg(unix)]
    terminate: Option<tokio::signal::unix::Signal>,
    #[cfg(unix)]
    hangup: Option<tokio::signal::unix::Signal>,
}

impl Signals {
    pub fn install() -> Self {
        #[cfg(unix)]
        {
            use tokio::signal::unix::SignalKind;
            Self {
                interrupt: listen(SignalKind::interrupt(), "SIGINT"),
                terminate: listen(SignalKind::terminate(), "SIGTERM"),
                hangup: listen(SignalKind::hangup(), "SIGHUP"),
            }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    #[cfg(unix)]
    pub async fn next(&mut self) -> Action {
        tokio::select! {
            Some(()) = recv(&mut self.interrupt) => {
                info!("SIGINT received");
                Action::Shutdown
            }
            Some(()) = recv(&mut self.terminate) => {
                info!("SIGTERM received");
                Action::Shutdown
            }
            Some(()) = recv(&mut self.hangup) => {
                info!("SIGHUP received");
                Action::Reload
            }
            else => std::future::pending::<Action>().await,
        }
    }

    #[cfg(not(unix))]
    pub async fn next(&mut self) -> Action {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(error = %error, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
        Action::Shutdown
    }
}

#[cfg(unix)]
fn listen(kind: tokio::signal::unix::SignalKind, name: &str) -> Option<tokio::signal::unix::Signal> {
    match tokio::signal::unix::signal(kind) {
        Ok(signal) => Some(signal),
        Err(error) => {
            warn!(error = %error, signal = name, "signal handler unavailable");
            None
        }
    }
}

/// Pends forever for a stream that could not be registered.
#[cfg(unix)]
async fn recv(signal: &mut Option<tokio::signal::unix::Signal>) -> Option<()> {
    match signal {
        Some(signal) => signal.recv().await,
        None => std::future::pending().await,
    }
}
