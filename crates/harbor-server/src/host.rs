//! Runs one generation at a time and swaps generations on reload.

use crate::collector::CollectorFactory;
use crate::config::Options;
use crate::engine::EngineFactory;
use crate::error::ServerError;
use crate::runtime::Runtime;
use crate::server::Server;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

pub struct Host<F: EngineFactory, C: CollectorFactory> {
    runtime: Arc<Runtime<F, C>>,
    current: Option<Server<F, C>>,
}

impl<F: EngineFactory, C: CollectorFactory> Host<F, C> {
    pub fn new(runtime: Arc<Runtime<F, C>>) -> Self {
        Self {
            runtime,
            current: None,
        }
    }

    pub fn runtime(&self) -> &Arc<Runtime<F, C>> {
        &self.runtime
    }

    pub fn current(&self) -> Option<&Server<F, C>> {
        self.current.as_ref()
    }

    async fn launch(&self, options: Options) -> (Server<F, C>, Result<(), ServerError>) {
        let mut server = Server::new(Arc::clone(&self.runtime), options);
        let result = match server.provision() {
            Ok(_) => server.start().await,
            Err(e) => Err(e),
        };
        (server, result)
    }

    /// Starts the first generation.
    #[instrument(name = "host.start", skip_all)]
    pub async fn start(&mut self, options: Options) -> Result<(), ServerError> {
        if self.current.is_some() {
            return self.reload(options).await;
        }
        let (mut server, result) = self.launch(options).await;
        if let Err(e) = result {
            server.stop().await;
            return Err(e);
        }
        self.current = Some(server);
        Ok(())
    }

    /// Starts a generation for `options`, then stops the previous one.
    ///
    /// If the new generation fails to start, the previous options are started again as a
    /// fresh generation and the error is returned.
    #[instrument(name = "host.reload", skip_all)]
    pub async fn reload(&mut self, options: Options) -> Result<(), ServerError> {
        let (mut next, result) = self.launch(options).await;
        let error = match result {
            Ok(()) => {
                if let Some(mut previous) = self.current.replace(next) {
                    previous.stop().await;
                }
                info!("configuration reloaded");
                return Ok(());
            }
            Err(e) => e,
        };

        error!(error = %error, "reload failed, restoring previous configuration");
        let Some(mut previous) = self.current.take() else {
            next.stop().await;
            return Err(error);
        };
        let (mut restored, restore) = self.launch(previous.options().clone()).await;
        next.stop().await;
        previous.stop().await;
        match restore {
            Ok(()) => self.current = Some(restored),
            Err(e) => {
                warn!(error = %e, "previous configuration could not be restored");
                restored.stop().await;
            }
        }
        Err(error)
    }

    #[instrument(name = "host.shutdown", skip_all)]
    pub async fn shutdown(&mut self) {
        if let Some(mut server) = self.current.take() {
            server.stop().await;
        }
    }
}
