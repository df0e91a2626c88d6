//! One configuration generation: provision, start, stop.

use crate::collector::CollectorFactory;
use crate::config::{Options, Provisioned};
use crate::engine::{Engine, EngineFactory, EngineOptions};
use crate::error::ServerError;
use crate::generation::Generation;
use crate::runtime::{BootstrapUser, Runtime};
use harbor_auth::{CredentialIssuer, serve};
use harbor_nats::{NatsAuth, NatsConfig, connect};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const AUTH_CLIENT_NAME: &str = "harbor-auth-callout";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unprovisioned,
    Provisioned { enabled: bool },
    Started,
    Stopped,
}

impl State {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unprovisioned => "unprovisioned",
            Self::Provisioned { enabled: true } => "provisioned",
            Self::Provisioned { enabled: false } => "disabled",
            Self::Started => "started",
            Self::Stopped => "stopped",
        }
    }
}

pub struct Server<F: EngineFactory, C: CollectorFactory> {
    runtime: Arc<Runtime<F, C>>,
    options: Options,
    state: State,
    generation: Option<Generation>,
    provisioned: Option<Provisioned>,
    cancel: CancellationToken,
    workers: JoinSet<()>,
    clients: Vec<async_nats::Client>,
}

impl<F: EngineFactory, C: CollectorFactory> Server<F, C> {
    pub fn new(runtime: Arc<Runtime<F, C>>, options: Options) -> Self {
        Self {
            runtime,
            options,
            state: State::Unprovisioned,
            generation: None,
            provisioned: None,
            cancel: CancellationToken::new(),
            workers: JoinSet::new(),
            clients: Vec::new(),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn generation(&self) -> Option<Generation> {
        self.generation
    }

    fn invalid_state(&self, action: &'static str) -> ServerError {
        ServerError::InvalidState {
            action,
            state: self.state.as_str(),
        }
    }

    fn is_current(&self) -> bool {
        self.generation
            .is_some_and(|g| self.runtime.generations().is_current(g))
    }

    /// Claims a new generation and resolves the configuration. Runs even when disabled.
    #[instrument(name = "server.provision", skip(self))]
    pub fn provision(&mut self) -> Result<Generation, ServerError> {
        if self.state != State::Unprovisioned {
            return Err(self.invalid_state("provision"));
        }
        let generation = self.runtime.generations().capture();
        self.generation = Some(generation);

        let provisioned = self
            .options
            .provision(self.runtime.identity(), Arc::clone(self.runtime.pinned()))?;
        self.state = State::Provisioned {
            enabled: provisioned.enabled,
        };
        self.provisioned = Some(provisioned);
        debug!(%generation, "server provisioned");
        Ok(generation)
    }

    #[instrument(name = "server.start", skip(self), fields(generation = ?self.generation))]
    pub async fn start(&mut self) -> Result<(), ServerError> {
        match self.state {
            State::Provisioned { enabled: true } => {}
            State::Provisioned { enabled: false } => {
                if self.is_current() {
                    self.runtime.collectors().shutdown().await;
                    self.runtime.servers().shutdown().await;
                }
                info!("server disabled");
                self.state = State::Started;
                return Ok(());
            }
            _ => return Err(self.invalid_state("start")),
        }
        let Some(provisioned) = self.provisioned.as_ref() else {
            return Err(self.invalid_state("start"));
        };

        let mut engine_options = provisioned.engine.clone();
        let mut responder = None;
        if let Some(auth) = &provisioned.auth
            && let Some(issuer) = &auth.issuer
        {
            if engine_options.trusted_operators.is_empty() {
                let user = self.runtime.identity().bootstrap_user()?;
                engine_options = engine_options.with_auth_user(&auth.account, user.to_options());
                responder = Some((Arc::clone(issuer), user));
            } else {
                warn!("in-process auth callout cannot connect when operators are configured");
            }
        }

        let engine = self.runtime.servers().ensure_running(&engine_options).await?;
        match self.attach(engine, &engine_options, responder).await {
            Ok(url) => {
                self.state = State::Started;
                info!(%url, "server started");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "start failed after the engine came up");
                self.stop().await;
                Err(e)
            }
        }
    }

    /// Everything after `ensure_running`: readiness, callout responder, flows, collector.
    async fn attach(
        &mut self,
        engine: Arc<F::Engine>,
        engine_options: &EngineOptions,
        responder: Option<(Arc<CredentialIssuer>, BootstrapUser)>,
    ) -> Result<String, ServerError> {
        let Some(provisioned) = self.provisioned.as_ref() else {
            return Err(self.invalid_state("start"));
        };
        let servers = self.runtime.servers();
        if let Some(auth) = &provisioned.auth
            && let Some(issuer) = &auth.issuer
        {
            issuer.set_policies(auth.policies.clone());
        }
        servers.await_ready(&engine).await?;

        for account in engine_options.accounts.keys() {
            engine.lookup_account(account)?;
        }
        if let Some(auth) = &provisioned.auth {
            engine.lookup_account(&auth.account)?;
        }

        let url = engine.client_url();
        if let Some((issuer, user)) = responder {
            let config = NatsConfig::new(
                vec![url.clone()],
                NatsAuth::UserPassword {
                    user: user.user,
                    password: user.password,
                },
            )
            .with_name(AUTH_CLIENT_NAME);
            let client = connect(&config).await?;
            let cancel = self.cancel.child_token();
            self.workers.spawn({
                let client = client.clone();
                async move {
                    if let Err(e) = serve(client, issuer, cancel).await {
                        error!(error = %e, "auth callout service failed");
                    }
                }
            });
            self.clients.push(client);
        }

        let flows = provisioned.flows.clone();
        for flow in flows {
            let auth = self.internal_client_auth(&flow.account)?;
            let config = NatsConfig::new(vec![url.clone()], auth)
                .with_name(format!("harbor-flow-{}", flow.account));
            let client = connect(&config).await?;
            let cancel = self.cancel.child_token();
            self.workers.spawn({
                let client = client.clone();
                async move {
                    if let Err(e) = flow.flow.run(client, cancel).await {
                        error!(error = %e, account = %flow.account, "flow failed");
                    }
                }
            });
            self.clients.push(client);
        }

        let collector = provisioned.collector.clone();
        match collector {
            Some(options) => {
                self.runtime.collectors().ensure_running(&options).await?;
            }
            None if self.is_current() => self.runtime.collectors().shutdown().await,
            None => {}
        }

        Ok(url)
    }

    /// Stops this generation's workers and clients; the shared engine and collector only
    /// when no newer generation exists. Idempotent.
    #[instrument(name = "server.stop", skip(self), fields(generation = ?self.generation))]
    pub async fn stop(&mut self) {
        let previous = std::mem::replace(&mut self.state, State::Stopped);
        if previous == State::Stopped {
            return;
        }

        self.cancel.cancel();
        while let Some(result) = self.workers.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "worker ended abnormally");
            }
        }
        self.clients.clear();

        if previous == State::Unprovisioned {
            return;
        }
        if self.is_current() {
            self.runtime.collectors().shutdown().await;
            self.runtime.servers().shutdown().await;
            info!("server stopped");
        } else {
            debug!("newer generation owns the shared server");
        }
    }

    /// Credentials an in-process client uses to reach `account`.
    pub fn internal_client_auth(&self, account: &str) -> Result<NatsAuth, ServerError> {
        let Some(provisioned) = self.provisioned.as_ref() else {
            return Err(self.invalid_state("authenticate against"));
        };
        let engine = &provisioned.engine;
        let refuse = |reason: String| Err(ServerError::InternalClient(reason));

        if !engine.trusted_operators.is_empty() {
            return refuse("trusted operators are configured".to_string());
        }
        if !engine.has_account(account) {
            return refuse(format!("account {account} not found"));
        }
        if let Some(authorization) = &engine.authorization {
            if authorization.users.len() > 1 {
                return refuse("multiple users are configured".to_string());
            }
            if let Some(token) = &authorization.token {
                return Ok(NatsAuth::Token(token.clone()));
            }
            if let (Some(user), Some(password)) = (&authorization.user, &authorization.password) {
                return Ok(NatsAuth::UserPassword {
                    user: user.clone(),
                    password: password.clone(),
                });
            }
        }
        if provisioned
            .auth
            .as_ref()
            .is_some_and(|auth| auth.issuer.is_some())
        {
            let token = self.runtime.pinned().get_or_create(account)?;
            return Ok(NatsAuth::Token(token.into_inner()));
        }

        let users = match engine.accounts.get(account) {
            Some(options) => options.users.as_slice(),
            None => engine
                .authorization
                .as_ref()
                .map(|a| a.users.as_slice())
                .unwrap_or_default(),
        };
        match users {
            [] => Ok(NatsAuth::None),
            [user] => Ok(NatsAuth::UserPassword {
                user: user.user.clone(),
                password: user.password.clone(),
            }),
            _ => refuse(format!("multiple users are configured for account {account}")),
        }
    }
}
