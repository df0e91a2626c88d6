mod signal;
mod telemetry;

use clap::Parser;
use harbor_server::collector::VarzCollectorFactory;
use harbor_server::config::{self, Options};
use harbor_server::process::ProcessEngineFactory;
use harbor_server::{Host, Runtime};
use signal::{Action, Signals};
use telemetry::Telemetry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

type ProcessHost = Host<ProcessEngineFactory, VarzCollectorFactory>;

#[derive(Parser, Debug)]
#[command(name = "harbord")]
#[command(about = "Embedded NATS server with an auth callout credential issuer", long_about = None)]
struct Args {
    /// JSON configuration file, re-read on SIGHUP.
    #[arg(long, env = "HARBOR_CONFIG")]
    config: PathBuf,

    #[arg(long = "nats-server-bin", env = "NATS_SERVER_BIN", default_value = "nats-server")]
    nats_server_bin: PathBuf,

    #[arg(
        long = "ready-timeout-secs",
        env = "HARBOR_READY_TIMEOUT_SECS",
        default_value_t = 5
    )]
    ready_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let options = config::load(&args.config)?;
    let telemetry = Telemetry::init(&options.name);

    info!(config = %args.config.display(), "harbord starting");

    let runtime = Runtime::new(
        ProcessEngineFactory::new(args.nats_server_bin.clone())?,
        VarzCollectorFactory::new(&telemetry.meter()),
    )
    .with_ready_timeout(Duration::from_secs(args.ready_timeout_secs.max(1)));
    let mut host = Host::new(Arc::new(runtime));

    let result = run(&mut host, &args.config, options).await;
    host.shutdown().await;

    telemetry.shutdown();

    if let Err(ref e) = result {
        error!(error = %e, "harbord stopped with error");
    } else {
        info!("harbord stopped");
    }

    result
}

async fn run(
    host: &mut ProcessHost,
    config_path: &Path,
    options: Options,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut signals = Signals::install();
    host.start(options).await?;
    info!("harbord running");

    loop {
        match signals.next().await {
            Action::Shutdown => {
                info!("harbord shutting down");
                return Ok(());
            }
            Action::Reload => match config::load(config_path) {
                Ok(options) => {
                    if let Err(e) = host.reload(options).await {
                        error!(error = %e, "reload failed");
                    }
                }
                Err(e) => error!(error = %e, "failed to read configuration, keeping current"),
            },
        }
    }
}
