//! Metrics collector that scrapes the engine's monitoring endpoint.

use crate::error::CollectorError;
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Gauge, Meter};
use parking_lot::Mutex;
use reqwest::Url;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(15);

const SCRAPE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorOptions {
    pub server_label: String,
    pub server_url: String,
    pub interval: Duration,
}

pub trait Collector: Send + Sync + 'static {
    fn start(&self) -> Result<(), CollectorError>;

    /// Applies `options` in place, or fails with [`CollectorError::ReloadUnsupported`].
    fn reload(&self, options: &CollectorOptions) -> Result<(), CollectorError>;

    fn stop(&self) -> impl Future<Output = ()> + Send;
}

pub trait CollectorFactory: Send + Sync + 'static {
    type Collector: Collector;

    fn create(&self, options: &CollectorOptions) -> Result<Self::Collector, CollectorError>;
}

/// Subset of the `/varz` document that is exported.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Varz {
    pub connections: u64,
    pub subscriptions: u64,
    pub slow_consumers: u64,
    pub in_msgs: u64,
    pub out_msgs: u64,
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub mem: u64,
    pub cpu: f64,
}

#[derive(Clone)]
pub struct VarzMetrics {
    connections: Gauge<u64>,
    subscriptions: Gauge<u64>,
    slow_consumers: Gauge<u64>,
    in_msgs: Gauge<u64>,
    out_msgs: Gauge<u64>,
    in_bytes: Gauge<u64>,
    out_bytes: Gauge<u64>,
    mem: Gauge<u64>,
    cpu: Gauge<f64>,
}

impl VarzMetrics {
    pub fn new(meter: &Meter) -> Self {
        let u64_gauge = |name: &'static str, description: &'static str| {
            meter.u64_gauge(name).with_description(description).build()
        };
        Self {
            connections: u64_gauge("nats.server.connections", "Current client connections"),
            subscriptions: u64_gauge("nats.server.subscriptions", "Active subscriptions"),
            slow_consumers: u64_gauge("nats.server.slow_consumers", "Slow consumers seen"),
            in_msgs: u64_gauge("nats.server.in_msgs", "Messages received"),
            out_msgs: u64_gauge("nats.server.out_msgs", "Messages sent"),
            in_bytes: meter
                .u64_gauge("nats.server.in_bytes")
                .with_description("Bytes received")
                .with_unit("By")
                .build(),
            out_bytes: meter
                .u64_gauge("nats.server.out_bytes")
                .with_description("Bytes sent")
                .with_unit("By")
                .build(),
            mem: meter
                .u64_gauge("nats.server.mem")
                .with_description("Resident memory of the server process")
                .with_unit("By")
                .build(),
            cpu: meter
                .f64_gauge("nats.server.cpu")
                .with_description("Server CPU usage in percent")
                .build(),
        }
    }

    pub fn record(&self, server: &str, varz: &Varz) {
        let attrs = &[KeyValue::new("server", server.to_string())];
        self.connections.record(varz.connections, attrs);
        self.subscriptions.record(varz.subscriptions, attrs);
        self.slow_consumers.record(varz.slow_consumers, attrs);
        self.in_msgs.record(varz.in_msgs, attrs);
        self.out_msgs.record(varz.out_msgs, attrs);
        self.in_bytes.record(varz.in_bytes, attrs);
        self.out_bytes.record(varz.out_bytes, attrs);
        self.mem.record(varz.mem, attrs);
        self.cpu.record(varz.cpu, attrs);
    }
}

pub struct VarzCollectorFactory {
    http: reqwest::Client,
    metrics: VarzMetrics,
}

impl VarzCollectorFactory {
    pub fn new(meter: &Meter) -> Self {
        Self {
            http: reqwest::Client::new(),
            metrics: VarzMetrics::new(meter),
        }
    }
}

impl CollectorFactory for VarzCollectorFactory {
    type Collector = VarzCollector;

    fn create(&self, options: &CollectorOptions) -> Result<VarzCollector, CollectorError> {
        let endpoint = varz_url(&options.server_url)?;
        Ok(VarzCollector {
            options: options.clone(),
            endpoint,
            http: self.http.clone(),
            metrics: self.metrics.clone(),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }
}

fn varz_url(server_url: &str) -> Result<Url, CollectorError> {
    let invalid = |reason: String| CollectorError::InvalidUrl {
        url: server_url.to_string(),
        reason,
    };
    let base = Url::parse(server_url).map_err(|e| invalid(e.to_string()))?;
    if !matches!(base.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme {}", base.scheme())));
    }
    let path = format!("{}/varz", base.path().trim_end_matches('/'));
    base.join(&path).map_err(|e| invalid(e.to_string()))
}

/// Polls `{server_url}/varz` every `interval` until stopped.
pub struct VarzCollector {
    options: CollectorOptions,
    endpoint: Url,
    http: reqwest::Client,
    metrics: VarzMetrics,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl VarzCollector {
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Scrapes once and records the result.
    #[instrument(name = "collector.poll", skip(self), fields(url = %self.endpoint))]
    pub async fn poll(&self) -> Result<Varz, reqwest::Error> {
        let varz = scrape(&self.http, self.endpoint.clone()).await?;
        self.metrics.record(&self.options.server_label, &varz);
        Ok(varz)
    }
}

async fn scrape(http: &reqwest::Client, endpoint: Url) -> Result<Varz, reqwest::Error> {
    http.get(endpoint)
        .timeout(SCRAPE_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await
}

impl Collector for VarzCollector {
    fn start(&self) -> Result<(), CollectorError> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Err(CollectorError::AlreadyStarted);
        }

        let http = self.http.clone();
        let endpoint = self.endpoint.clone();
        let metrics = self.metrics.clone();
        let label = self.options.server_label.clone();
        let cancel = self.cancel.clone();
        let mut ticker = tokio::time::interval(self.options.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        *task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match scrape(&http, endpoint.clone()).await {
                    Ok(varz) => metrics.record(&label, &varz),
                    Err(e) => warn!(error = %e, url = %endpoint, "varz scrape failed"),
                }
            }
            debug!(url = %endpoint, "varz collector loop exited");
        }));
        info!(
            server = %self.options.server_label,
            url = %self.endpoint,
            interval = ?self.options.interval,
            "metrics collector started"
        );
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
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(error = %e, "collector task failed");
        }
        info!(server = %self.options.server_label, "metrics collector stopped");
    }
}
