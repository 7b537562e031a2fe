//! Delivery processor orchestration

pub mod monitor;
pub mod worker;

use std::{collections::HashSet, sync::Arc, time::Duration};

use courier_common::{Address, MessageLimits, Signal, internal};
use courier_dkim::{DkimConfig, DkimSigner};
use courier_metrics::Metrics;
use courier_spool::{EmlArchive, SpoolConfig};
use serde::Deserialize;
use tokio::{sync::broadcast, task::JoinSet};

use crate::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig},
    dispatcher::Dispatcher,
    error::{DeliveryError, SystemError},
    policy::RetryPolicy,
    provider::{LegacyForwarder, ProviderConfig},
    queue::{DeadLetter, DeliveryQueue, QueueEntry},
    rate_limiter::{RateLimitConfig, SenderRateLimiter},
    service::DeliveryService,
    stats::RollingStats,
};

fn default_workers() -> usize {
    num_cpus::get().max(1)
}

const fn default_queue_capacity() -> usize {
    10_000
}

const fn default_send_timeout() -> u64 {
    60
}

const fn default_latency_refresh() -> u64 {
    30
}

const fn default_stats_window() -> u64 {
    300 // 5 minutes
}

const fn default_backlog_alert_threshold() -> usize {
    100
}

const fn default_monitor_interval() -> u64 {
    60
}

const fn default_shutdown_grace() -> u64 {
    30
}

/// Worker pool and everything it delivers through
///
/// Deserialized from the `delivery` section of the configuration, then
/// [`init`](Self::init) builds the runtime pieces and [`serve`](Self::serve)
/// runs the workers until shutdown.
#[derive(Debug, Deserialize)]
pub struct DeliveryProcessor {
    /// Number of concurrent delivery workers
    ///
    /// Default: number of CPUs
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Maximum number of queued messages before submissions are refused
    ///
    /// Default: 10000
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Deadline for a single provider send (in seconds)
    ///
    /// A send that exceeds it counts as a transient failure.
    ///
    /// Default: 60 seconds
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,

    /// How often equal-priority providers are re-ranked by latency (in seconds)
    ///
    /// Default: 30 seconds
    #[serde(default = "default_latency_refresh")]
    pub latency_refresh_secs: u64,

    /// Width of the success rate window reported by the admin snapshot
    ///
    /// Default: 300 seconds
    #[serde(default = "default_stats_window")]
    pub stats_window_secs: u64,

    /// Dead letters tolerated before the monitor starts warning
    ///
    /// Default: 100
    #[serde(default = "default_backlog_alert_threshold")]
    pub backlog_alert_threshold: usize,

    /// How often gauges are refreshed and the backlog checked (in seconds)
    ///
    /// Default: 60 seconds
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,

    /// How long in-flight deliveries may run on after shutdown (in seconds)
    ///
    /// Default: 30 seconds
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Providers to deliver through, tried in ascending priority
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    /// Single relay used when `providers` is empty
    #[serde(default)]
    pub forward_host: Option<String>,
    #[serde(default)]
    pub forward_port: Option<u16>,
    #[serde(default)]
    pub forward_username: Option<String>,
    #[serde(default)]
    pub forward_password: Option<String>,
    #[serde(default)]
    pub forward_ssl: bool,

    /// Sign outbound mail when present
    #[serde(default)]
    pub dkim: Option<DkimConfig>,

    /// Identity whose domain signs mail when `dkim.domain` is unset
    #[serde(default)]
    pub default_sender: Option<String>,

    #[serde(default)]
    pub spool: SpoolConfig,

    /// Where dead letters are copied as `.eml` files
    #[serde(default)]
    pub archive: EmlArchive,

    #[serde(default)]
    pub limits: MessageLimits,

    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    /// Runtime state (initialized in `init()`)
    #[serde(skip)]
    service: Option<DeliveryService>,
}

impl Default for DeliveryProcessor {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            send_timeout_secs: default_send_timeout(),
            latency_refresh_secs: default_latency_refresh(),
            stats_window_secs: default_stats_window(),
            backlog_alert_threshold: default_backlog_alert_threshold(),
            monitor_interval_secs: default_monitor_interval(),
            shutdown_grace_secs: default_shutdown_grace(),
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            providers: Vec::new(),
            forward_host: None,
            forward_port: None,
            forward_username: None,
            forward_password: None,
            forward_ssl: false,
            dkim: None,
            default_sender: None,
            spool: SpoolConfig::default(),
            archive: EmlArchive::default(),
            limits: MessageLimits::default(),
            rate_limits: RateLimitConfig::default(),
            service: None,
        }
    }
}

impl DeliveryProcessor {
    /// The configured providers, falling back to the legacy forwarder.
    ///
    /// # Errors
    ///
    /// Fails when nothing is configured or two providers share a name.
    pub fn provider_configs(&self) -> Result<Vec<ProviderConfig>, DeliveryError> {
        let configs = if self.providers.is_empty() {
            LegacyForwarder {
                forward_host: self.forward_host.clone(),
                forward_port: self.forward_port,
                forward_username: self.forward_username.clone(),
                forward_password: self.forward_password.clone(),
                forward_ssl: self.forward_ssl,
            }
            .into_provider()
            .into_iter()
            .collect()
        } else {
            self.providers.clone()
        };

        if configs.is_empty() {
            return Err(SystemError::Configuration("no delivery providers configured".to_string()).into());
        }

        let mut seen = HashSet::new();
        for config in &configs {
            if !seen.insert(config.name.as_str()) {
                return Err(SystemError::Configuration(format!(
                    "duplicate provider name: {}",
                    config.name
                ))
                .into());
            }
        }

        Ok(configs)
    }

    fn signer(&self) -> Result<Option<DkimSigner>, DeliveryError> {
        let Some(config) = &self.dkim else {
            return Ok(None);
        };

        let fallback = self
            .default_sender
            .as_deref()
            .map(Address::parse)
            .transpose()
            .map_err(|e| SystemError::Configuration(format!("invalid default_sender: {e}")))?;

        DkimSigner::from_config(config, fallback.as_ref().map(Address::domain))
            .map(Some)
            .map_err(|e| SystemError::Configuration(format!("DKIM: {e}")).into())
    }

    /// Initialize the delivery processor
    ///
    /// Builds the providers, loads the DKIM key, opens the spool and restores
    /// whatever was queued when the process last stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if the processor cannot be initialized
    pub async fn init(&mut self, metrics: Metrics) -> Result<DeliveryService, DeliveryError> {
        internal!("Initialising Delivery Processor ...");

        let configs = self.provider_configs()?;
        let mut providers = Vec::with_capacity(configs.len());
        for config in &configs {
            providers.push((config.build()?, config.priority));
            internal!(
                level = INFO,
                "Provider {} (priority {}) configured",
                config.name,
                config.priority
            );
        }

        let signer = self.signer()?;

        let store = self.spool.open::<QueueEntry>("queue")?;
        let dead_store = self.spool.open::<DeadLetter>("dead")?;
        let queue = DeliveryQueue::new(self.queue_capacity, store, dead_store, self.archive.clone());

        queue
            .restore()
            .await
            .map_err(|e| SystemError::Internal(format!("failed to restore queue: {e}")))?;

        let dispatcher = Dispatcher::new(
            providers,
            Arc::new(CircuitBreaker::new(self.circuit_breaker.clone())),
            Arc::new(RollingStats::new(Duration::from_secs(self.stats_window_secs))),
            metrics.clone(),
            Duration::from_secs(self.send_timeout_secs),
            Duration::from_secs(self.latency_refresh_secs),
        );

        let service = DeliveryService::new(
            queue,
            dispatcher,
            signer,
            self.retry.clone(),
            self.limits,
            SenderRateLimiter::new(self.rate_limits.clone()),
            metrics,
        );

        service.metrics().queue.set_depth(service.queue().len());
        service
            .metrics()
            .queue
            .set_dead_letter_depth(service.queue().dead_len());

        internal!(
            level = INFO,
            "Delivery processor initialised with {} workers, capacity {}",
            self.workers,
            self.queue_capacity
        );

        self.service = Some(service.clone());
        Ok(service)
    }

    /// The runtime handle, once [`init`](Self::init) has run
    pub const fn service(&self) -> Option<&DeliveryService> {
        self.service.as_ref()
    }

    /// Run the delivery processor
    ///
    /// This method runs until a shutdown signal is received.
    ///
    /// ## Graceful Shutdown
    ///
    /// When a shutdown signal is received:
    /// 1. The queue is closed, so new submissions are refused
    /// 2. Workers finish their current delivery (up to `shutdown_grace_secs`)
    /// 3. Anything left is written to the spool for the next start
    ///
    /// # Errors
    ///
    /// Returns an error if the processor was not initialised, or the queue
    /// state could not be persisted on the way out.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), DeliveryError> {
        internal!("Delivery processor starting");

        let Some(service) = &self.service else {
            return Err(SystemError::NotInitialized(
                "Delivery processor not initialized. Call init() first.".to_string(),
            )
            .into());
        };

        let mut workers = JoinSet::new();
        for index in 0..self.workers.max(1) {
            workers.spawn(worker::run(index, service.clone()));
        }

        let monitor = tokio::spawn(monitor::run(
            service.clone(),
            Duration::from_secs(self.monitor_interval_secs),
            self.backlog_alert_threshold,
            shutdown.resubscribe(),
        ));

        service.set_running(true);
        internal!(level = INFO, "Delivery processor running {} workers", workers.len());

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!("Delivery processor received shutdown signal");
                        }
                        Err(e) => {
                            tracing::error!("Delivery processor shutdown channel error: {e}");
                        }
                    }
                    break;
                }
                Some(joined) = workers.join_next() => {
                    if let Err(e) = joined {
                        tracing::error!("Delivery worker exited unexpectedly: {e}");
                    }

                    // the queue only closes during shutdown, so respawn
                    if !service.queue().is_closed() {
                        let index = workers.len();
                        workers.spawn(worker::run(index, service.clone()));
                    }
                }
            }
        }

        service.set_running(false);
        service.queue().close();

        let grace = Duration::from_secs(self.shutdown_grace_secs);
        let drained = tokio::time::timeout(grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_ok() {
            internal!("All in-flight deliveries completed");
        } else {
            tracing::warn!(
                remaining = workers.len(),
                "Shutdown grace period exceeded, in-flight deliveries will be retried on restart"
            );
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }

        monitor.abort();

        let persisted = service
            .queue()
            .persist_all()
            .await
            .map_err(|e| SystemError::Internal(format!("failed to persist queue: {e}")))?;

        internal!(
            level = INFO,
            "Delivery processor shutdown complete, {persisted} records persisted"
        );

        Ok(())
    }
}
