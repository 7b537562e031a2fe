use std::{
    path::Path,
    sync::{Arc, LazyLock},
    time::Duration,
};

use anyhow::Context;
use courier_common::{
    Signal,
    audit::{self, AuditConfig},
    internal, logging,
};
use courier_control::ControlAuthConfig;
use courier_delivery::{DeliveryProcessor, DeliveryService};
use courier_health::{HealthChecker, HealthConfig, HealthServer, HealthServerBuilder};
use courier_metrics::{Metrics, MetricsConfig};
use courier_smtp::{SmtpListener, SmtpServerConfig};
use serde::Deserialize;
use tokio::{sync::broadcast, task::JoinHandle};

use crate::{
    readiness,
    smtp::SmtpSubmission,
    submission::{self, SubmissionConfig},
};

const READINESS_INTERVAL: Duration = Duration::from_secs(1);

/// The complete relay configuration, as read from `courier.config.ron`
#[derive(Debug, Default, Deserialize)]
pub struct Courier {
    #[serde(default)]
    pub delivery: DeliveryProcessor,

    /// HTTP listener for health, metrics, submission and admin routes
    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub submission: SubmissionConfig,

    /// SMTP submission listener for local applications
    #[serde(default)]
    pub smtp: SmtpServerConfig,

    #[serde(alias = "control", default)]
    pub admin: ControlAuthConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub audit: AuditConfig,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[tracing::instrument(level = "trace")]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

async fn join<E: std::fmt::Display>(name: &str, handle: JoinHandle<Result<(), E>>) {
    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("{name} failed: {e}"),
        Err(e) => tracing::error!("{name} task panicked: {e}"),
    }
}

impl Courier {
    /// Parse a RON configuration document.
    ///
    /// Newtype variants may be written unwrapped, e.g.
    /// `kind: Smtp(host: "...", port: 587)`.
    ///
    /// # Errors
    ///
    /// Returns the parse error with its position in the document.
    pub fn from_ron(content: &str) -> Result<Self, ron::error::SpannedError> {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::UNWRAP_VARIANT_NEWTYPES)
            .from_str(content)
    }

    /// Read and parse the configuration file at `path`
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or is not a valid configuration.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        Self::from_ron(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    /// Assemble the HTTP server, or `None` when it is disabled
    fn http_server(
        &self,
        service: &DeliveryService,
        checker: &Arc<HealthChecker>,
        metrics: &Metrics,
    ) -> Option<HealthServerBuilder> {
        if !self.health.enabled {
            return None;
        }

        let mut builder = HealthServer::builder(self.health.clone(), Arc::clone(checker));
        if self.metrics.enabled {
            builder = builder.metrics(metrics.clone());
        }
        if self.submission.enabled {
            builder = builder.merge(submission::router(service.clone(), &self.submission));
        }

        Some(builder.merge(courier_control::router(
            Arc::new(service.clone()),
            self.admin.clone(),
        )))
    }

    /// Run the relay until Ctrl-C or SIGTERM
    ///
    /// # Errors
    ///
    /// This function will return an error if the metrics registry, the spool,
    /// the providers or the HTTP listener fail to initialise.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn run(mut self) -> anyhow::Result<()> {
        logging::init();
        audit::init(self.audit.clone());

        let metrics = Metrics::new(&self.metrics)?;
        let service = self.delivery.init(metrics.clone()).await?;

        internal!("Controller running");

        let checker = Arc::new(HealthChecker::new());
        let http = if let Some(builder) = self.http_server(&service, &checker, &metrics) {
            let server = builder.bind().await?;
            Some(tokio::spawn(server.serve(SHUTDOWN_BROADCAST.subscribe())))
        } else {
            internal!(
                level = WARN,
                "HTTP server disabled: no submission, admin or health endpoints"
            );
            None
        };

        let smtp = if self.smtp.enabled {
            let listener = SmtpListener::bind(self.smtp.clone())
                .await
                .with_context(|| format!("Failed to bind SMTP listener on {}", self.smtp.listen_address))?;
            let handler = Arc::new(SmtpSubmission::new(service.clone()));
            Some(tokio::spawn(listener.serve(handler, SHUTDOWN_BROADCAST.subscribe())))
        } else {
            None
        };

        let sync = tokio::spawn(readiness::sync(
            service,
            checker,
            READINESS_INTERVAL,
            SHUTDOWN_BROADCAST.subscribe(),
        ));

        let ret = tokio::select! {
            r = self.delivery.serve(SHUTDOWN_BROADCAST.subscribe()) => {
                r.map_err(anyhow::Error::from)
            }
            r = shutdown() => {
                r
            }
        };

        internal!("Shutting down...");

        // stops the listeners and the readiness sync if delivery ended on its own
        let _ = SHUTDOWN_BROADCAST.send(Signal::Finalised);

        if let Some(http) = http {
            join("HTTP server", http).await;
        }
        if let Some(smtp) = smtp {
            join("SMTP listener", smtp).await;
        }
        if let Err(e) = sync.await {
            tracing::error!("Readiness sync task panicked: {e}");
        }

        ret
    }
}
