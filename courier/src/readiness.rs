//! Keeps the health checker in step with the delivery service

use std::{sync::Arc, time::Duration};

use courier_common::Signal;
use courier_delivery::DeliveryService;
use courier_health::HealthChecker;
use tokio::{sync::broadcast, time::MissedTickBehavior};

/// Copy the current delivery state into `checker`
pub fn update(service: &DeliveryService, checker: &HealthChecker) {
    let queue = service.queue();
    checker.set_delivery_ready(service.is_running());
    checker.set_providers_available(service.dispatcher().any_available());
    checker.set_queue(
        u64::try_from(queue.len()).unwrap_or(u64::MAX),
        u64::try_from(queue.capacity()).unwrap_or(u64::MAX),
    );
}

/// Refresh `checker` every `interval` until shutdown, then report not-ready.
pub async fn sync(
    service: DeliveryService,
    checker: Arc<HealthChecker>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<Signal>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => update(&service, &checker),
            _ = shutdown.recv() => break,
        }
    }

    checker.set_delivery_ready(false);
    tracing::debug!("Readiness sync stopped");
}
