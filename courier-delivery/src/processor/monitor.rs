//! Periodic housekeeping alongside the workers.

use std::time::Duration;

use courier_common::{Signal, internal};
use tokio::sync::broadcast;

use crate::service::DeliveryService;

/// Whether the dead-letter backlog warrants an operator's attention
pub const fn backlog_exceeded(dead_letters: usize, threshold: usize) -> bool {
    dead_letters > threshold
}

fn tick(service: &DeliveryService, backlog_alert_threshold: usize) {
    let queue = service.queue();
    let dead = queue.dead_len();

    let metrics = service.metrics();
    metrics.queue.set_depth(queue.len());
    metrics.queue.set_dead_letter_depth(dead);
    service.dispatcher().refresh_circuit_gauges();
    service.rate_limiter().cleanup_idle();

    if backlog_exceeded(dead, backlog_alert_threshold) {
        tracing::warn!(
            dead_letters = dead,
            threshold = backlog_alert_threshold,
            "Dead-letter backlog exceeds alert threshold"
        );
    }
}

pub async fn run(
    service: DeliveryService,
    interval: Duration,
    backlog_alert_threshold: usize,
    mut shutdown: broadcast::Receiver<Signal>,
) {
    let mut timer = tokio::time::interval(interval.max(Duration::from_secs(1)));

    loop {
        tokio::select! {
            _ = timer.tick() => tick(&service, backlog_alert_threshold),
            _ = shutdown.recv() => {
                internal!("Delivery monitor stopping");
                break;
            }
        }
    }
}
