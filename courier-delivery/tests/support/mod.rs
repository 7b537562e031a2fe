#![allow(dead_code)]

pub mod mock_server;

use std::{sync::Arc, time::Duration};

use courier_common::{MessageLimits, NewMessage};
use courier_delivery::{
    CircuitBreaker, CircuitBreakerConfig, DeliveryQueue, DeliveryService, Dispatcher,
    ProviderConfig, RateLimitConfig, RetryPolicy, RollingStats, SenderRateLimiter,
    provider::{ProviderKind, SmtpProviderConfig},
};
use courier_metrics::{Metrics, MetricsConfig};

pub fn draft(from: &str, to: &[&str]) -> NewMessage {
    NewMessage {
        from: from.to_string(),
        to: to.iter().map(ToString::to_string).collect(),
        subject: "Order confirmation".to_string(),
        text: Some("Your order has shipped.".to_string()),
        ..NewMessage::default()
    }
}

/// An SMTP provider pointed at a local mock server
pub fn smtp_provider(name: &str, priority: u32, port: u16) -> ProviderConfig {
    let mut config = SmtpProviderConfig::new("127.0.0.1", port);
    config.batch_delay_ms = 0;
    config.timeouts.connect_secs = 2;
    config.timeouts.ehlo_secs = 2;

    ProviderConfig {
        name: name.to_string(),
        priority,
        kind: ProviderKind::Smtp(config),
    }
}

/// Retry immediately, so tests can drive cycles back to back
pub fn immediate_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_retry_delay_secs: 0,
        max_retry_delay_secs: 0,
        retry_jitter_factor: 0.0,
    }
}

pub fn service(
    providers: &[ProviderConfig],
    retry: RetryPolicy,
    circuit_breaker: CircuitBreakerConfig,
    queue: DeliveryQueue,
) -> DeliveryService {
    let metrics = Metrics::new(&MetricsConfig::default()).expect("metrics");
    let providers = providers
        .iter()
        .map(|config| (config.build().expect("valid provider"), config.priority))
        .collect();

    let dispatcher = Dispatcher::new(
        providers,
        Arc::new(CircuitBreaker::new(circuit_breaker)),
        Arc::new(RollingStats::new(Duration::from_secs(300))),
        metrics.clone(),
        Duration::from_secs(10),
        Duration::ZERO,
    );

    DeliveryService::new(
        queue,
        dispatcher,
        None,
        retry,
        MessageLimits::default(),
        SenderRateLimiter::new(RateLimitConfig::default()),
        metrics,
    )
}
