#![allow(dead_code)]

use courier_common::NewMessage;
use courier_delivery::{
    DeliveryProcessor, ProviderConfig,
    provider::{ProviderKind, SmtpProviderConfig},
};
use courier_metrics::{Metrics, MetricsConfig};
use courier_spool::SpoolConfig;

/// An in-memory relay whose only provider points at an unused port
pub fn processor() -> DeliveryProcessor {
    let mut processor = DeliveryProcessor::default();
    processor.workers = 1;
    processor.shutdown_grace_secs = 1;
    processor.spool = SpoolConfig::Memory { capacity: None };
    processor.providers = vec![ProviderConfig {
        name: "primary".to_string(),
        priority: 1,
        kind: ProviderKind::Smtp(SmtpProviderConfig::new("127.0.0.1", 9)),
    }];
    processor
}

pub fn metrics() -> Metrics {
    Metrics::new(&MetricsConfig::default()).expect("metrics")
}

pub fn draft(from: &str) -> NewMessage {
    NewMessage {
        from: from.to_string(),
        to: vec!["customer@example.org".to_string()],
        subject: "Password reset".to_string(),
        text: Some("Follow the link to reset your password.".to_string()),
        ..NewMessage::default()
    }
}
