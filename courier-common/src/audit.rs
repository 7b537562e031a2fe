//! Audit logging for message lifecycle and operator events
//!
//! Every event is emitted through `tracing` under the `courier::audit` target so
//! the JSON log layer can route it separately from operational logs.
//!
//! ## Audit Events
//!
//! - `MessageAccepted`: Submission validated and queued
//! - `DeliveryAttempt`: One cycle through the provider list started
//! - `DeliverySuccess`: A provider accepted the message
//! - `DeliveryFailure`: A provider rejected the message
//! - `DeadLettered`: Message moved to the dead-letter set
//! - `AdminAction`: An operator changed runtime state
//!
//! ## PII Redaction
//!
//! Sender and recipient addresses can be redacted through [`AuditConfig`].

use std::sync::{Arc, OnceLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};

const TARGET: &str = "courier::audit";

/// Audit logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Enable audit logging
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Redact sender email addresses
    #[serde(default)]
    pub redact_sender: bool,

    /// Redact recipient email addresses
    #[serde(default)]
    pub redact_recipients: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redact_sender: false,
            redact_recipients: false,
        }
    }
}

const fn default_true() -> bool {
    true
}

static AUDIT_CONFIG: OnceLock<Arc<AuditConfig>> = OnceLock::new();

/// Initialize audit logging with configuration
///
/// Only the first call takes effect.
pub fn init(config: AuditConfig) {
    AUDIT_CONFIG.get_or_init(|| Arc::new(config));
}

#[must_use]
pub fn config() -> Arc<AuditConfig> {
    AUDIT_CONFIG
        .get()
        .cloned()
        .unwrap_or_else(|| Arc::new(AuditConfig::default()))
}

/// Redact the local part of an address, keeping the domain
#[must_use]
pub fn redact_email(email: &str, redact: bool) -> String {
    if !redact {
        return email.to_string();
    }

    email
        .rsplit_once('@')
        .map_or_else(|| "[REDACTED]".to_string(), |(_, domain)| format!("[REDACTED]@{domain}"))
}

#[must_use]
pub fn redact_emails<T: AsRef<str>>(emails: &[T], redact: bool) -> Vec<String> {
    emails
        .iter()
        .map(|e| redact_email(e.as_ref(), redact))
        .collect()
}

/// A submission was validated and queued.
pub fn log_message_accepted(message_id: &str, sender: &str, recipients: &[String], size: usize) {
    let config = config();
    if !config.enabled {
        return;
    }

    let sender = redact_email(sender, config.redact_sender);
    let recipients_redacted = redact_emails(recipients, config.redact_recipients);

    tracing::info!(
        target: TARGET,
        event = "MessageAccepted",
        message_id = %message_id,
        sender = %sender,
        recipients = ?recipients_redacted,
        recipient_count = recipients.len(),
        size,
        "Audit: Message accepted and queued"
    );
}

/// A dispatch cycle started. `cycle` is 1-based.
pub fn log_delivery_attempt(message_id: &str, cycle: u32, providers: &[String]) {
    if !config().enabled {
        return;
    }

    tracing::info!(
        target: TARGET,
        event = "DeliveryAttempt",
        message_id = %message_id,
        delivery_attempt = cycle,
        providers = ?providers,
        "Audit: Delivery attempt"
    );
}

pub fn log_delivery_success(message_id: &str, provider: &str, cycle: u32, duration_ms: u64) {
    if !config().enabled {
        return;
    }

    tracing::info!(
        target: TARGET,
        event = "DeliverySuccess",
        message_id = %message_id,
        provider = %provider,
        delivery_attempt = cycle,
        duration_ms,
        "Audit: Delivery successful"
    );
}

/// A provider rejected the message. `outcome` is `transient` or `permanent`.
pub fn log_delivery_failure(message_id: &str, provider: &str, error: &str, outcome: &str) {
    if !config().enabled {
        return;
    }

    tracing::warn!(
        target: TARGET,
        event = "DeliveryFailure",
        message_id = %message_id,
        provider = %provider,
        error = %error,
        outcome = %outcome,
        "Audit: Delivery failed"
    );
}

pub fn log_dead_lettered(message_id: &str, reason: &str, attempts: usize) {
    if !config().enabled {
        return;
    }

    tracing::warn!(
        target: TARGET,
        event = "DeadLettered",
        message_id = %message_id,
        reason = %reason,
        attempts,
        "Audit: Message dead-lettered"
    );
}

/// An operator changed runtime state.
///
/// Admin actions are always recorded, regardless of [`AuditConfig::enabled`].
pub fn log_admin_action(actor: &str, action: &str, target: &str, outcome: Result<(), &str>) {
    let timestamp = Utc::now().to_rfc3339();

    match outcome {
        Ok(()) => tracing::info!(
            target: TARGET,
            event = "AdminAction",
            actor = %actor,
            action = %action,
            subject = %target,
            timestamp = %timestamp,
            outcome = "ok",
            "Audit: Admin action"
        ),
        Err(error) => tracing::warn!(
            target: TARGET,
            event = "AdminAction",
            actor = %actor,
            action = %action,
            subject = %target,
            timestamp = %timestamp,
            outcome = "error",
            error = %error,
            "Audit: Admin action failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_email() {
        assert_eq!(
            redact_email("user@example.com", true),
            "[REDACTED]@example.com"
        );
        assert_eq!(redact_email("user@example.com", false), "user@example.com");
        assert_eq!(redact_email("invalid", true), "[REDACTED]");
    }

    #[test]
    fn test_redact_emails() {
        let emails = ["a@example.com", "b@example.org"];
        assert_eq!(
            redact_emails(&emails, true),
            vec!["[REDACTED]@example.com", "[REDACTED]@example.org"]
        );
        assert_eq!(redact_emails(&emails, false), vec!["a@example.com", "b@example.org"]);
    }

    #[test]
    fn test_events_do_not_panic() {
        log_message_accepted("id", "s@example.com", &["r@example.com".to_string()], 10);
        log_delivery_attempt("id", 1, &["primary".to_string()]);
        log_delivery_success("id", "primary", 1, 20);
        log_delivery_failure("id", "primary", "421", "transient");
        log_dead_lettered("id", "exhausted", 5);
        log_admin_action("ops", "force_open", "primary", Ok(()));
        log_admin_action("ops", "requeue", "missing", Err("not found"));
    }
}
