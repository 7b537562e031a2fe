//! A single delivery worker: dequeue, sign, dispatch, record the outcome.

use chrono::{DateTime, Utc};
use courier_common::{audit, internal};

use crate::{
    provider::OutboundMessage,
    queue::QueueEntry,
    service::DeliveryService,
};

/// What happened to an entry after one pass through a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    Delivered { provider: String },
    Rescheduled { next_attempt_at: DateTime<Utc> },
    DeadLettered { reason: String },
}

/// Serve the queue until it is closed.
pub async fn run(index: usize, service: DeliveryService) {
    service.worker_started();
    internal!(level = DEBUG, "Delivery worker {index} started");

    while let Some(entry) = service.queue().dequeue().await {
        process_entry(&service, entry).await;
    }

    service.worker_stopped();
    internal!(level = DEBUG, "Delivery worker {index} stopped");
}

fn prepare(service: &DeliveryService, entry: &QueueEntry) -> Result<OutboundMessage, String> {
    let outbound = match service.signer() {
        None => OutboundMessage::unsigned(entry.message.clone()),
        Some(signer) => signer
            .sign(&entry.message)
            .map(|signed| OutboundMessage::new(entry.message.clone(), signed.raw))
            .map_err(|e| format!("DKIM signing failed: {e}"))?,
    };

    Ok(outbound.with_recipients(entry.outstanding_recipients()))
}

async fn complete(service: &DeliveryService, entry: &QueueEntry, provider: String) -> EntryOutcome {
    let id = entry.id();
    if let Err(e) = service.queue().complete(&id).await {
        tracing::warn!(message_id = %id, error = %e, "Failed to remove delivered message from the queue store");
    }
    service.metrics().delivery.record_delivered();
    service.metrics().queue.set_depth(service.queue().len());
    EntryOutcome::Delivered { provider }
}

/// Run one delivery cycle for a claimed entry and record its result.
#[tracing::instrument(level = "debug", skip_all, fields(message_id = %entry.id(), cycle = entry.cycles + 1))]
pub async fn process_entry(service: &DeliveryService, mut entry: QueueEntry) -> EntryOutcome {
    let id = entry.id();

    let outbound = match prepare(service, &entry) {
        Ok(outbound) => outbound,
        Err(reason) => {
            // a broken key will not fix itself on retry
            service.metrics().delivery.record_dkim_failure();
            tracing::error!(message_id = %id, %reason, "Signing failed, dead-lettering");
            return dead_letter(service, entry, reason).await;
        }
    };

    if outbound.recipients.is_empty() {
        // every recipient was accepted across earlier partial sends
        let provider = entry
            .attempts
            .last()
            .map(|attempt| attempt.provider.clone())
            .unwrap_or_default();
        return complete(service, &entry, provider).await;
    }

    entry.cycles += 1;
    let outcome = service
        .dispatcher()
        .dispatch_except(&outbound, entry.cycles, &entry.refused_by)
        .await;
    let summary = outcome.failure_summary();
    for provider in outcome.refusals() {
        if !entry.refused_by.iter().any(|refused| refused == provider) {
            entry.refused_by.push(provider.to_string());
        }
    }
    entry.delivered_to.extend(outcome.delivered_to);
    entry.attempts.extend(outcome.attempts);

    if let Some(provider) = outcome.delivered_by {
        return complete(service, &entry, provider).await;
    }

    let last_error = if summary.is_empty() {
        "no provider available".to_string()
    } else {
        summary
    };

    let policy = service.retry_policy();
    if !policy.should_retry(entry.cycles) {
        let reason = format!(
            "retry budget exhausted after {} cycles: {last_error}",
            entry.cycles
        );
        return dead_letter(service, entry, reason).await;
    }

    let next_attempt_at = policy.calculate_next_retry(entry.cycles);
    internal!(
        level = INFO,
        "Delivery of {id} failed in cycle {} ({} remaining), next attempt at {next_attempt_at}",
        entry.cycles,
        policy.remaining_attempts(entry.cycles)
    );

    if let Err(e) = service
        .queue()
        .reschedule(entry, next_attempt_at, last_error)
        .await
    {
        tracing::warn!(message_id = %id, error = %e, "Failed to persist rescheduled entry");
    }

    EntryOutcome::Rescheduled { next_attempt_at }
}

async fn dead_letter(service: &DeliveryService, entry: QueueEntry, reason: String) -> EntryOutcome {
    let id = entry.id();
    let attempts = entry.attempts.len();
    let fallback = entry.clone();

    match service.queue().dead_letter(entry, reason.clone()).await {
        Ok(_) => {
            audit::log_dead_lettered(&id.to_string(), &reason, attempts);
            service.metrics().delivery.record_dead_lettered();
        }
        Err(e) => {
            // keep the message rather than leave it stuck in flight
            tracing::error!(message_id = %id, error = %e, "Failed to dead-letter message, rescheduling");
            let next_attempt_at = service.retry_policy().calculate_next_retry(fallback.cycles);
            if let Err(e) = service
                .queue()
                .reschedule(fallback, next_attempt_at, reason.clone())
                .await
            {
                tracing::error!(message_id = %id, error = %e, "Failed to reschedule message");
            }
        }
    }

    service
        .metrics()
        .queue
        .set_dead_letter_depth(service.queue().dead_len());
    service.metrics().queue.set_depth(service.queue().len());

    EntryOutcome::DeadLettered { reason }
}
