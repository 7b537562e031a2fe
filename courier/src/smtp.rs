//! Messages handed over by the SMTP listener go through the same admission
//! path as the HTTP API.

use courier_common::{Address, incoming};
use courier_delivery::{DeliveryService, SubmitError};
use courier_smtp::{ReceivedMessage, Rejection, SubmissionHandler};

#[derive(Debug, Clone)]
pub struct SmtpSubmission {
    service: DeliveryService,
}

impl SmtpSubmission {
    pub const fn new(service: DeliveryService) -> Self {
        Self { service }
    }
}

/// Reply for a refused submission. Only malformed content is final.
fn rejection(err: &SubmitError) -> Rejection {
    match err {
        SubmitError::Malformed(e) => Rejection::permanent(format!("5.6.0 {e}")),
        SubmitError::RateLimited(_) => Rejection::new(450, format!("4.7.1 {err}")),
        SubmitError::Queue(e) => Rejection::temporary(format!("4.3.0 {e}")),
    }
}

#[async_trait::async_trait]
impl SubmissionHandler for SmtpSubmission {
    fn validate_sender(&self, from: &str) -> Result<(), Rejection> {
        Address::parse(from)
            .map(|_| ())
            .map_err(|e| Rejection::new(553, format!("5.1.7 Invalid sender address: {e}")))
    }

    fn validate_recipient(&self, recipient: &str) -> Result<(), Rejection> {
        Address::parse(recipient)
            .map(|_| ())
            .map_err(|e| Rejection::new(553, format!("5.1.3 Invalid recipient address: {e}")))
    }

    async fn handle_message(&self, message: ReceivedMessage) -> Result<String, Rejection> {
        let entry = self
            .service
            .submit_raw(&message.from, &message.recipients, &message.content)
            .await
            .map_err(|e| {
                incoming!(level = WARN, "Rejected SMTP submission from {}: {e}", message.peer);
                rejection(&e)
            })?;

        incoming!(
            level = INFO,
            "Accepted {} over SMTP from {}{}",
            entry.id(),
            message.peer,
            message
                .authenticated
                .as_deref()
                .map_or_else(String::new, |user| format!(" as {user}"))
        );

        Ok(entry.id().to_string())
    }
}
