//! Upstream providers.
//!
//! A [`Provider`] hands one signed message to one upstream service. Which
//! transport it speaks is chosen in configuration through [`ProviderKind`];
//! the dispatcher only ever sees the trait.

mod http;
mod smtp;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use courier_common::{Address, Message};
use serde::Deserialize;

pub use self::{
    http::{HttpProvider, HttpProviderConfig},
    smtp::{SmtpProvider, SmtpProviderConfig, SmtpTimeouts},
};
use crate::error::{DeliveryError, SystemError};

/// A message ready to leave the relay
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub message: Arc<Message>,
    /// RFC 5322 bytes, with the DKIM signature when signing is enabled
    pub raw: Arc<str>,
    /// Envelope recipients for this send. Starts as every recipient of the
    /// message and shrinks as providers accept some of them.
    pub recipients: Vec<Address>,
}

impl OutboundMessage {
    #[must_use]
    pub fn new(message: Arc<Message>, raw: impl Into<Arc<str>>) -> Self {
        let recipients = message.recipients().cloned().collect();
        Self {
            message,
            raw: raw.into(),
            recipients,
        }
    }

    /// The same content, addressed to `recipients` only
    #[must_use]
    pub fn with_recipients(mut self, recipients: Vec<Address>) -> Self {
        self.recipients = recipients;
        self
    }

    /// Whether `recipient` is still to be sent to
    #[must_use]
    pub fn is_addressed_to(&self, recipient: &Address) -> bool {
        self.recipients.contains(recipient)
    }

    /// Send the message exactly as rendered, without a signature
    #[must_use]
    pub fn unsigned(message: Arc<Message>) -> Self {
        let raw = message.render();
        Self::new(message, raw)
    }
}

/// One upstream mail provider.
///
/// Implementations classify every failure as permanent or temporary so the
/// dispatcher can decide between failover, retry and the circuit breaker. They
/// need not enforce an overall deadline: the dispatcher wraps each call in one.
///
/// Only [`OutboundMessage::recipients`] are sent to. A provider that got some
/// of them accepted before failing reports it with
/// [`DeliveryError::partial`], so nobody receives the message twice.
#[async_trait]
pub trait Provider: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError>;
}

const fn default_priority() -> u32 {
    1
}

/// A configured provider
///
/// # Examples
///
/// ```ron
/// (
///     name: "primary",
///     priority: 1,
///     kind: Smtp(host: "smtp.example.com", port: 587, username: Some("relay"), password: Some("secret")),
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: String,

    /// Lower is tried first. Providers sharing a priority are ordered by
    /// recently observed latency.
    #[serde(default = "default_priority")]
    pub priority: u32,

    pub kind: ProviderKind,
}

#[derive(Debug, Clone, Deserialize)]
pub enum ProviderKind {
    Smtp(SmtpProviderConfig),
    Http(HttpProviderConfig),
}

impl ProviderConfig {
    /// Instantiate the provider described by this configuration.
    pub fn build(&self) -> Result<Arc<dyn Provider>, DeliveryError> {
        if self.name.trim().is_empty() {
            return Err(
                SystemError::Configuration("provider name must not be empty".to_string()).into(),
            );
        }

        Ok(match &self.kind {
            ProviderKind::Smtp(config) => {
                Arc::new(SmtpProvider::new(self.name.clone(), config.clone())?)
            }
            ProviderKind::Http(config) => {
                Arc::new(HttpProvider::new(self.name.clone(), config.clone())?)
            }
        })
    }
}

/// The single-forwarder settings of older configuration files
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LegacyForwarder {
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
}

impl LegacyForwarder {
    /// A priority 1 SMTP provider named `forward`, if a host is configured.
    #[must_use]
    pub fn into_provider(self) -> Option<ProviderConfig> {
        let host = self.forward_host.filter(|host| !host.trim().is_empty())?;
        let port = self
            .forward_port
            .unwrap_or(if self.forward_ssl { 465 } else { 587 });

        Some(ProviderConfig {
            name: "forward".to_string(),
            priority: 1,
            kind: ProviderKind::Smtp(SmtpProviderConfig {
                username: self.forward_username,
                password: self.forward_password,
                implicit_tls: self.forward_ssl,
                ..SmtpProviderConfig::new(host, port)
            }),
        })
    }
}

/// Mask a secret for logging, keeping the first and last two characters.
#[must_use]
pub fn mask_password(password: &str) -> String {
    let chars: Vec<char> = password.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }

    let mut masked = String::with_capacity(chars.len());
    masked.extend(&chars[..2]);
    masked.extend(std::iter::repeat_n('*', chars.len() - 4));
    masked.extend(&chars[chars.len() - 2..]);
    masked
}
