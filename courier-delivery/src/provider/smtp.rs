//! Delivery through an upstream SMTP relay.
//!
//! Recipients are split into batches of [`SmtpProviderConfig::batch_size`] and
//! each batch is sent in its own transaction. When a later batch fails, the
//! recipients of the earlier ones are reported as delivered so they are not
//! sent to again.
//!
//! 1. Connect (optionally with TLS from the first byte) and read the greeting
//! 2. EHLO, then STARTTLS and EHLO again when the server offers it
//! 3. AUTH PLAIN when credentials are configured
//! 4. MAIL FROM, RCPT TO for each recipient in the batch, DATA
//! 5. QUIT, whose outcome is ignored since the message was already accepted

use std::{fmt, future::Future, time::Duration};

use courier_smtp::{ClientError, Response, SmtpClient};
use serde::Deserialize;

use super::{OutboundMessage, Provider, mask_password};
use crate::error::{DeliveryError, PermanentError, SystemError, TemporaryError};

/// SMTP operation timeout configuration
///
/// Every command gets its own deadline so a stalled server is detected at the
/// step where it stalls rather than at the overall send deadline.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpTimeouts {
    /// Connection establishment, including implicit TLS
    ///
    /// Default: 30 seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_secs: u64,

    /// Greeting, EHLO and AUTH
    ///
    /// Default: 30 seconds
    #[serde(default = "default_ehlo_timeout")]
    pub ehlo_secs: u64,

    /// STARTTLS command and the TLS upgrade
    ///
    /// Default: 30 seconds
    #[serde(default = "default_starttls_timeout")]
    pub starttls_secs: u64,

    /// Default: 30 seconds
    #[serde(default = "default_mail_from_timeout")]
    pub mail_from_secs: u64,

    /// Per recipient
    ///
    /// Default: 30 seconds
    #[serde(default = "default_rcpt_to_timeout")]
    pub rcpt_to_secs: u64,

    /// DATA command and message transmission
    ///
    /// Default: 120 seconds
    #[serde(default = "default_data_timeout")]
    pub data_secs: u64,

    /// Default: 10 seconds
    #[serde(default = "default_quit_timeout")]
    pub quit_secs: u64,
}

impl Default for SmtpTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_timeout(),
            ehlo_secs: default_ehlo_timeout(),
            starttls_secs: default_starttls_timeout(),
            mail_from_secs: default_mail_from_timeout(),
            rcpt_to_secs: default_rcpt_to_timeout(),
            data_secs: default_data_timeout(),
            quit_secs: default_quit_timeout(),
        }
    }
}

const fn default_connect_timeout() -> u64 {
    30
}

const fn default_ehlo_timeout() -> u64 {
    30
}

const fn default_starttls_timeout() -> u64 {
    30
}

const fn default_mail_from_timeout() -> u64 {
    30
}

const fn default_rcpt_to_timeout() -> u64 {
    30
}

const fn default_data_timeout() -> u64 {
    120
}

const fn default_quit_timeout() -> u64 {
    10
}

const fn default_batch_size() -> usize {
    20
}

const fn default_batch_delay_ms() -> u64 {
    1000
}

#[derive(Clone, Deserialize)]
pub struct SmtpProviderConfig {
    pub host: String,
    pub port: u16,

    /// AUTH PLAIN is only attempted when both are set
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,

    /// Negotiate TLS before the greeting (SMTPS, usually port 465)
    #[serde(default)]
    pub implicit_tls: bool,

    /// Fail permanently rather than send in plaintext
    #[serde(default)]
    pub require_tls: bool,

    /// Accept any certificate. Only meant for testing.
    #[serde(default)]
    pub accept_invalid_certs: bool,

    /// Name announced in EHLO. Defaults to the sender's domain.
    #[serde(default)]
    pub helo_domain: Option<String>,

    /// Recipients per transaction
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Pause between batches of the same message
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,

    #[serde(default)]
    pub timeouts: SmtpTimeouts,
}

impl SmtpProviderConfig {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            implicit_tls: false,
            require_tls: false,
            accept_invalid_certs: false,
            helo_domain: None,
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            timeouts: SmtpTimeouts::default(),
        }
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        self.username
            .as_deref()
            .zip(self.password.as_deref())
            .filter(|(username, password)| !username.is_empty() && !password.is_empty())
    }
}

impl fmt::Debug for SmtpProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpProviderConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_deref().map(mask_password))
            .field("implicit_tls", &self.implicit_tls)
            .field("require_tls", &self.require_tls)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("helo_domain", &self.helo_domain)
            .field("batch_size", &self.batch_size)
            .field("batch_delay_ms", &self.batch_delay_ms)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

#[derive(Debug)]
pub struct SmtpProvider {
    name: String,
    address: String,
    config: SmtpProviderConfig,
}

/// Outcome of TLS negotiation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TlsNegotiation {
    Upgraded,
    Skipped,
    /// The handshake failed part way; the session cannot be reused
    Reconnect,
}

impl SmtpProvider {
    pub fn new(name: String, config: SmtpProviderConfig) -> Result<Self, DeliveryError> {
        if config.host.trim().is_empty() || config.port == 0 {
            return Err(SystemError::Configuration(format!(
                "provider {name}: host and port are required"
            ))
            .into());
        }

        if config.batch_size == 0 {
            return Err(SystemError::Configuration(format!(
                "provider {name}: batch_size must be at least 1"
            ))
            .into());
        }

        if config.accept_invalid_certs {
            tracing::warn!(
                provider = %name,
                "SECURITY WARNING: TLS certificate validation is disabled for this provider"
            );
        }

        Ok(Self {
            address: format!("{}:{}", config.host, config.port),
            name,
            config,
        })
    }

    /// Run `command` under `secs`, turning an elapsed deadline into a
    /// temporary failure.
    async fn timed<T>(
        secs: u64,
        what: &str,
        command: impl Future<Output = Result<T, ClientError>>,
    ) -> Result<T, DeliveryError> {
        let timeout = Duration::from_secs(secs);
        match tokio::time::timeout(timeout, command).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TemporaryError::Timeout(format!("{what} timed out after {timeout:?}")).into()),
        }
    }

    async fn connect_and_greet(&self) -> Result<SmtpClient, DeliveryError> {
        let connect = async {
            if self.config.implicit_tls {
                SmtpClient::connect_tls(
                    &self.address,
                    self.config.host.clone(),
                    self.config.accept_invalid_certs,
                )
                .await
            } else {
                SmtpClient::connect(&self.address, self.config.host.clone())
                    .await
                    .map(|client| client.accept_invalid_certs(self.config.accept_invalid_certs))
            }
        };

        let mut client = Self::timed(self.config.timeouts.connect_secs, "Connect", connect)
            .await
            .map_err(|e| match e {
                DeliveryError::Temporary(TemporaryError::ConnectionFailed(msg)) => {
                    TemporaryError::ConnectionFailed(format!(
                        "Failed to connect to {}: {msg}",
                        self.address
                    ))
                    .into()
                }
                other => other,
            })?;

        let greeting =
            Self::timed(self.config.timeouts.ehlo_secs, "Greeting", client.read_greeting()).await?;

        if !greeting.is_success() {
            return Err(TemporaryError::ServerBusy(format!(
                "Server rejected connection: {}",
                greeting.message()
            ))
            .into());
        }

        Ok(client)
    }

    async fn ehlo(&self, client: &mut SmtpClient, helo: &str) -> Result<Response, DeliveryError> {
        let response = Self::timed(self.config.timeouts.ehlo_secs, "EHLO", client.ehlo(helo)).await?;

        if response.is_success() {
            return Ok(response);
        }

        // servers without ESMTP still speak HELO
        let response = Self::timed(self.config.timeouts.ehlo_secs, "HELO", client.helo(helo)).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(rejected(&response, "HELO"))
        }
    }

    async fn negotiate_tls(
        &self,
        client: &mut SmtpClient,
        capabilities: &Response,
    ) -> Result<TlsNegotiation, DeliveryError> {
        if self.config.implicit_tls {
            return Ok(TlsNegotiation::Skipped);
        }

        if !capabilities.has_extension("STARTTLS") {
            if self.config.require_tls {
                return Err(PermanentError::TlsRequired(format!(
                    "{} does not offer STARTTLS",
                    self.address
                ))
                .into());
            }
            return Ok(TlsNegotiation::Skipped);
        }

        match Self::timed(self.config.timeouts.starttls_secs, "STARTTLS", client.starttls()).await {
            Ok(response) if response.is_success() => Ok(TlsNegotiation::Upgraded),
            Ok(response) => {
                let message = format!("Server rejected STARTTLS: {}", response.message());
                if self.config.require_tls {
                    return Err(PermanentError::TlsRequired(message).into());
                }
                tracing::info!(provider = %self.name, %message, "Continuing without TLS");
                Ok(TlsNegotiation::Skipped)
            }
            Err(e) => {
                if self.config.require_tls {
                    return Err(PermanentError::TlsRequired(e.to_string()).into());
                }
                tracing::info!(
                    provider = %self.name,
                    error = %e,
                    "STARTTLS failed for opportunistic TLS, will retry without TLS per RFC 3207"
                );
                Ok(TlsNegotiation::Reconnect)
            }
        }
    }

    /// Connect, secure and authenticate a session ready for MAIL FROM.
    ///
    /// Returns whether the server advertised SIZE.
    async fn open_session(&self, helo: &str) -> Result<(SmtpClient, bool), DeliveryError> {
        let mut client = self.connect_and_greet().await?;
        let mut capabilities = self.ehlo(&mut client, helo).await?;

        match self.negotiate_tls(&mut client, &capabilities).await? {
            TlsNegotiation::Upgraded => {
                capabilities = self.ehlo(&mut client, helo).await?;
            }
            TlsNegotiation::Reconnect => {
                drop(client);
                client = self.connect_and_greet().await?;
                capabilities = self.ehlo(&mut client, helo).await?;
            }
            TlsNegotiation::Skipped => {}
        }

        if let Some((username, password)) = self.config.credentials() {
            tracing::debug!(
                provider = %self.name,
                username,
                password = %mask_password(password),
                "Authenticating"
            );
            Self::timed(
                self.config.timeouts.ehlo_secs,
                "AUTH",
                client.auth_plain(username, password),
            )
            .await?;
        }

        Ok((client, capabilities.has_extension("SIZE")))
    }

    /// Returns the recipients the server accepted.
    async fn send_batch(
        &self,
        message: &OutboundMessage,
        recipients: &[String],
    ) -> Result<Vec<String>, DeliveryError> {
        let sender = message.message.from().to_string();
        let helo = self
            .config
            .helo_domain
            .as_deref()
            .unwrap_or_else(|| message.message.from().domain());

        let (mut client, supports_size) = self.open_session(helo).await?;

        let size = supports_size.then_some(message.raw.len());
        let response = Self::timed(
            self.config.timeouts.mail_from_secs,
            "MAIL FROM",
            client.mail_from(&sender, size),
        )
        .await?;
        if !response.is_success() {
            return Err(rejected(&response, "MAIL FROM"));
        }

        let accepted = self.send_recipients(&mut client, recipients).await?;

        let response =
            Self::timed(self.config.timeouts.data_secs, "DATA", client.data()).await?;
        if !response.is_intermediate() {
            return Err(rejected(&response, "DATA"));
        }

        let response = Self::timed(
            self.config.timeouts.data_secs,
            "Message transmission",
            client.send_data(&message.raw),
        )
        .await?;
        if !response.is_success() {
            return Err(rejected(&response, "message"));
        }

        if let Err(e) =
            Self::timed(self.config.timeouts.quit_secs, "QUIT", client.quit()).await
        {
            tracing::debug!(provider = %self.name, error = %e, "QUIT failed after successful delivery");
        }

        Ok(accepted)
    }

    /// RCPT TO for every recipient. The batch only fails if all of them are
    /// refused.
    async fn send_recipients(
        &self,
        client: &mut SmtpClient,
        recipients: &[String],
    ) -> Result<Vec<String>, DeliveryError> {
        let mut accepted = Vec::with_capacity(recipients.len());
        let mut refusals = Vec::new();
        let mut all_permanent = true;

        for recipient in recipients {
            let response = Self::timed(
                self.config.timeouts.rcpt_to_secs,
                "RCPT TO",
                client.rcpt_to(recipient),
            )
            .await?;

            if response.is_success() {
                accepted.push(recipient.clone());
            } else {
                all_permanent &= response.is_permanent_error();
                refusals.push(format!("{recipient}: {} {}", response.code, response.message()));
            }
        }

        if !accepted.is_empty() {
            if !refusals.is_empty() {
                tracing::warn!(
                    provider = %self.name,
                    accepted = accepted.len(),
                    refused = ?refusals,
                    "Some recipients were refused"
                );
            }
            return Ok(accepted);
        }

        let detail = refusals.join("; ");
        Err(if all_permanent {
            PermanentError::InvalidRecipient(detail).into()
        } else {
            TemporaryError::SmtpTemporary(detail).into()
        })
    }
}

/// Classify a negative reply to `what`.
fn rejected(response: &Response, what: &str) -> DeliveryError {
    let message = format!("Server rejected {what}: {}", response.message());
    if response.is_permanent_error() {
        match response.code {
            552 => PermanentError::MessageTooLarge(message).into(),
            _ => PermanentError::MessageRejected(message).into(),
        }
    } else if response.is_temporary_error() {
        TemporaryError::SmtpTemporary(message).into()
    } else {
        SystemError::Internal(format!("Unexpected reply {}: {message}", response.code)).into()
    }
}

#[async_trait::async_trait]
impl Provider for SmtpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(level = "info", skip_all, fields(provider = %self.name, message_id = %message.message.id()))]
    async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        let recipients: Vec<String> = message.recipients.iter().map(ToString::to_string).collect();

        let batches = recipients.chunks(self.config.batch_size);
        let total = batches.len();
        let mut delivered = Vec::with_capacity(recipients.len());

        for (index, batch) in batches.enumerate() {
            if index > 0 && self.config.batch_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.batch_delay_ms)).await;
            }

            tracing::debug!(
                batch = index + 1,
                total,
                recipients = batch.len(),
                "Sending batch"
            );
            match self.send_batch(message, batch).await {
                Ok(accepted) => delivered.extend(accepted),
                Err(error) => return Err(DeliveryError::partial(error, delivered)),
            }
        }

        Ok(())
    }
}
