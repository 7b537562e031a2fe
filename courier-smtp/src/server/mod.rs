//! SMTP submission listener.
//!
//! Applications on the same host hand messages to the relay the way they
//! would to any mail server. Each accepted message is passed to a
//! [`SubmissionHandler`], which decides whether it is queued.
//!
//! The listener speaks plain SMTP with AUTH PLAIN and LOGIN. By default it
//! only accepts loopback peers and only binds a loopback address.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use courier_common::{Signal, internal};
use futures_util::future::join_all;
use serde::Deserialize;
use tokio::{net::TcpListener, sync::broadcast};

pub mod command;
mod session;

pub use session::{Session, SessionError};

/// Server-side timeouts, in seconds
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SmtpServerTimeouts {
    /// Waiting for the next command
    ///
    /// Default: 300 seconds
    #[serde(default = "default_command_timeout")]
    pub command_secs: u64,

    /// Waiting for the next line of message content
    ///
    /// Default: 300 seconds
    #[serde(default = "default_data_timeout")]
    pub data_secs: u64,

    /// Longest a single connection may stay open
    ///
    /// Default: 1800 seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_secs: u64,
}

const fn default_command_timeout() -> u64 {
    300
}

const fn default_data_timeout() -> u64 {
    300
}

const fn default_connection_timeout() -> u64 {
    1800
}

impl Default for SmtpServerTimeouts {
    fn default() -> Self {
        Self {
            command_secs: default_command_timeout(),
            data_secs: default_data_timeout(),
            connection_secs: default_connection_timeout(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct SmtpServerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Default: 127.0.0.1:2525
    #[serde(default = "default_listen_address")]
    pub listen_address: SocketAddr,

    /// Refuse peers that are not on a loopback address
    #[serde(default = "default_local_only")]
    pub local_only: bool,

    /// Host name in the greeting and EHLO reply
    #[serde(default = "default_banner")]
    pub banner: String,

    /// Largest accepted message, advertised through SIZE
    ///
    /// Default: 10 MiB
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// With a username set, clients must authenticate with these credentials
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Require AUTH before MAIL even without configured credentials
    #[serde(default)]
    pub require_auth: bool,

    #[serde(default)]
    pub timeouts: SmtpServerTimeouts,
}

const fn default_enabled() -> bool {
    true
}

const fn default_listen_address() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 2525)
}

const fn default_local_only() -> bool {
    true
}

fn default_banner() -> String {
    "localhost".to_string()
}

const fn default_max_message_size() -> usize {
    10 * 1024 * 1024
}

impl Default for SmtpServerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            listen_address: default_listen_address(),
            local_only: default_local_only(),
            banner: default_banner(),
            max_message_size: default_max_message_size(),
            username: None,
            password: None,
            require_auth: false,
            timeouts: SmtpServerTimeouts::default(),
        }
    }
}

impl fmt::Debug for SmtpServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpServerConfig")
            .field("enabled", &self.enabled)
            .field("listen_address", &self.listen_address)
            .field("local_only", &self.local_only)
            .field("banner", &self.banner)
            .field("max_message_size", &self.max_message_size)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "********"))
            .field("require_auth", &self.require_auth)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl SmtpServerConfig {
    /// Whether MAIL is refused until the client authenticates
    #[must_use]
    pub const fn auth_required(&self) -> bool {
        self.require_auth || self.username.is_some()
    }

    /// Check AUTH credentials. Without a configured username any credentials
    /// are accepted.
    #[must_use]
    pub fn accepts(&self, username: &str, password: &str) -> bool {
        self.username.as_deref().is_none_or(|expected| {
            expected == username && self.password.as_deref().unwrap_or_default() == password
        })
    }

    /// The address actually bound: a local-only listener never binds beyond
    /// loopback.
    #[must_use]
    pub fn bind_address(&self) -> SocketAddr {
        if self.local_only && !self.listen_address.ip().is_loopback() {
            internal!(
                level = WARN,
                "SMTP listen address {} is not local, binding 127.0.0.1 instead",
                self.listen_address
            );
            return SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.listen_address.port());
        }
        self.listen_address
    }
}

/// Whether `peer` connected over loopback
#[must_use]
pub fn is_local(peer: &SocketAddr) -> bool {
    match peer.ip() {
        IpAddr::V4(ip) => ip.is_loopback(),
        IpAddr::V6(ip) => ip.is_loopback() || ip.to_ipv4_mapped().is_some_and(|ip| ip.is_loopback()),
    }
}

/// A message received in full, with its envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub peer: SocketAddr,
    /// The AUTH identity, if the client authenticated
    pub authenticated: Option<String>,
    pub from: String,
    pub recipients: Vec<String>,
    /// Unstuffed content with CRLF line endings
    pub content: String,
}

/// A negative reply for the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub code: u16,
    pub message: String,
}

impl Rejection {
    #[must_use]
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// 451: the client should try again later
    #[must_use]
    pub fn temporary(message: impl Into<String>) -> Self {
        Self::new(451, message)
    }

    /// 554: the message will never be accepted
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(554, message)
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

/// Business decisions for a submission session.
///
/// The session owns the protocol; the handler validates the envelope as it
/// arrives and takes the finished message.
#[async_trait::async_trait]
pub trait SubmissionHandler: Send + Sync + 'static {
    /// Check a MAIL FROM reverse-path.
    fn validate_sender(&self, _from: &str) -> Result<(), Rejection> {
        Ok(())
    }

    /// Check a RCPT TO forward-path.
    fn validate_recipient(&self, _recipient: &str) -> Result<(), Rejection> {
        Ok(())
    }

    /// Take a complete message. `Ok` carries the queue identifier reported
    /// back to the client.
    async fn handle_message(&self, message: ReceivedMessage) -> Result<String, Rejection>;
}

/// A bound submission listener
#[derive(Debug)]
pub struct SmtpListener {
    listener: TcpListener,
    config: Arc<SmtpServerConfig>,
}

impl SmtpListener {
    /// Bind the configured address.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the address cannot be bound.
    pub async fn bind(config: SmtpServerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.bind_address()).await?;

        Ok(Self {
            listener,
            config: Arc::new(config),
        })
    }

    /// The bound address, useful when binding port 0
    ///
    /// # Errors
    ///
    /// Returns the I/O error from the socket.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown, then wait for open sessions.
    ///
    /// Sessions are told about the shutdown as well and close at the next
    /// command boundary.
    ///
    /// # Errors
    ///
    /// Returns an error if the listening socket fails to report its address.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn serve<H: SubmissionHandler>(
        self,
        handler: Arc<H>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> std::io::Result<()> {
        let socket = self.local_addr()?;
        internal!(
            level = INFO,
            "SMTP listener serving {socket}{}",
            if self.config.local_only { " (local connections only)" } else { "" }
        );

        let mut sessions = Vec::default();

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown | Signal::Finalised) | Err(broadcast::error::RecvError::Closed)) {
                        internal!(level = INFO, "SMTP listener {socket} received shutdown signal, finishing sessions ...");
                        join_all(sessions).await;
                        break;
                    }
                }

                connection = self.listener.accept() => {
                    let (stream, peer) = match connection {
                        Ok(connection) => connection,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept SMTP connection");
                            continue;
                        }
                    };
                    tracing::debug!(%peer, "Connection received on {socket}");

                    let session = Session::new(stream, peer, Arc::clone(&self.config), Arc::clone(&handler));
                    let signal = shutdown.resubscribe();
                    sessions.retain(|handle: &tokio::task::JoinHandle<()>| !handle.is_finished());
                    sessions.push(tokio::spawn(async move {
                        if let Err(err) = session.run(signal).await {
                            internal!(level = DEBUG, "SMTP session with {peer} ended: {err}");
                        }
                    }));
                }
            }
        }

        internal!(level = INFO, "SMTP listener {socket} stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_local_peers() {
        for peer in ["127.0.0.1:1000", "127.10.0.3:1000", "[::1]:1000", "[::ffff:127.0.0.1]:1000"] {
            assert!(is_local(&peer.parse().unwrap()), "{peer}");
        }
        for peer in ["10.0.0.1:1000", "203.0.113.7:25", "[2001:db8::1]:1000"] {
            assert!(!is_local(&peer.parse().unwrap()), "{peer}");
        }
    }

    #[test]
    fn test_local_only_never_binds_beyond_loopback() {
        let config = SmtpServerConfig {
            listen_address: "0.0.0.0:2525".parse().unwrap(),
            ..SmtpServerConfig::default()
        };
        assert_eq!(config.bind_address(), "127.0.0.1:2525".parse().unwrap());

        let open = SmtpServerConfig {
            local_only: false,
            ..config
        };
        assert_eq!(open.bind_address(), "0.0.0.0:2525".parse().unwrap());
    }

    #[test]
    fn test_credentials() {
        let anyone = SmtpServerConfig::default();
        assert!(!anyone.auth_required());
        assert!(anyone.accepts("whoever", "whatever"));

        let configured = SmtpServerConfig {
            username: Some("app".to_string()),
            password: Some("s3cret".to_string()),
            ..SmtpServerConfig::default()
        };
        assert!(configured.auth_required());
        assert!(configured.accepts("app", "s3cret"));
        assert!(!configured.accepts("app", "guess"));
        assert!(!configured.accepts("other", "s3cret"));

        let debug = format!("{configured:?}");
        assert!(!debug.contains("s3cret"));
    }
}
