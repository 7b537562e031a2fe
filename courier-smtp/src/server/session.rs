use std::{net::SocketAddr, sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD};
use courier_common::{Signal, incoming, internal, outgoing};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf},
    sync::broadcast,
    time::Instant,
};

use super::{
    ReceivedMessage, Rejection, SmtpServerConfig, SubmissionHandler,
    command::{Command, HeloVariant},
    is_local,
};

/// Longest command line, including CRLF (RFC 5321 4.5.3.1.4)
const MAX_COMMAND_LINE: u64 = 512;
/// Longest authentication response line
const MAX_AUTH_LINE: u64 = 4096;
const MAX_RECIPIENTS: usize = 100;
/// Protocol errors tolerated before the connection is dropped
const MAX_ERRORS: usize = 10;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Connection closed by client")]
    Closed,

    #[error("Line exceeds {0} bytes")]
    LineTooLong(u64),
}

/// Whether the conversation goes on after a command
enum Flow {
    Continue,
    Close,
}

/// One submission conversation with a client
pub struct Session<S, H> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    peer: SocketAddr,
    config: Arc<SmtpServerConfig>,
    handler: Arc<H>,
    greeted: bool,
    authenticated: Option<String>,
    from: Option<String>,
    recipients: Vec<String>,
    errors: usize,
}

impl<S, H> Session<S, H>
where
    S: AsyncRead + AsyncWrite + Send,
    H: SubmissionHandler,
{
    pub fn new(stream: S, peer: SocketAddr, config: Arc<SmtpServerConfig>, handler: Arc<H>) -> Self {
        let (reader, writer) = tokio::io::split(stream);

        Self {
            reader: BufReader::new(reader),
            writer,
            peer,
            config,
            handler,
            greeted: false,
            authenticated: None,
            from: None,
            recipients: Vec::default(),
            errors: 0,
        }
    }

    /// Converse with the client until it quits, the connection fails, or the
    /// server shuts down.
    ///
    /// # Errors
    ///
    /// Returns a [`SessionError`] when the connection breaks, times out, or
    /// the client sends an oversized line.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), SessionError> {
        if self.config.local_only && !is_local(&self.peer) {
            incoming!(level = WARN, "Refusing non-local connection from {}", self.peer);
            self.reply(554, "5.7.1 Only local connections are accepted").await?;
            return Ok(());
        }

        let banner = format!("{} ESMTP courier ready", self.config.banner);
        self.reply(220, &banner).await?;

        let deadline = Instant::now() + Duration::from_secs(self.config.timeouts.connection_secs);
        let command_timeout = Duration::from_secs(self.config.timeouts.command_secs);

        loop {
            let line = tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown | Signal::Finalised) | Err(broadcast::error::RecvError::Closed)) {
                        self.reply(421, "4.3.2 Service shutting down").await?;
                        return Ok(());
                    }
                    continue;
                }

                () = tokio::time::sleep_until(deadline) => {
                    self.reply(421, "4.4.2 Connection time limit exceeded").await?;
                    return Err(SessionError::Timeout("the client to finish"));
                }

                line = self.read_line(command_timeout, MAX_COMMAND_LINE, "a command") => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(()),
                Err(SessionError::Timeout(what)) => {
                    self.reply(421, "4.4.2 Timeout waiting for command").await?;
                    return Err(SessionError::Timeout(what));
                }
                Err(SessionError::LineTooLong(limit)) => {
                    self.reply(500, "5.5.2 Line too long").await?;
                    return Err(SessionError::LineTooLong(limit));
                }
                Err(err) => return Err(err),
            };

            let command = Command::try_from(line.as_slice()).unwrap_or_else(|e| e);
            incoming!("{command}");

            if matches!(self.handle(command, &line).await?, Flow::Close) {
                return Ok(());
            }

            if self.errors >= MAX_ERRORS {
                self.reply(421, "4.7.0 Too many errors, closing connection").await?;
                return Ok(());
            }
        }
    }

    async fn handle(&mut self, command: Command, line: &[u8]) -> Result<Flow, SessionError> {
        match command {
            Command::Helo(variant) => self.helo(variant).await?,
            Command::Auth(mechanism, initial) => self.auth(&mechanism, initial).await?,
            Command::MailFrom(from, params) => {
                if params.size().is_some_and(|size| size > self.config.max_message_size) {
                    self.reply(552, "5.3.4 Message size exceeds fixed maximum message size")
                        .await?;
                } else {
                    self.mail_from(from).await?;
                }
            }
            Command::RcptTo(recipient) => self.rcpt_to(recipient).await?,
            Command::Data => return self.data().await,
            Command::Rset => {
                self.reset();
                self.reply(250, "2.0.0 Ok").await?;
            }
            Command::Noop => self.reply(250, "2.0.0 Ok").await?,
            Command::Vrfy => self.reply(252, "2.5.2 Cannot VRFY user").await?,
            Command::Quit => {
                self.reply(221, "2.0.0 Bye").await?;
                return Ok(Flow::Close);
            }
            Command::StartTls => self.reply(502, "5.5.1 STARTTLS not available").await?,
            Command::Invalid(reason) => self.invalid(line, &reason).await?,
        }

        Ok(Flow::Continue)
    }

    async fn helo(&mut self, variant: HeloVariant) -> Result<(), SessionError> {
        self.reset();
        self.greeted = true;

        match variant {
            HeloVariant::Helo(client) => {
                let text = format!("{} greets {client}", self.config.banner);
                self.reply(250, &text).await
            }
            HeloVariant::Ehlo(client) => {
                let lines = [
                    format!("{} greets {client}", self.config.banner),
                    format!("SIZE {}", self.config.max_message_size),
                    String::from("8BITMIME"),
                    String::from("PIPELINING"),
                    String::from("AUTH PLAIN LOGIN"),
                    String::from("ENHANCEDSTATUSCODES"),
                ];
                self.reply_lines(250, &lines).await
            }
        }
    }

    async fn auth(&mut self, mechanism: &str, initial: Option<String>) -> Result<(), SessionError> {
        if !self.greeted {
            return self.sequence_error("5.5.1 Send EHLO first").await;
        }
        if self.authenticated.is_some() {
            return self.sequence_error("5.5.1 Already authenticated").await;
        }
        if self.from.is_some() {
            return self.sequence_error("5.5.1 AUTH not permitted during a mail transaction").await;
        }

        let credentials = match mechanism {
            "PLAIN" => self.auth_plain(initial).await?,
            "LOGIN" => self.auth_login(initial).await?,
            _ => {
                self.errors += 1;
                return self.reply(504, "5.5.4 Unrecognized authentication mechanism").await;
            }
        };

        let Some((username, password)) = credentials else {
            self.errors += 1;
            return Ok(());
        };

        if self.config.accepts(&username, &password) {
            internal!(level = INFO, "Client {} authenticated as {username}", self.peer);
            self.authenticated = Some(username);
            self.reply(235, "2.7.0 Authentication successful").await
        } else {
            incoming!(level = WARN, "Failed authentication from {} as {username}", self.peer);
            self.errors += 1;
            self.reply(535, "5.7.8 Authentication credentials invalid").await
        }
    }

    /// `authzid NUL authcid NUL passwd`, possibly sent with the command
    async fn auth_plain(&mut self, initial: Option<String>) -> Result<Option<(String, String)>, SessionError> {
        let response = if initial.is_some() { initial } else { self.challenge("").await? };
        let Some(response) = response else {
            return Ok(None);
        };

        let Some(decoded) = self.decode(&response).await? else {
            return Ok(None);
        };

        let mut fields = decoded.split('\0');
        match (fields.next(), fields.next(), fields.next(), fields.next()) {
            (Some(_authzid), Some(username), Some(password), None) => {
                Ok(Some((username.to_string(), password.to_string())))
            }
            _ => {
                self.reply(501, "5.5.2 Malformed PLAIN credentials").await?;
                Ok(None)
            }
        }
    }

    async fn auth_login(&mut self, initial: Option<String>) -> Result<Option<(String, String)>, SessionError> {
        let username = if initial.is_some() {
            initial
        } else {
            self.challenge("VXNlcm5hbWU6").await?
        };
        let Some(username) = username else {
            return Ok(None);
        };
        let Some(username) = self.decode(&username).await? else {
            return Ok(None);
        };

        let Some(password) = self.challenge("UGFzc3dvcmQ6").await? else {
            return Ok(None);
        };
        let Some(password) = self.decode(&password).await? else {
            return Ok(None);
        };

        Ok(Some((username, password)))
    }

    /// Send a 334 challenge and read the answer. `None` when the client
    /// cancelled.
    async fn challenge(&mut self, prompt: &str) -> Result<Option<String>, SessionError> {
        self.reply(334, prompt).await?;

        let timeout = Duration::from_secs(self.config.timeouts.command_secs);
        let line = self
            .read_line(timeout, MAX_AUTH_LINE, "an authentication response")
            .await?
            .ok_or(SessionError::Closed)?;
        let response = String::from_utf8_lossy(&line).trim().to_string();

        if response == "*" {
            self.reply(501, "5.7.0 Authentication cancelled").await?;
            return Ok(None);
        }

        Ok(Some(response))
    }

    async fn decode(&mut self, encoded: &str) -> Result<Option<String>, SessionError> {
        let decoded = STANDARD
            .decode(encoded)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok());

        if decoded.is_none() {
            self.reply(501, "5.5.2 Cannot decode response").await?;
        }

        Ok(decoded)
    }

    async fn mail_from(&mut self, from: String) -> Result<(), SessionError> {
        if !self.greeted {
            return self.sequence_error("5.5.1 Send HELO/EHLO first").await;
        }
        if self.config.auth_required() && self.authenticated.is_none() {
            return self.reply(530, "5.7.0 Authentication required").await;
        }
        if self.from.is_some() {
            return self.sequence_error("5.5.1 Sender already specified").await;
        }

        if let Err(rejection) = self.handler.validate_sender(&from) {
            return self.reject(&rejection).await;
        }

        self.from = Some(from);
        self.reply(250, "2.1.0 Ok").await
    }

    async fn rcpt_to(&mut self, recipient: String) -> Result<(), SessionError> {
        if self.from.is_none() {
            return self.sequence_error("5.5.1 Need MAIL before RCPT").await;
        }
        if self.recipients.len() >= MAX_RECIPIENTS {
            return self.reply(452, "4.5.3 Too many recipients").await;
        }

        if let Err(rejection) = self.handler.validate_recipient(&recipient) {
            return self.reject(&rejection).await;
        }

        self.recipients.push(recipient);
        self.reply(250, "2.1.5 Ok").await
    }

    async fn data(&mut self) -> Result<Flow, SessionError> {
        if self.from.is_none() {
            self.sequence_error("5.5.1 Need MAIL command").await?;
            return Ok(Flow::Continue);
        }
        if self.recipients.is_empty() {
            self.sequence_error("5.5.1 Need RCPT command").await?;
            return Ok(Flow::Continue);
        }

        self.reply(354, "End data with <CR><LF>.<CR><LF>").await?;

        let Some(content) = self.read_data().await? else {
            self.reply(552, "5.3.4 Message size exceeds fixed maximum message size")
                .await?;
            return Ok(Flow::Close);
        };

        let from = self.from.take().unwrap_or_default();
        let recipients = std::mem::take(&mut self.recipients);

        let Ok(content) = String::from_utf8(content) else {
            self.reply(554, "5.6.0 Message content is not valid UTF-8").await?;
            return Ok(Flow::Continue);
        };

        let message = ReceivedMessage {
            peer: self.peer,
            authenticated: self.authenticated.clone(),
            from,
            recipients,
            content,
        };

        match self.handler.handle_message(message).await {
            Ok(id) => {
                let text = format!("2.0.0 Ok: queued as {id}");
                self.reply(250, &text).await?;
            }
            Err(rejection) => self.reject(&rejection).await?,
        }

        Ok(Flow::Continue)
    }

    /// Read message content up to the lone dot, undoing dot-stuffing.
    /// `None` once the content grows past the size limit.
    async fn read_data(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        let timeout = Duration::from_secs(self.config.timeouts.data_secs);
        let limit = self.config.max_message_size;
        let mut content = Vec::default();

        loop {
            // room for the rest of the message plus the terminating dot line
            let room = u64::try_from(limit.saturating_sub(content.len()))
                .unwrap_or(u64::MAX)
                .saturating_add(3);

            let line = match self.read_line(timeout, room, "message content").await {
                Ok(Some(line)) => line,
                Ok(None) => return Err(SessionError::Closed),
                Err(SessionError::LineTooLong(_)) => return Ok(None),
                Err(err) => return Err(err),
            };

            let line = line
                .strip_suffix(b"\r\n")
                .or_else(|| line.strip_suffix(b"\n"))
                .unwrap_or(&line);

            if line == b"." {
                return Ok(Some(content));
            }

            let line = line.strip_prefix(b".").unwrap_or(line);
            if content.len().saturating_add(line.len()).saturating_add(2) > limit {
                return Ok(None);
            }

            content.extend_from_slice(line);
            content.extend_from_slice(b"\r\n");
        }
    }

    /// Read up to `limit` bytes ending in LF. `None` at end of stream.
    async fn read_line(
        &mut self,
        timeout: Duration,
        limit: u64,
        waiting_for: &'static str,
    ) -> Result<Option<Vec<u8>>, SessionError> {
        let mut line = Vec::default();
        let read = tokio::time::timeout(timeout, (&mut self.reader).take(limit).read_until(b'\n', &mut line))
            .await
            .map_err(|_| SessionError::Timeout(waiting_for))??;

        if read == 0 {
            return Ok(None);
        }

        if !line.ends_with(b"\n") {
            return if u64::try_from(read).unwrap_or(u64::MAX) >= limit {
                Err(SessionError::LineTooLong(limit))
            } else {
                Err(SessionError::Closed)
            };
        }

        Ok(Some(line))
    }

    fn reset(&mut self) {
        self.from = None;
        self.recipients.clear();
    }

    /// 501 for a known verb with bad arguments, 500 for anything else
    async fn invalid(&mut self, line: &[u8], reason: &str) -> Result<(), SessionError> {
        self.errors += 1;

        let verb = String::from_utf8_lossy(line)
            .split(|c: char| c.is_ascii_whitespace() || c == ':')
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        if ["MAIL", "RCPT", "EHLO", "HELO", "AUTH"].contains(&verb.as_str()) {
            internal!(level = DEBUG, "Bad arguments from {}: {reason}", self.peer);
            self.reply(501, "5.5.4 Syntax error in parameters or arguments").await
        } else {
            internal!(level = DEBUG, "Unrecognised command from {}: {reason}", self.peer);
            self.reply(500, "5.5.2 Command not recognized").await
        }
    }

    async fn sequence_error(&mut self, text: &str) -> Result<(), SessionError> {
        self.errors += 1;
        self.reply(503, text).await
    }

    async fn reject(&mut self, rejection: &Rejection) -> Result<(), SessionError> {
        self.reply(rejection.code, &rejection.message).await
    }

    async fn reply(&mut self, code: u16, text: &str) -> Result<(), SessionError> {
        outgoing!("{code} {text}");
        let line = format!("{code} {text}\r\n");
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn reply_lines(&mut self, code: u16, lines: &[String]) -> Result<(), SessionError> {
        let mut reply = String::default();
        for (idx, text) in lines.iter().enumerate() {
            let separator = if idx + 1 == lines.len() { ' ' } else { '-' };
            outgoing!("{code}{separator}{text}");
            reply.push_str(&format!("{code}{separator}{text}\r\n"));
        }
        self.writer.write_all(reply.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
