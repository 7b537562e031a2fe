//! Scriptable SMTP server for provider and failover tests
#![allow(dead_code)] // not every test uses every knob
//!
//! The server listens on an ephemeral localhost port, answers each command
//! with a configured reply, and records what it saw so tests can assert on
//! the exchange.
//!
//! ```rust,ignore
//! let server = MockSmtpServer::builder()
//!     .reject_recipient("nobody@example.org", 550, "No such user")
//!     .build()
//!     .await?;
//!
//! let config = SmtpProviderConfig::new("127.0.0.1", server.addr().port());
//! ```

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::Mutex,
    task::JoinHandle,
};

/// A command as the server parsed it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    Helo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    /// Everything between DATA and the terminating dot, unstuffed
    Content(String),
    Quit,
    Other(String),
}

#[derive(Debug, Clone)]
struct Reply {
    code: u16,
    text: String,
}

impl Reply {
    fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    fn render(&self) -> String {
        format!("{} {}\r\n", self.code, self.text)
    }
}

#[derive(Debug, Clone)]
struct Script {
    greeting: Reply,
    capabilities: Vec<String>,
    mail_from: Reply,
    rcpt_to: Reply,
    rejected_recipients: HashMap<String, Reply>,
    data: Reply,
    accepted: Reply,
    reply_delay: Option<Duration>,
    /// Close the socket without a reply once this many commands arrived
    hang_up_after: Option<usize>,
    /// Greet with 421 once this many connections were served
    busy_after_connections: Option<usize>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            greeting: Reply::new(220, "mock.example.net ESMTP ready"),
            capabilities: vec!["mock.example.net".to_string(), "SIZE 10485760".to_string()],
            mail_from: Reply::new(250, "Sender OK"),
            rcpt_to: Reply::new(250, "Recipient OK"),
            rejected_recipients: HashMap::new(),
            data: Reply::new(354, "End data with <CR><LF>.<CR><LF>"),
            accepted: Reply::new(250, "Queued"),
            reply_delay: None,
            hang_up_after: None,
            busy_after_connections: None,
        }
    }
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    commands: Arc<Mutex<Vec<SmtpCommand>>>,
    connections: Arc<AtomicUsize>,
    acceptor: JoinHandle<()>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder {
            script: Script::default(),
        }
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.commands.lock().await.clone()
    }

    /// Message bodies received, in order
    pub async fn messages(&self) -> Vec<String> {
        self.commands
            .lock()
            .await
            .iter()
            .filter_map(|command| match command {
                SmtpCommand::Content(body) => Some(body.clone()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.acceptor.abort();
    }
}

impl Drop for MockSmtpServer {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

fn angle_address(argument: &str) -> String {
    argument
        .split_once('<')
        .and_then(|(_, rest)| rest.split_once('>'))
        .map_or_else(|| argument.to_string(), |(address, _)| address.to_string())
}

async fn session(
    stream: TcpStream,
    number: usize,
    script: Arc<Script>,
    commands: Arc<Mutex<Vec<SmtpCommand>>>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut seen = 0_usize;

    if script.busy_after_connections.is_some_and(|limit| number > limit) {
        writer
            .write_all(Reply::new(421, "Too busy, try later").render().as_bytes())
            .await?;
        return Ok(());
    }

    writer.write_all(script.greeting.render().as_bytes()).await?;

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }

        seen += 1;
        if script.hang_up_after.is_some_and(|limit| seen > limit) {
            return Ok(());
        }

        let input = line.trim_end();
        let (verb, argument) = input.split_once(' ').unwrap_or((input, ""));

        let (command, reply) = match verb.to_ascii_uppercase().as_str() {
            "EHLO" => {
                let mut reply = String::new();
                let last = script.capabilities.len().saturating_sub(1);
                for (index, capability) in script.capabilities.iter().enumerate() {
                    let separator = if index == last { ' ' } else { '-' };
                    reply.push_str(&format!("250{separator}{capability}\r\n"));
                }
                (SmtpCommand::Ehlo(argument.to_string()), reply)
            }
            "HELO" => (
                SmtpCommand::Helo(argument.to_string()),
                Reply::new(250, "Hello").render(),
            ),
            "MAIL" => (
                SmtpCommand::MailFrom(angle_address(argument)),
                script.mail_from.render(),
            ),
            "RCPT" => {
                let address = angle_address(argument);
                let reply = script
                    .rejected_recipients
                    .get(&address)
                    .unwrap_or(&script.rcpt_to)
                    .render();
                (SmtpCommand::RcptTo(address), reply)
            }
            "DATA" => (SmtpCommand::Data, script.data.render()),
            "QUIT" => {
                commands.lock().await.push(SmtpCommand::Quit);
                writer.write_all(Reply::new(221, "Bye").render().as_bytes()).await?;
                return Ok(());
            }
            _ => (
                SmtpCommand::Other(input.to_string()),
                Reply::new(502, "Command not implemented").render(),
            ),
        };

        let reading_body = command == SmtpCommand::Data && script.data.code == 354;
        commands.lock().await.push(command);

        if let Some(delay) = script.reply_delay {
            tokio::time::sleep(delay).await;
        }
        writer.write_all(reply.as_bytes()).await?;

        if reading_body {
            let mut body = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).await? == 0 {
                    return Ok(());
                }
                if line == ".\r\n" || line == ".\n" {
                    break;
                }
                body.push_str(line.strip_prefix('.').unwrap_or(&line));
            }

            commands.lock().await.push(SmtpCommand::Content(body));
            writer.write_all(script.accepted.render().as_bytes()).await?;
        }
    }
}

pub struct MockSmtpServerBuilder {
    script: Script,
}

impl MockSmtpServerBuilder {
    #[must_use]
    pub fn with_greeting(mut self, code: u16, text: impl Into<String>) -> Self {
        self.script.greeting = Reply::new(code, text);
        self
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.script.capabilities = capabilities.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, text: impl Into<String>) -> Self {
        self.script.mail_from = Reply::new(code, text);
        self
    }

    /// Reply for every recipient not rejected individually
    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, text: impl Into<String>) -> Self {
        self.script.rcpt_to = Reply::new(code, text);
        self
    }

    #[must_use]
    pub fn reject_recipient(mut self, address: &str, code: u16, text: impl Into<String>) -> Self {
        self.script
            .rejected_recipients
            .insert(address.to_string(), Reply::new(code, text));
        self
    }

    #[must_use]
    pub fn with_data_response(mut self, code: u16, text: impl Into<String>) -> Self {
        self.script.data = Reply::new(code, text);
        self
    }

    /// Reply after the terminating dot
    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, text: impl Into<String>) -> Self {
        self.script.accepted = Reply::new(code, text);
        self
    }

    #[must_use]
    pub const fn with_response_delay(mut self, delay: Duration) -> Self {
        self.script.reply_delay = Some(delay);
        self
    }

    #[must_use]
    pub const fn hang_up_after(mut self, commands: usize) -> Self {
        self.script.hang_up_after = Some(commands);
        self
    }

    /// Serve the first `connections` normally, then greet everyone else with 421
    #[must_use]
    pub const fn busy_after_connections(mut self, connections: usize) -> Self {
        self.script.busy_after_connections = Some(connections);
        self
    }

    /// Bind to an ephemeral port and start accepting connections.
    pub async fn build(self) -> std::io::Result<MockSmtpServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let script = Arc::new(self.script);
        let commands = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let acceptor = tokio::spawn({
            let commands = Arc::clone(&commands);
            let connections = Arc::clone(&connections);
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let number = connections.fetch_add(1, Ordering::SeqCst) + 1;
                    tokio::spawn(session(
                        stream,
                        number,
                        Arc::clone(&script),
                        Arc::clone(&commands),
                    ));
                }
            }
        });

        Ok(MockSmtpServer {
            addr,
            commands,
            connections,
            acceptor,
        })
    }
}
