//! Submission listener tests, driving sessions over in-memory streams.

use std::{net::SocketAddr, sync::Arc};

use base64::{Engine, engine::general_purpose::STANDARD};
use courier_common::Signal;
use courier_smtp::{
    ReceivedMessage, Rejection, SmtpListener, SmtpServerConfig, SubmissionHandler,
    server::{Session, SessionError},
};
use pretty_assertions::assert_eq;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::{Mutex, broadcast},
    task::JoinHandle,
};

#[derive(Default)]
struct Recorder {
    messages: Mutex<Vec<ReceivedMessage>>,
}

#[async_trait::async_trait]
impl SubmissionHandler for Recorder {
    fn validate_recipient(&self, recipient: &str) -> Result<(), Rejection> {
        if recipient.ends_with("@blocked.example") {
            Err(Rejection::new(553, "5.1.3 Recipient not allowed"))
        } else {
            Ok(())
        }
    }

    async fn handle_message(&self, message: ReceivedMessage) -> Result<String, Rejection> {
        if message.content.contains("please-fail") {
            return Err(Rejection::temporary("4.3.0 Queue unavailable"));
        }
        self.messages.lock().await.push(message);
        Ok(String::from("01TESTQUEUEID"))
    }
}

struct Client<R, W> {
    reader: BufReader<R>,
    writer: W,
}

impl<R, W> Client<R, W>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    /// Read one complete, possibly multiline, reply.
    async fn reply(&mut self) -> String {
        let mut reply = String::new();
        loop {
            let mut line = String::new();
            let read = self.reader.read_line(&mut line).await.unwrap();
            assert!(read > 0, "connection closed while waiting for a reply: {reply:?}");
            reply.push_str(&line);
            if line.as_bytes().get(3) != Some(&b'-') {
                return reply;
            }
        }
    }

    async fn send(&mut self, line: &str) -> String {
        self.writer.write_all(format!("{line}\r\n").as_bytes()).await.unwrap();
        self.reply().await
    }

    async fn write(&mut self, raw: &str) {
        self.writer.write_all(raw.as_bytes()).await.unwrap();
    }

    async fn closed(&mut self) -> bool {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap_or(0) == 0
    }
}

type DuplexClient = Client<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

struct Harness {
    client: DuplexClient,
    recorder: Arc<Recorder>,
    shutdown: broadcast::Sender<Signal>,
    session: JoinHandle<Result<(), SessionError>>,
}

fn start(config: SmtpServerConfig, peer: &str) -> Harness {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let peer: SocketAddr = peer.parse().unwrap();
    let recorder = Arc::new(Recorder::default());
    let (shutdown, receiver) = broadcast::channel(4);

    let session = Session::new(server, peer, Arc::new(config), Arc::clone(&recorder));
    let session = tokio::spawn(session.run(receiver));

    let (reader, writer) = tokio::io::split(client);
    Harness {
        client: Client {
            reader: BufReader::new(reader),
            writer,
        },
        recorder,
        shutdown,
        session,
    }
}

fn plain(username: &str, password: &str) -> String {
    STANDARD.encode(format!("\0{username}\0{password}"))
}

fn with_credentials() -> SmtpServerConfig {
    SmtpServerConfig {
        username: Some(String::from("app")),
        password: Some(String::from("s3cret")),
        ..SmtpServerConfig::default()
    }
}

#[tokio::test]
async fn test_submission_flow() {
    let Harness {
        mut client,
        recorder,
        session,
        shutdown: _shutdown,
    } = start(SmtpServerConfig::default(), "127.0.0.1:40000");

    assert!(client.reply().await.starts_with("220 localhost ESMTP"));

    let ehlo = client.send("EHLO app.local").await;
    assert!(ehlo.starts_with("250-localhost greets app.local\r\n"));
    assert!(ehlo.contains("250-SIZE 10485760\r\n"));
    assert!(ehlo.contains("250-AUTH PLAIN LOGIN\r\n"));
    assert!(ehlo.ends_with("250 ENHANCEDSTATUSCODES\r\n"));

    assert!(client.send("MAIL FROM:<app@example.com> SIZE=120").await.starts_with("250"));
    assert!(client.send("RCPT TO:<alice@example.org>").await.starts_with("250"));
    assert!(client.send("RCPT TO:<bob@example.org>").await.starts_with("250"));
    assert!(client.send("DATA").await.starts_with("354"));

    client
        .write("Subject: hello\r\n\r\n..leading dot\r\nbody\r\n")
        .await;
    assert_eq!(client.send(".").await, "250 2.0.0 Ok: queued as 01TESTQUEUEID\r\n");
    assert!(client.send("QUIT").await.starts_with("221"));

    assert!(session.await.unwrap().is_ok());

    let messages = recorder.messages.lock().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].from, "app@example.com");
    assert_eq!(messages[0].recipients, ["alice@example.org", "bob@example.org"]);
    assert_eq!(messages[0].content, "Subject: hello\r\n\r\n.leading dot\r\nbody\r\n");
    assert_eq!(messages[0].authenticated, None);
}

#[tokio::test]
async fn test_transaction_resets_after_each_message() {
    let mut harness = start(SmtpServerConfig::default(), "127.0.0.1:40000");
    let client = &mut harness.client;
    client.reply().await;
    client.send("HELO app.local").await;

    for subject in ["one", "two"] {
        assert!(client.send("MAIL FROM:<app@example.com>").await.starts_with("250"));
        assert!(client.send("RCPT TO:<alice@example.org>").await.starts_with("250"));
        client.send("DATA").await;
        client.write(&format!("Subject: {subject}\r\n\r\nbody\r\n")).await;
        assert!(client.send(".").await.starts_with("250 2.0.0"));
    }

    assert!(client.send("MAIL FROM:<app@example.com>").await.starts_with("250"));
    assert!(client.send("RCPT TO:<alice@example.org>").await.starts_with("250"));
    client.send("DATA").await;
    client.write("Subject: please-fail\r\n\r\nbody\r\n").await;
    assert_eq!(client.send(".").await, "451 4.3.0 Queue unavailable\r\n");

    assert_eq!(harness.recorder.messages.lock().await.len(), 2);
}

#[tokio::test]
async fn test_auth_plain_required_before_mail() {
    let mut harness = start(with_credentials(), "127.0.0.1:40000");
    let client = &mut harness.client;
    client.reply().await;
    client.send("EHLO app.local").await;

    assert!(client.send("MAIL FROM:<app@example.com>").await.starts_with("530 5.7.0"));
    assert!(
        client
            .send(&format!("AUTH PLAIN {}", plain("app", "wrong")))
            .await
            .starts_with("535 5.7.8")
    );
    assert!(
        client
            .send(&format!("AUTH PLAIN {}", plain("app", "s3cret")))
            .await
            .starts_with("235 2.7.0")
    );
    assert!(
        client
            .send(&format!("AUTH PLAIN {}", plain("app", "s3cret")))
            .await
            .starts_with("503")
    );

    assert!(client.send("MAIL FROM:<app@example.com>").await.starts_with("250"));
    client.send("RCPT TO:<alice@example.org>").await;
    client.send("DATA").await;
    client.write("Subject: hi\r\n\r\nbody\r\n").await;
    assert!(client.send(".").await.starts_with("250"));

    let messages = harness.recorder.messages.lock().await;
    assert_eq!(messages[0].authenticated.as_deref(), Some("app"));
}

#[tokio::test]
async fn test_auth_login_exchange() {
    let mut harness = start(with_credentials(), "127.0.0.1:40000");
    let client = &mut harness.client;
    client.reply().await;
    client.send("EHLO app.local").await;

    assert_eq!(client.send("AUTH CRAM-MD5").await, "504 5.5.4 Unrecognized authentication mechanism\r\n");

    assert_eq!(client.send("AUTH LOGIN").await, "334 VXNlcm5hbWU6\r\n");
    assert!(client.send("*").await.starts_with("501 5.7.0"));

    assert_eq!(client.send("AUTH LOGIN").await, "334 VXNlcm5hbWU6\r\n");
    assert_eq!(client.send(&STANDARD.encode("app")).await, "334 UGFzc3dvcmQ6\r\n");
    assert!(client.send(&STANDARD.encode("s3cret")).await.starts_with("235"));

    assert!(client.send("MAIL FROM:<app@example.com>").await.starts_with("250"));
}

#[tokio::test]
async fn test_plain_challenge_and_bad_encoding() {
    let mut harness = start(with_credentials(), "127.0.0.1:40000");
    let client = &mut harness.client;
    client.reply().await;
    client.send("EHLO app.local").await;

    assert_eq!(client.send("AUTH PLAIN").await, "334 \r\n");
    assert!(client.send("not base64!").await.starts_with("501 5.5.2"));

    assert_eq!(client.send("AUTH PLAIN").await, "334 \r\n");
    assert!(client.send(&plain("app", "s3cret")).await.starts_with("235"));
}

#[tokio::test]
async fn test_any_credentials_without_configured_user() {
    let mut harness = start(SmtpServerConfig::default(), "127.0.0.1:40000");
    let client = &mut harness.client;
    client.reply().await;
    client.send("EHLO app.local").await;

    assert!(
        client
            .send(&format!("AUTH PLAIN {}", plain("anyone", "anything")))
            .await
            .starts_with("235")
    );
}

#[tokio::test]
async fn test_auth_required_without_credentials() {
    let config = SmtpServerConfig {
        require_auth: true,
        ..SmtpServerConfig::default()
    };
    let mut harness = start(config, "127.0.0.1:40000");
    let client = &mut harness.client;
    client.reply().await;
    client.send("EHLO app.local").await;

    assert!(client.send("MAIL FROM:<app@example.com>").await.starts_with("530"));
    client.send(&format!("AUTH PLAIN {}", plain("anyone", "anything"))).await;
    assert!(client.send("MAIL FROM:<app@example.com>").await.starts_with("250"));
}

#[tokio::test]
async fn test_oversized_message_closes_connection() {
    let config = SmtpServerConfig {
        max_message_size: 64,
        ..SmtpServerConfig::default()
    };
    let mut harness = start(config, "127.0.0.1:40000");
    let client = &mut harness.client;
    client.reply().await;
    client.send("EHLO app.local").await;

    assert!(
        client
            .send("MAIL FROM:<app@example.com> SIZE=100")
            .await
            .starts_with("552 5.3.4")
    );

    assert!(client.send("MAIL FROM:<app@example.com>").await.starts_with("250"));
    client.send("RCPT TO:<alice@example.org>").await;
    assert!(client.send("DATA").await.starts_with("354"));

    for _ in 0..7 {
        client.write("aaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n").await;
    }
    assert!(client.send(".").await.starts_with("552 5.3.4"));
    assert!(client.closed().await);

    assert!(harness.session.await.unwrap().is_ok());
    assert!(harness.recorder.messages.lock().await.is_empty());
}

#[tokio::test]
async fn test_non_local_peer_refused() {
    let mut refused = start(SmtpServerConfig::default(), "203.0.113.5:40000");
    assert_eq!(
        refused.client.reply().await,
        "554 5.7.1 Only local connections are accepted\r\n"
    );
    assert!(refused.client.closed().await);

    let open = SmtpServerConfig {
        local_only: false,
        ..SmtpServerConfig::default()
    };
    let mut accepted = start(open, "203.0.113.5:40000");
    assert!(accepted.client.reply().await.starts_with("220"));
}

#[tokio::test]
async fn test_sequence_and_syntax_errors() {
    let mut harness = start(SmtpServerConfig::default(), "127.0.0.1:40000");
    let client = &mut harness.client;
    client.reply().await;

    assert!(client.send("MAIL FROM:<app@example.com>").await.starts_with("503"));
    client.send("EHLO app.local").await;
    assert!(client.send("RCPT TO:<alice@example.org>").await.starts_with("503"));
    assert!(client.send("FOO bar").await.starts_with("500 5.5.2"));
    assert!(client.send("MAIL FROM:<app@example.com").await.starts_with("501"));

    assert!(client.send("MAIL FROM:<app@example.com>").await.starts_with("250"));
    assert!(client.send("MAIL FROM:<app@example.com>").await.starts_with("503"));
    assert!(client.send("DATA").await.starts_with("503"));
    assert_eq!(
        client.send("RCPT TO:<someone@blocked.example>").await,
        "553 5.1.3 Recipient not allowed\r\n"
    );
    assert!(client.send("RSET").await.starts_with("250"));
    assert!(client.send("RCPT TO:<alice@example.org>").await.starts_with("503"));

    assert!(client.send("NOOP").await.starts_with("250"));
    assert!(client.send("VRFY alice").await.starts_with("252"));
    assert!(client.send("STARTTLS").await.starts_with("502"));
}

#[tokio::test]
async fn test_too_many_errors_drop_connection() {
    let mut harness = start(SmtpServerConfig::default(), "127.0.0.1:40000");
    let client = &mut harness.client;
    client.reply().await;

    for _ in 0..9 {
        assert!(client.send("FOO").await.starts_with("500"));
    }
    let last = client.send("FOO").await;
    assert!(last.starts_with("500"));
    assert!(client.reply().await.starts_with("421 4.7.0"));
    assert!(client.closed().await);
}

#[tokio::test]
async fn test_shutdown_ends_session() {
    let mut harness = start(SmtpServerConfig::default(), "127.0.0.1:40000");
    harness.client.reply().await;
    harness.client.send("EHLO app.local").await;

    harness.shutdown.send(Signal::Shutdown).unwrap();

    assert_eq!(harness.client.reply().await, "421 4.3.2 Service shutting down\r\n");
    assert!(harness.session.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_listener_serves_until_shutdown() {
    let config = SmtpServerConfig {
        listen_address: "127.0.0.1:0".parse().unwrap(),
        ..SmtpServerConfig::default()
    };
    let listener = SmtpListener::bind(config).await.unwrap();
    let address = listener.local_addr().unwrap();
    let recorder = Arc::new(Recorder::default());
    let (shutdown, receiver) = broadcast::channel(4);
    let server = tokio::spawn(listener.serve(Arc::clone(&recorder), receiver));

    let (reader, writer) = TcpStream::connect(address).await.unwrap().into_split();
    let mut client = Client {
        reader: BufReader::new(reader),
        writer,
    };
    assert!(client.reply().await.starts_with("220"));
    client.send("EHLO app.local").await;
    client.send("MAIL FROM:<app@example.com>").await;
    client.send("RCPT TO:<alice@example.org>").await;
    client.send("DATA").await;
    client.write("Subject: over tcp\r\n\r\nbody\r\n").await;
    assert!(client.send(".").await.starts_with("250"));

    shutdown.send(Signal::Shutdown).unwrap();
    assert!(client.reply().await.starts_with("421"));
    assert!(server.await.unwrap().is_ok());

    assert_eq!(recorder.messages.lock().await.len(), 1);
}
