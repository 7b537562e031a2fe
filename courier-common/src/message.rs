//! Transport-independent representation of an outbound email.
//!
//! A [`NewMessage`] is the raw submission payload; [`Message::new`] validates it
//! into an immutable [`Message`]. Nothing downstream mutates a `Message`: a
//! correction means submitting a new one.
//!
//! [`Message::render`] produces the RFC 5322 form handed to providers and to the
//! DKIM signer. Rendering is a pure function of the message, so the same message
//! always renders to the same bytes.
//!
//! Messages received over SMTP arrive already rendered. [`Message::from_raw`]
//! keeps that content as is, only adding `Date` and `Message-ID` when the
//! client left them out.

use std::{
    fmt::{self, Display, Write as _},
    str::FromStr,
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::{Address, MalformedMessage};

/// Headers the relay always renders itself.
const RESERVED_HEADERS: &[&str] = &[
    "from",
    "to",
    "cc",
    "bcc",
    "subject",
    "date",
    "message-id",
    "mime-version",
    "content-type",
    "content-transfer-encoding",
    "dkim-signature",
];

/// Longest line permitted by RFC 5322 §2.1.1, excluding CRLF.
const MAX_LINE_LENGTH: usize = 998;

/// Encoded line length used for base64 bodies.
const BASE64_LINE_LENGTH: usize = 76;

/// Identifier for a message
///
/// A ULID, so identifiers are unique and sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(ulid::Ulid);

impl MessageId {
    /// Generate a new unique message ID
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new())
    }

    #[must_use]
    pub const fn new(id: ulid::Ulid) -> Self {
        Self(id)
    }

    /// Parse a message ID from a file name like `01ARYZ6S41.bin` or `01ARYZ6S41.eml`
    ///
    /// Anything containing path separators or traversal patterns is rejected.
    #[must_use]
    pub fn from_filename(filename: &str) -> Option<Self> {
        if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
            return None;
        }

        let stem = filename
            .strip_suffix(".bin")
            .or_else(|| filename.strip_suffix(".eml"))?;

        ulid::Ulid::from_string(stem).ok().map(Self)
    }

    /// Milliseconds since the Unix epoch encoded in this ID
    #[must_use]
    pub const fn timestamp_ms(&self) -> u64 {
        self.0.timestamp_ms()
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ulid::Ulid::from_string(s).map(Self)
    }
}

impl Serialize for MessageId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A file attached to a message.
///
/// `content` travels as base64 in every serialized form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

/// A caller-supplied header, kept in submission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Size limits applied during validation
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MessageLimits {
    /// Maximum rendered size in bytes
    ///
    /// Default: 10 MiB
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl Default for MessageLimits {
    fn default() -> Self {
        Self {
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

const fn default_max_message_bytes() -> usize {
    10 * 1024 * 1024
}

/// Submission payload, prior to validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub headers: Vec<Header>,
}

/// A validated, immutable outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    from: Address,
    to: Vec<Address>,
    cc: Vec<Address>,
    bcc: Vec<Address>,
    subject: String,
    text: Option<String>,
    html: Option<String>,
    attachments: Vec<Attachment>,
    headers: Vec<Header>,
    created_at: DateTime<Utc>,
    /// Content received pre-rendered, with CRLF line endings
    #[serde(default)]
    raw: Option<String>,
}

fn parse_addresses(
    field: &'static str,
    inputs: &[String],
) -> Result<Vec<Address>, MalformedMessage> {
    inputs
        .iter()
        .map(|input| {
            Address::parse(input).map_err(|source| MalformedMessage::InvalidAddress { field, source })
        })
        .collect()
}

fn validate_header(header: &Header) -> Result<(), MalformedMessage> {
    let invalid = |reason| MalformedMessage::InvalidHeader {
        name: header.name.clone(),
        reason,
    };

    if header.name.is_empty() {
        return Err(invalid("name is empty"));
    }

    if !header
        .name
        .bytes()
        .all(|b| b.is_ascii_graphic() && b != b':')
    {
        return Err(invalid("name must be printable ASCII without ':'"));
    }

    if RESERVED_HEADERS
        .iter()
        .any(|reserved| header.name.eq_ignore_ascii_case(reserved))
    {
        return Err(invalid("header is generated by the relay"));
    }

    if header.value.contains(['\r', '\n']) {
        return Err(invalid("value must not contain line breaks"));
    }

    if !header.value.is_ascii() {
        return Err(invalid("value must be ASCII"));
    }

    Ok(())
}

fn validate_attachment(attachment: &Attachment) -> Result<(), MalformedMessage> {
    let invalid = |reason| MalformedMessage::InvalidAttachment {
        name: attachment.filename.clone(),
        reason,
    };

    if attachment.filename.trim().is_empty() {
        return Err(invalid("file name is empty"));
    }

    if attachment.filename.contains(['"', '\r', '\n', '\\']) {
        return Err(invalid("file name contains illegal characters"));
    }

    let token = |s: &str| {
        !s.is_empty()
            && s.bytes()
                .all(|b| b.is_ascii_alphanumeric() || b"!#$&-^_.+".contains(&b))
    };

    match attachment.content_type.split_once('/') {
        Some((kind, subtype)) if token(kind) && token(subtype) => Ok(()),
        _ => Err(invalid("content type must be type/subtype")),
    }
}

impl Message {
    /// Validate a submission into a message with a fresh ID and timestamp.
    ///
    /// # Errors
    /// Returns [`MalformedMessage`] when any structural check fails.
    pub fn new(draft: NewMessage, limits: &MessageLimits) -> Result<Self, MalformedMessage> {
        Self::from_parts(draft, limits, MessageId::generate(), Utc::now())
    }

    /// Validate a submission with an explicit identity.
    ///
    /// # Errors
    /// Returns [`MalformedMessage`] when any structural check fails.
    pub fn from_parts(
        draft: NewMessage,
        limits: &MessageLimits,
        id: MessageId,
        created_at: DateTime<Utc>,
    ) -> Result<Self, MalformedMessage> {
        let from = Address::parse(&draft.from).map_err(|source| {
            MalformedMessage::InvalidAddress {
                field: "sender",
                source,
            }
        })?;
        let to = parse_addresses("to", &draft.to)?;
        let cc = parse_addresses("cc", &draft.cc)?;
        let bcc = parse_addresses("bcc", &draft.bcc)?;

        if to.is_empty() && cc.is_empty() && bcc.is_empty() {
            return Err(MalformedMessage::NoRecipients);
        }

        if draft.subject.contains(['\r', '\n']) {
            return Err(MalformedMessage::InvalidSubject);
        }

        if draft.text.is_none() && draft.html.is_none() && draft.attachments.is_empty() {
            return Err(MalformedMessage::EmptyBody);
        }

        draft.headers.iter().try_for_each(validate_header)?;
        draft.attachments.iter().try_for_each(validate_attachment)?;

        let message = Self {
            id,
            from,
            to,
            cc,
            bcc,
            subject: draft.subject,
            text: draft.text,
            html: draft.html,
            attachments: draft.attachments,
            headers: draft.headers,
            created_at: created_at.trunc_subsecs(0),
            raw: None,
        };

        let size = message.render().len();
        if size > limits.max_message_bytes {
            return Err(MalformedMessage::TooLarge {
                size,
                limit: limits.max_message_bytes,
            });
        }

        Ok(message)
    }

    /// Accept pre-rendered content with its envelope.
    ///
    /// Every envelope recipient is held as a `to` recipient, since the
    /// content's own headers decide what readers see.
    ///
    /// # Errors
    /// Returns [`MalformedMessage`] for a bad envelope address, content without
    /// a header section, or content over the size limit.
    pub fn from_raw(
        from: &str,
        recipients: &[String],
        content: &str,
        limits: &MessageLimits,
    ) -> Result<Self, MalformedMessage> {
        let from = Address::parse(from).map_err(|source| MalformedMessage::InvalidAddress {
            field: "sender",
            source,
        })?;
        let to = parse_addresses("to", recipients)?;
        if to.is_empty() {
            return Err(MalformedMessage::NoRecipients);
        }

        let mut content = normalize_line_endings(content);
        if !content.ends_with("\r\n") {
            content.push_str("\r\n");
        }

        let (head, _) = content
            .split_once("\r\n\r\n")
            .ok_or(MalformedMessage::InvalidContent("no blank line after the headers"))?;
        let fields = header_fields(head)?;
        let field = |name: &str| {
            fields
                .iter()
                .find(|(field, _)| field.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.clone())
        };

        let id = MessageId::generate();
        let created_at = Utc::now().trunc_subsecs(0);
        let mut message = Self {
            id,
            from,
            to,
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: field("subject").unwrap_or_default(),
            text: None,
            html: None,
            attachments: Vec::new(),
            headers: Vec::new(),
            created_at,
            raw: None,
        };

        let mut missing = String::new();
        if field("date").is_none() {
            let _ = write!(missing, "Date: {}\r\n", created_at.to_rfc2822());
        }
        if field("message-id").is_none() {
            let _ = write!(missing, "Message-ID: {}\r\n", message.message_id_header());
        }
        content.insert_str(0, &missing);

        if content.len() > limits.max_message_bytes {
            return Err(MalformedMessage::TooLarge {
                size: content.len(),
                limit: limits.max_message_bytes,
            });
        }

        message.raw = Some(content);
        Ok(message)
    }

    #[must_use]
    pub const fn id(&self) -> MessageId {
        self.id
    }

    #[must_use]
    pub const fn from(&self) -> &Address {
        &self.from
    }

    #[must_use]
    pub fn to(&self) -> &[Address] {
        &self.to
    }

    #[must_use]
    pub fn cc(&self) -> &[Address] {
        &self.cc
    }

    #[must_use]
    pub fn bcc(&self) -> &[Address] {
        &self.bcc
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    #[must_use]
    pub fn html(&self) -> Option<&str> {
        self.html.as_deref()
    }

    #[must_use]
    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    #[must_use]
    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Every envelope recipient: to, then cc, then bcc.
    pub fn recipients(&self) -> impl Iterator<Item = &Address> {
        self.to.iter().chain(&self.cc).chain(&self.bcc)
    }

    #[must_use]
    pub fn recipient_count(&self) -> usize {
        self.to.len() + self.cc.len() + self.bcc.len()
    }

    /// The `Message-ID` header value.
    #[must_use]
    pub fn message_id_header(&self) -> String {
        format!("<{}@{}>", self.id, self.from.domain())
    }

    /// Whether the content was received pre-rendered
    #[must_use]
    pub const fn is_raw(&self) -> bool {
        self.raw.is_some()
    }

    /// Render the message as RFC 5322 text with CRLF line endings.
    ///
    /// Bcc recipients are never rendered.
    #[must_use]
    pub fn render(&self) -> String {
        if let Some(raw) = &self.raw {
            return raw.clone();
        }

        let root = self.mime_tree();
        let mut out = String::new();

        let mut header = |name: &str, value: &str| {
            let _ = write!(out, "{name}: {value}\r\n");
        };

        header("From", &self.from.to_string());
        if !self.to.is_empty() {
            header("To", &join(&self.to));
        }
        if !self.cc.is_empty() {
            header("Cc", &join(&self.cc));
        }
        header("Subject", &encode_header_text(&self.subject));
        header("Date", &self.created_at.to_rfc2822());
        header("Message-ID", &self.message_id_header());
        header("MIME-Version", "1.0");
        for custom in &self.headers {
            header(&custom.name, &custom.value);
        }
        for (name, value) in root.headers() {
            header(name, &value);
        }

        out.push_str("\r\n");
        root.write_body(&mut out);
        out
    }

    fn mime_tree(&self) -> Part<'_> {
        let mut bodies = Vec::new();
        if let Some(text) = &self.text {
            bodies.push(Part::Text {
                subtype: "plain",
                content: text,
            });
        }
        if let Some(html) = &self.html {
            bodies.push(Part::Text {
                subtype: "html",
                content: html,
            });
        }

        let body = match bodies.len() {
            0 => None,
            1 => bodies.pop(),
            _ => Some(Part::Multipart {
                subtype: "alternative",
                boundary: format!("=_courier_alt_{}", self.id),
                parts: bodies,
            }),
        };

        if self.attachments.is_empty() {
            // validation guarantees a body when there are no attachments
            return body.unwrap_or(Part::Text {
                subtype: "plain",
                content: "",
            });
        }

        let parts = body
            .into_iter()
            .chain(self.attachments.iter().map(Part::Attachment))
            .collect();

        Part::Multipart {
            subtype: "mixed",
            boundary: format!("=_courier_mixed_{}", self.id),
            parts,
        }
    }
}

/// Unfolded `(name, value)` pairs of a header section.
fn header_fields(head: &str) -> Result<Vec<(String, String)>, MalformedMessage> {
    let mut fields: Vec<(String, String)> = Vec::new();

    for line in head.split("\r\n") {
        if line.starts_with([' ', '\t']) {
            let (_, value) = fields
                .last_mut()
                .ok_or(MalformedMessage::InvalidContent("continuation before any header"))?;
            value.push(' ');
            value.push_str(line.trim());
            continue;
        }

        let (name, value) = line
            .split_once(':')
            .ok_or(MalformedMessage::InvalidContent("header line without a colon"))?;
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(MalformedMessage::InvalidContent("illegal header name"));
        }
        fields.push((name.to_string(), value.trim().to_string()));
    }

    Ok(fields)
}

fn join(addresses: &[Address]) -> String {
    addresses
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// RFC 2047 encoding for non-ASCII header text.
fn encode_header_text(text: &str) -> String {
    if text.is_ascii() {
        text.to_string()
    } else {
        format!("=?UTF-8?B?{}?=", STANDARD.encode(text))
    }
}

fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', "\r\n")
}

fn wrapped_base64(bytes: &[u8]) -> String {
    let encoded = STANDARD.encode(bytes);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / BASE64_LINE_LENGTH * 2);
    for (i, chunk) in encoded.as_bytes().chunks(BASE64_LINE_LENGTH).enumerate() {
        if i > 0 {
            out.push_str("\r\n");
        }
        out.push_str(&String::from_utf8_lossy(chunk));
    }
    out
}

enum Part<'a> {
    Text {
        subtype: &'static str,
        content: &'a str,
    },
    Attachment(&'a Attachment),
    Multipart {
        subtype: &'static str,
        boundary: String,
        parts: Vec<Part<'a>>,
    },
}

impl Part<'_> {
    fn text_is_7bit(content: &str) -> bool {
        content.is_ascii() && content.lines().all(|line| line.len() <= MAX_LINE_LENGTH)
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::Text { subtype, content } => vec![
                ("Content-Type", format!("text/{subtype}; charset=utf-8")),
                (
                    "Content-Transfer-Encoding",
                    if Self::text_is_7bit(content) {
                        "7bit"
                    } else {
                        "base64"
                    }
                    .to_string(),
                ),
            ],
            Self::Attachment(attachment) => vec![
                (
                    "Content-Type",
                    format!(
                        "{}; name=\"{}\"",
                        attachment.content_type,
                        encode_header_text(&attachment.filename)
                    ),
                ),
                ("Content-Transfer-Encoding", "base64".to_string()),
                (
                    "Content-Disposition",
                    format!(
                        "attachment; filename=\"{}\"",
                        encode_header_text(&attachment.filename)
                    ),
                ),
            ],
            Self::Multipart {
                subtype, boundary, ..
            } => vec![
                (
                    "Content-Type",
                    format!("multipart/{subtype}; boundary=\"{boundary}\""),
                ),
                ("Content-Transfer-Encoding", "7bit".to_string()),
            ],
        }
    }

    fn write_body(&self, out: &mut String) {
        match self {
            Self::Text { content, .. } => {
                if Self::text_is_7bit(content) {
                    out.push_str(&normalize_line_endings(content));
                } else {
                    out.push_str(&wrapped_base64(content.as_bytes()));
                }
                if !out.ends_with("\r\n") {
                    out.push_str("\r\n");
                }
            }
            Self::Attachment(attachment) => {
                out.push_str(&wrapped_base64(&attachment.content));
                out.push_str("\r\n");
            }
            Self::Multipart {
                boundary, parts, ..
            } => {
                for part in parts {
                    let _ = write!(out, "--{boundary}\r\n");
                    for (name, value) in part.headers() {
                        let _ = write!(out, "{name}: {value}\r\n");
                    }
                    out.push_str("\r\n");
                    part.write_body(out);
                }
                let _ = write!(out, "--{boundary}--\r\n");
            }
        }
    }
}

/// Render a recipient list for logging: at most three addresses, then a total.
#[must_use]
pub fn summarize_recipients<T: Display>(recipients: &[T]) -> String {
    const SHOWN: usize = 3;

    let shown = recipients
        .iter()
        .take(SHOWN)
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");

    if recipients.len() > SHOWN {
        format!("{shown}, ... ({} total)", recipients.len())
    } else {
        shown
    }
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
