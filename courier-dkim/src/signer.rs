use std::{fmt::Write as _, path::PathBuf};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use courier_common::Message;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    DkimKey, SigningError,
    canonical::{RawHeader, parse_headers, relaxed_body, relaxed_header, split_message},
};

/// DKIM signing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkimConfig {
    /// Signing domain (`d=`)
    ///
    /// When unset, the caller supplies a fallback, usually the domain of the
    /// configured default sender.
    #[serde(default)]
    pub domain: Option<String>,

    /// Selector (`s=`)
    ///
    /// Default: `mail`
    #[serde(default = "default_selector")]
    pub selector: String,

    /// PEM private key
    ///
    /// Default: `keys/{domain}/{selector}.private`
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,

    /// Header fields covered by the signature, in signing order
    #[serde(default = "default_headers")]
    pub headers_to_sign: Vec<String>,

    /// Signature lifetime in seconds; `0` omits `x=`
    #[serde(default)]
    pub signature_expiry_secs: u64,
}

impl Default for DkimConfig {
    fn default() -> Self {
        Self {
            domain: None,
            selector: default_selector(),
            private_key_path: None,
            headers_to_sign: default_headers(),
            signature_expiry_secs: 0,
        }
    }
}

fn default_selector() -> String {
    "mail".to_string()
}

fn default_headers() -> Vec<String> {
    [
        "From",
        "To",
        "Subject",
        "Date",
        "MIME-Version",
        "Content-Type",
        "Content-Transfer-Encoding",
        "Message-ID",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl DkimConfig {
    #[must_use]
    pub fn key_path(&self, domain: &str) -> PathBuf {
        self.private_key_path.clone().unwrap_or_else(|| {
            PathBuf::from("keys")
                .join(domain)
                .join(format!("{}.private", self.selector))
        })
    }
}

/// A message with its signature prepended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedMessage {
    /// The complete `DKIM-Signature: ...` header line, without CRLF
    pub signature: String,
    /// The signature header followed by the rendered message
    pub raw: String,
}

#[derive(Debug)]
pub struct DkimSigner {
    domain: String,
    selector: String,
    headers: Vec<String>,
    expiry_secs: Option<u64>,
    key: DkimKey,
}

impl DkimSigner {
    pub fn new(domain: impl Into<String>, selector: impl Into<String>, key: DkimKey) -> Self {
        Self {
            domain: domain.into().to_ascii_lowercase(),
            selector: selector.into(),
            headers: default_headers(),
            expiry_secs: None,
            key,
        }
    }

    /// Load the key named by `config`.
    ///
    /// # Errors
    /// Fails with [`SigningError::MissingDomain`] when neither the config nor
    /// `fallback_domain` names a domain, or when the key cannot be loaded.
    pub fn from_config(
        config: &DkimConfig,
        fallback_domain: Option<&str>,
    ) -> Result<Self, SigningError> {
        let domain = config
            .domain
            .as_deref()
            .or(fallback_domain)
            .ok_or(SigningError::MissingDomain)?;

        let key = DkimKey::from_file(&config.key_path(domain))?;

        tracing::info!(
            domain,
            selector = %config.selector,
            bits = key.bits(),
            "DKIM signing enabled"
        );

        Ok(Self::new(domain, config.selector.clone(), key)
            .with_headers(&config.headers_to_sign)
            .with_expiry((config.signature_expiry_secs > 0).then_some(config.signature_expiry_secs)))
    }

    #[must_use]
    pub fn with_headers<S: AsRef<str>>(mut self, headers: &[S]) -> Self {
        if !headers.is_empty() {
            self.headers = headers.iter().map(|h| h.as_ref().to_string()).collect();
        }
        self
    }

    #[must_use]
    pub const fn with_expiry(mut self, expiry_secs: Option<u64>) -> Self {
        self.expiry_secs = expiry_secs;
        self
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    #[must_use]
    pub fn selector(&self) -> &str {
        &self.selector
    }

    /// Sign `message`, returning the signature and the signed bytes.
    pub fn sign(&self, message: &Message) -> Result<SignedMessage, SigningError> {
        let rendered = message.render();
        let signature = self.sign_raw(&rendered, message.created_at().timestamp())?;

        tracing::debug!(
            message_id = %message.id(),
            domain = %self.domain,
            selector = %self.selector,
            "DKIM signature added"
        );

        let raw = format!("{signature}\r\n{rendered}");
        Ok(SignedMessage { signature, raw })
    }

    /// Compute the `DKIM-Signature` header for an already rendered message.
    pub fn sign_raw(&self, raw: &str, timestamp: i64) -> Result<String, SigningError> {
        let (header_block, body) = split_message(raw)?;
        let headers = parse_headers(header_block)?;

        let body_hash = STANDARD.encode(Sha256::digest(relaxed_body(body).as_bytes()));
        let (signed_names, canonical_headers) = self.select_headers(&headers);

        let mut value = format!(
            "v=1; a=rsa-sha256; c=relaxed/relaxed; d={}; s={}; t={timestamp};",
            self.domain, self.selector
        );
        if let Some(expiry) = self.expiry_secs {
            let expires = timestamp.saturating_add(i64::try_from(expiry).unwrap_or(i64::MAX));
            let _ = write!(value, " x={expires};");
        }
        let _ = write!(
            value,
            " i=@{}; h={}; bh={body_hash}; b=",
            self.domain,
            signed_names.join(":")
        );

        let signature = self.key.sign(signing_input(&canonical_headers, &value).as_bytes())?;

        Ok(format!("DKIM-Signature: {value}{}", STANDARD.encode(signature)))
    }

    /// Canonical form of each configured header present in the message.
    ///
    /// The last instance wins when a field appears more than once.
    fn select_headers(&self, headers: &[RawHeader]) -> (Vec<String>, String) {
        let mut names = Vec::new();
        let mut canonical = String::new();

        for wanted in &self.headers {
            if let Some(header) = headers
                .iter()
                .rev()
                .find(|h| h.name.eq_ignore_ascii_case(wanted))
            {
                names.push(wanted.to_ascii_lowercase());
                canonical.push_str(&relaxed_header(&header.name, &header.value));
            }
        }

        (names, canonical)
    }
}

/// Signed data: the canonical headers, then the signature header itself with
/// an empty `b=` and no trailing CRLF.
fn signing_input(canonical_headers: &str, unsigned_value: &str) -> String {
    let own = relaxed_header("DKIM-Signature", unsigned_value);
    format!(
        "{canonical_headers}{}",
        own.strip_suffix("\r\n").unwrap_or(&own)
    )
}
