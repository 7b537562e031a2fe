use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("Unable to read DKIM key {path}: {source}")]
    KeyIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid DKIM key material: {0}")]
    InvalidKey(String),

    #[error("DKIM key already exists at {0}")]
    KeyExists(PathBuf),

    #[error("No DKIM signing domain configured")]
    MissingDomain,

    #[error("Header violates folding rules: {0}")]
    MalformedHeader(String),

    #[error("Message has no header/body separator")]
    MissingSeparator,

    #[error("Signature computation failed: {0}")]
    Signature(String),
}
