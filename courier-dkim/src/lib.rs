//! DKIM signing for outbound mail.
//!
//! [`DkimSigner`] owns the private key and produces a `DKIM-Signature` header
//! for a rendered [`courier_common::Message`]. Signatures use `rsa-sha256` with
//! `relaxed/relaxed` canonicalization and take `t=` from the message creation
//! time, so signing the same message twice yields the same header.

pub mod canonical;
pub mod error;
pub mod key;
pub mod signer;

pub use error::SigningError;
pub use key::{DkimKey, GeneratedKey, generate_key};
pub use signer::{DkimConfig, DkimSigner, SignedMessage};
