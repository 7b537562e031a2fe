//! SMTP for the relay, in both directions.
//!
//! [`client`] is used by the SMTP providers: plain TCP, implicit TLS (SMTPS)
//! and STARTTLS upgrades, AUTH PLAIN, and dot-stuffed DATA transmission.
//! Timeouts are applied by the caller.
//!
//! [`server`] is the submission listener local applications hand mail to.

pub mod client;
pub mod server;

pub use client::{ClientError, Response, ResponseLine, SmtpClient};
pub use server::{
    ReceivedMessage, Rejection, SmtpListener, SmtpServerConfig, SmtpServerTimeouts, SubmissionHandler,
};
