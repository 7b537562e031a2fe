//! The courier mail relay: configuration, wiring and the submission API.
//!
//! [`controller::Courier`] is the top-level configuration document. Running
//! it starts the delivery workers, the HTTP server (health, metrics,
//! submission and admin routes), the SMTP submission listener, and waits for
//! Ctrl-C or SIGTERM before shutting everything down in order.

pub mod config;
pub mod controller;
pub mod readiness;
pub mod smtp;
pub mod submission;
