//! Admin API for managing a running courier relay
//!
//! The routes built by [`router`] are mounted on the health server's listener
//! and let an authenticated operator:
//! - Inspect queue depth, provider circuits and the rolling success rate
//! - List dead letters and put them back into the queue
//! - Force a provider circuit open or closed
//!
//! Every request carries a bearer token whose SHA-256 hash is bound to an
//! actor name in [`ControlAuthConfig`]; the actor is recorded in the audit
//! trail of every mutation. [`ControlClient`] is the matching HTTP client.

pub mod auth;
pub mod client;
pub mod error;
pub mod server;

pub use auth::{ControlAuthConfig, TokenBinding, hash_token};
pub use client::ControlClient;
pub use error::{ControlError, Result};
pub use server::router;
