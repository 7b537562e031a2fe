//! Health check and metrics endpoints for the courier mail relay
//!
//! # Endpoints
//!
//! - **`/health/live`** - Liveness check: Returns 200 while the process can respond
//! - **`/health/ready`** - Readiness check: Returns 200 while the relay can accept
//!   and deliver mail
//! - **`/metrics`** - Prometheus text exposition of the relay's registry
//!
//! The server also hosts any extra routers handed to it (the submission and
//! admin APIs), so a deployment exposes a single HTTP port.
//!
//! # Usage
//!
//! ```rust,no_run
//! use courier_health::{HealthChecker, HealthConfig, HealthServer};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let checker = Arc::new(HealthChecker::new());
//! let server = HealthServer::builder(HealthConfig::default(), checker)
//!     .bind()
//!     .await?;
//!
//! // server.serve(shutdown_receiver).await?;
//! # Ok(())
//! # }
//! ```

mod checker;
mod config;
mod error;
mod server;

pub use checker::{HealthChecker, HealthStatus};
pub use config::HealthConfig;
pub use error::HealthError;
pub use server::{HealthServer, HealthServerBuilder};
