//! # quarry-server - HTTP admin API
//!
//! This crate provides an HTTP API for monitoring and managing a
//! quarry job backend:
//!   - Health check (`GET /health`)
//!   - Job statistics (`GET /api/stats`)
//!   - List jobs (`GET /api/jobs`), fetch one (`GET /api/jobs/{id}`)
//!   - Cancel a job (`POST /api/jobs/{id}/cancel`)
//!   - List queues (`GET /api/queues`)
//!   - Pause/resume a queue (`POST /api/queues/{name}/pause|resume`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use quarry_server::{Server, ServerConfig};
//! use quarry_sqlite::SqliteBackend;
//!
//! #[tokio::main]
//! async fn main() -> quarry_core::Result<()> {
//!     let backend = SqliteBackend::new("sqlite:jobs.db", "myapp").await?;
//!
//!     let config = ServerConfig::builder()
//!         .api_addr_str("0.0.0.0:8080")?
//!         .build();
//!
//!     Server::new(config, backend).run().await
//! }
//! ```

mod api;
mod config;
mod server;

pub use config::{ServerConfig, ServerConfigBuilder};
pub use server::Server;
