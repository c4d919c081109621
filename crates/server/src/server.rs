//! Server implementation for the admin API.

use actix_web::{web, App, HttpServer};
use quarry_core::{Backend, QuarryError, Result, SharedBackend};

use crate::api::{self, AppState};
use crate::config::ServerConfig;

/// The quarry admin server.
///
/// Serves monitoring and management endpoints over any backend; it
/// never executes jobs itself, so it can run beside or apart from the
/// engines working the same storage.
pub struct Server {
    config: ServerConfig,
    backend: SharedBackend,
}

impl Server {
    /// Create a new server with the given configuration and backend.
    pub fn new(config: ServerConfig, backend: impl Backend + 'static) -> Self {
        Self::with_shared(config, SharedBackend::new(backend))
    }

    /// Create a new server over an already-shared backend.
    pub fn with_shared(config: ServerConfig, backend: SharedBackend) -> Self {
        Self { config, backend }
    }

    /// Run the HTTP API server until it is stopped.
    pub async fn run(self) -> Result<()> {
        let app_state = web::Data::new(AppState {
            backend: self.backend.clone(),
        });

        let server = HttpServer::new(move || {
            App::new()
                .app_data(app_state.clone())
                .configure(api::configure)
        })
        .bind(self.config.api_addr)
        .map_err(|e| {
            QuarryError::Config(format!(
                "Failed to bind to {}: {}",
                self.config.api_addr, e
            ))
        })?
        .run();

        tracing::info!(addr = %self.config.api_addr, "Admin API started");
        server
            .await
            .map_err(|e| QuarryError::Backend(format!("API server error: {}", e)))?;
        tracing::info!("Admin API stopped");
        Ok(())
    }
}
