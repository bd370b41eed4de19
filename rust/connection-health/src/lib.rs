//! Connection Health - recurring connection testing for multi-tenant applications
//!
//! Each application may own one cron schedule. When it fires, every active
//! connection of the application is tested concurrently, the individual
//! outcomes are reduced into one run status and the run is recorded.
//!
//! - **Cron parsing**: five-field expressions, names, steps and macros
//! - **Single-flight runs**: a lease on the schedule row keeps one run per
//!   schedule across processes
//! - **Bounded runs**: per-connection timeouts, a worker cap and a run deadline
//! - **Run now**: manual runs share the scheduled execution path
//!
//! # Architecture
//!
//! - [`scheduler`]: cron, aggregation, execution and the trigger loop
//! - [`store`]: schedule persistence (`SQLite` or in memory)
//! - [`api`]: HTTP endpoints
//! - [`config`]: configuration loading and validation
//!
//! # Example
//!
//! ```rust,ignore
//! use connection_health::{config::AppConfig, server::create_app};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load(None)?;
//!     let shutdown = CancellationToken::new();
//!     let app = create_app(config, shutdown.clone()).await?;
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(listener, app.router).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod scheduler;
pub mod server;
pub mod store;

use std::sync::Arc;

use config::AppConfig;
use scheduler::{ScheduleExecutor, ScheduleService};

/// Application state shared across all handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Schedule CRUD.
    pub service: ScheduleService,
    /// Run executor behind "run now".
    pub executor: ScheduleExecutor,
}

impl AppState {
    pub fn new(config: AppConfig, executor: ScheduleExecutor) -> Self {
        Self {
            config: Arc::new(config),
            service: executor.service().clone(),
            executor,
        }
    }
}
