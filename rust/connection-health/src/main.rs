//! connection-health server entry point.

use std::path::PathBuf;

use clap::Parser;
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;

use connection_health::config::AppConfig;
use connection_health::logging;
use connection_health::server::create_app;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Command-line arguments. Each one overrides the matching config key.
#[derive(Parser, Debug)]
#[command(name = "connection-health")]
#[command(about = "Cron-driven connection health testing")]
#[command(version)]
struct Args {
    /// Config file path.
    #[arg(short, long, env = "CONNECTION_HEALTH_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind to.
    #[arg(long, env = "CONNECTION_HEALTH_HOST")]
    host: Option<String>,

    /// Port to listen on.
    #[arg(short, long, env = "CONNECTION_HEALTH_PORT")]
    port: Option<u16>,

    /// `SQLite` database path, or ":memory:".
    #[arg(long, env = "CONNECTION_HEALTH_DATABASE")]
    database: Option<String>,

    /// Serve the API without running the trigger loop.
    #[arg(long)]
    no_scheduler: bool,
}

impl Args {
    fn apply(self, config: &mut AppConfig) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(database) = self.database {
            config.database.path = database;
        }
        if self.no_scheduler {
            config.scheduler.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    logging::init(&config.logging)?;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let shutdown = CancellationToken::new();
    let app = create_app(config, shutdown.clone()).await?;

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    axum::serve(listener, app.router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    if let Some(trigger) = app.trigger {
        trigger.await?;
    }

    tracing::info!("Server shut down gracefully");
    Ok(())
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
