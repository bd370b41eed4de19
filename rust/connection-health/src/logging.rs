//! Tracing setup and startup logging helpers.

use std::time::{Duration, Instant};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level. Fails if a subscriber is
/// already installed.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))?;

    let registry = tracing_subscriber::registry().with(filter);
    if config.is_json() {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }
    Ok(())
}

/// Measures one startup or maintenance step and logs its duration.
///
/// ```rust,ignore
/// let timer = OpTimer::new("store", "migrate");
/// let store = SqliteScheduleStore::new(path).await;
/// timer.finish_with(&store);
/// ```
#[derive(Debug)]
pub struct OpTimer {
    component: &'static str,
    operation: &'static str,
    start: Instant,
}

impl OpTimer {
    #[must_use]
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        tracing::debug!(component, operation, "Operation started");
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }

    /// Log completion and return the elapsed time.
    pub fn finish(self) -> Duration {
        let elapsed = self.start.elapsed();
        tracing::info!(
            component = self.component,
            operation = self.operation,
            duration_ms = millis(elapsed),
            "Operation completed"
        );
        elapsed
    }

    /// Log success or failure of `result`.
    pub fn finish_with<T, E: std::fmt::Display>(self, result: &Result<T, E>) -> Duration {
        let elapsed = self.start.elapsed();
        match result {
            Ok(_) => tracing::info!(
                component = self.component,
                operation = self.operation,
                duration_ms = millis(elapsed),
                "Operation completed"
            ),
            Err(e) => tracing::error!(
                component = self.component,
                operation = self.operation,
                duration_ms = millis(elapsed),
                error = %e,
                "Operation failed"
            ),
        }
        elapsed
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Log a numbered startup step.
///
/// ```rust,ignore
/// log_init_step!(2, 4, "Schedule store", "sqlite at connection-health.db");
/// ```
#[macro_export]
macro_rules! log_init_step {
    ($step:expr, $total:expr, $name:expr, $detail:expr) => {
        tracing::info!(step = $step, total = $total, "[{}/{}] {}: {}", $step, $total, $name, $detail);
    };
    ($step:expr, $total:expr, $name:expr) => {
        tracing::info!(step = $step, total = $total, "[{}/{}] {}", $step, $total, $name);
    };
}

/// Log a non-fatal startup problem.
#[macro_export]
macro_rules! log_init_warning {
    ($($arg:tt)*) => {
        tracing::warn!("⚠️  {}", format_args!($($arg)*));
    };
}

/// Log the end of a major phase.
#[macro_export]
macro_rules! log_success {
    ($($arg:tt)*) => {
        tracing::info!("✅ {}", format_args!($($arg)*));
    };
}

/// Log a framed banner line, optionally with a subtitle.
#[macro_export]
macro_rules! log_banner {
    ($title:expr) => {
        tracing::info!("══════════════════════════════════════════");
        tracing::info!("  {}", $title);
        tracing::info!("══════════════════════════════════════════");
    };
    ($title:expr, $subtitle:expr) => {
        tracing::info!("══════════════════════════════════════════");
        tracing::info!("  {}", $title);
        tracing::info!("  {}", $subtitle);
        tracing::info!("══════════════════════════════════════════");
    };
}
