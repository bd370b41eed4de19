//! Application assembly: store, source, executor, trigger loop and router.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::api;
use crate::config::AppConfig;
use crate::logging::OpTimer;
use crate::scheduler::{
    ScheduleExecutor, ScheduleService, SharedClock, StaticConnectionSource, SystemClock,
    TriggerLoop,
};
use crate::store::{InMemoryScheduleStore, SharedStore, SqliteScheduleStore};
use crate::{AppState, log_banner, log_init_step, log_init_warning, log_success};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Headroom over the run timeout so "run now" requests can finish.
const REQUEST_TIMEOUT_MARGIN: Duration = Duration::from_secs(30);

/// A fully wired application.
#[derive(Debug)]
pub struct Application {
    pub router: Router,
    pub state: AppState,
    /// Trigger loop task; `None` when the scheduler is disabled.
    pub trigger: Option<JoinHandle<()>>,
}

/// Create the application and start the trigger loop.
///
/// The loop stops when `shutdown` is cancelled.
pub async fn create_app(config: AppConfig, shutdown: CancellationToken) -> anyhow::Result<Application> {
    let overall_timer = OpTimer::new("server", "create_app");

    log_banner!(
        format!("connection-health v{VERSION}"),
        format!(
            "tick {}s | run timeout {}s | {} workers",
            config.scheduler.tick_interval_secs,
            config.scheduler.run_timeout_secs,
            config.scheduler.max_concurrent_tests
        )
    );

    // [1/4] Connection catalog
    let step_timer = OpTimer::new("server", "connection_source");
    let source = StaticConnectionSource::from_config(&config.applications, &config.connections)?;
    let active = config.connections.iter().filter(|c| c.active).count();
    log_init_step!(
        1,
        4,
        "Connection source",
        format!(
            "{} applications, {} connections ({} active)",
            config.applications.len(),
            config.connections.len(),
            active
        )
    );
    if config.applications.is_empty() {
        log_init_warning!("No applications configured; every schedule upsert will be rejected");
    }
    step_timer.finish();

    // [2/4] Schedule store
    let step_timer = OpTimer::new("server", "schedule_store");
    let store: SharedStore = if config.database.is_in_memory() {
        log_init_step!(2, 4, "Schedule store", "in memory (schedules are lost on restart)");
        step_timer.finish();
        Arc::new(InMemoryScheduleStore::new())
    } else {
        let store = SqliteScheduleStore::new(config.database.path.clone()).await;
        step_timer.finish_with(&store);
        let store = store?;
        log_init_step!(2, 4, "Schedule store", format!("sqlite at {}", config.database.path));
        Arc::new(store)
    };

    // [3/4] Executor
    let step_timer = OpTimer::new("server", "executor");
    let clock: SharedClock = Arc::new(SystemClock);
    let service = ScheduleService::new(store, Arc::new(source), clock);
    let executor = ScheduleExecutor::new(service, config.scheduler.execution_settings());
    log_init_step!(3, 4, "Executor", format!("lease owner {}", executor.owner()));
    step_timer.finish();

    // [4/4] Trigger loop
    let trigger = if config.scheduler.enabled {
        let handle = TriggerLoop::new(executor.clone(), config.scheduler.tick_interval()).spawn(shutdown);
        log_init_step!(4, 4, "Trigger loop", format!("every {}s", config.scheduler.tick_interval_secs));
        Some(handle)
    } else {
        log_init_step!(4, 4, "Trigger loop", "disabled (manual runs only)");
        None
    };

    let state = AppState::new(config, executor);
    let router = build_router(state.clone());

    overall_timer.finish();
    log_success!("connection-health ready");

    Ok(Application {
        router,
        state,
        trigger,
    })
}

/// Build the HTTP router with middleware.
pub fn build_router(state: AppState) -> Router {
    let request_timeout = state.config.scheduler.run_timeout() + REQUEST_TIMEOUT_MARGIN;

    Router::new()
        .merge(api::create_router())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TimeoutLayer::with_status_code(
            axum::http::StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
