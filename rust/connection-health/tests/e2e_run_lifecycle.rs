//! End-to-end: configured TCP probes, `SQLite` persistence, served over HTTP.

use std::future::IntoFuture;

use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use connection_health::config::{AppConfig, ApplicationConfig, ConnectionConfig, ProbeConfig};
use connection_health::scheduler::RunStatus;
use connection_health::server::create_app;
use connection_health::store::{ScheduleStore, SqliteScheduleStore};

/// Address that accepts connections for the lifetime of the test.
async fn listening_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            if listener.accept().await.is_err() {
                break;
            }
        }
    });
    addr
}

/// Address nothing listens on.
async fn closed_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

fn tcp(id: &str, address: String, active: bool) -> ConnectionConfig {
    ConnectionConfig {
        id: id.into(),
        application_id: "billing".into(),
        name: id.into(),
        active,
        probe: ProbeConfig::Tcp { address },
    }
}

#[tokio::test]
async fn test_manual_run_over_http_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("health.db");

    let mut config = AppConfig::default();
    config.database.path = db_path.to_string_lossy().into_owned();
    config.scheduler.enabled = false;
    config.scheduler.per_connection_timeout_ms = 2_000;
    config.applications = vec![ApplicationConfig {
        id: "billing".into(),
        name: "Billing".into(),
    }];
    config.connections = vec![
        tcp("primary", listening_address().await, true),
        tcp("replica", closed_address().await, true),
        tcp("archive", closed_address().await, false),
    ];

    let shutdown = CancellationToken::new();
    let app = create_app(config, shutdown.clone()).await.unwrap();
    assert!(app.trigger.is_none());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let server = tokio::spawn(
        axum::serve(listener, app.router)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .into_future(),
    );

    let client = reqwest::Client::new();
    let schedule: Value = client
        .put(format!("{base}/api/v1/applications/billing/schedule"))
        .json(&json!({ "cron_expression": "*/15 * * * *", "is_enabled": true }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = schedule["id"].as_str().unwrap().to_string();

    let report: Value = client
        .post(format!("{base}/api/v1/schedules/{id}/run"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(report["status"], "partial");
    assert_eq!(report["total_connections"], 2);
    assert_eq!(report["outcomes"][0]["is_successful"], true);
    assert_eq!(report["outcomes"][1]["is_successful"], false);

    drop(client);
    shutdown.cancel();
    server.await.unwrap().unwrap();

    // Reopen the database: the run survived the process.
    let store = SqliteScheduleStore::new(&db_path).await.unwrap();
    let stored = store.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.last_run_status, Some(RunStatus::Partial));
    assert!(stored.lease_owner.is_none());
    assert!(stored.next_run_time.is_some());
    assert_eq!(store.list_runs(&id, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_trigger_loop_stops_on_shutdown() {
    let mut config = AppConfig::default();
    config.database.path = ":memory:".into();
    config.scheduler.tick_interval_secs = 1;

    let shutdown = CancellationToken::new();
    let app = create_app(config, shutdown.clone()).await.unwrap();
    let trigger = app.trigger.unwrap();

    shutdown.cancel();
    tokio::time::timeout(std::time::Duration::from_secs(5), trigger)
        .await
        .unwrap()
        .unwrap();
}
