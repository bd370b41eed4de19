//! Connection source consumed by the executor.
//!
//! The scheduler never looks inside a connection: it asks the source for the
//! active connections of an application and calls each one's tester.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::{ApplicationConfig, ConnectionConfig};
use crate::scheduler::probe;

/// What a single connection test reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub is_successful: bool,
    pub message: String,
    pub response_time: Duration,
}

/// Opaque capability that exercises one connection.
///
/// Returning `Err` is treated exactly like an unsuccessful report: the run
/// records `"Test failed: <reason>"` and carries on.
#[async_trait]
pub trait ConnectionTester: Send + Sync + std::fmt::Debug {
    async fn test(&self) -> anyhow::Result<ProbeReport>;
}

/// A connection currently marked active.
#[derive(Clone)]
pub struct ActiveConnection {
    pub id: String,
    pub name: String,
    pub tester: Arc<dyn ConnectionTester>,
}

impl std::fmt::Debug for ActiveConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveConnection")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Failure of the source itself, fatal to the run that hit it.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Application '{0}' not found")]
    ApplicationNotFound(String),

    #[error("Connection source unavailable: {0}")]
    Unavailable(String),
}

/// Provider of the connections belonging to an application.
#[async_trait]
pub trait ConnectionSource: Send + Sync + std::fmt::Debug {
    /// Whether the application is known to the source.
    async fn application_exists(&self, application_id: &str) -> Result<bool, SourceError>;

    /// Connections of `application_id` currently marked active, in a stable order.
    async fn active_connections(
        &self,
        application_id: &str,
    ) -> Result<Vec<ActiveConnection>, SourceError>;
}

/// Shared connection source handle.
pub type SharedSource = Arc<dyn ConnectionSource>;

#[derive(Debug, Clone)]
struct Entry {
    connection: ActiveConnection,
    active: bool,
}

/// Connection source backed by a fixed catalog.
///
/// Built from configuration for the server binary, or programmatically when
/// embedding the scheduler.
#[derive(Debug, Default)]
pub struct StaticConnectionSource {
    applications: RwLock<HashMap<String, Vec<Entry>>>,
}

impl StaticConnectionSource {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the catalog from configured applications and connections.
    pub fn from_config(
        applications: &[ApplicationConfig],
        connections: &[ConnectionConfig],
    ) -> anyhow::Result<Self> {
        let mut catalog: HashMap<String, Vec<Entry>> = applications
            .iter()
            .map(|app| (app.id.clone(), Vec::new()))
            .collect();

        for conn in connections {
            let entries = catalog.get_mut(&conn.application_id).ok_or_else(|| {
                anyhow::anyhow!(
                    "Connection '{}' references unknown application '{}'",
                    conn.id,
                    conn.application_id
                )
            })?;
            entries.push(Entry {
                connection: ActiveConnection {
                    id: conn.id.clone(),
                    name: conn.name.clone(),
                    tester: probe::build(&conn.probe)?,
                },
                active: conn.active,
            });
        }

        Ok(Self {
            applications: RwLock::new(catalog),
        })
    }

    /// Register an application with no connections.
    pub async fn add_application(&self, application_id: impl Into<String>) {
        self.applications
            .write()
            .await
            .entry(application_id.into())
            .or_default();
    }

    /// Register a connection, creating its application if needed.
    pub async fn add_connection(
        &self,
        application_id: impl Into<String>,
        connection: ActiveConnection,
        active: bool,
    ) {
        self.applications
            .write()
            .await
            .entry(application_id.into())
            .or_default()
            .push(Entry { connection, active });
    }

    /// Remove an application and its connections.
    pub async fn remove_application(&self, application_id: &str) -> bool {
        self.applications.write().await.remove(application_id).is_some()
    }
}

#[async_trait]
impl ConnectionSource for StaticConnectionSource {
    async fn application_exists(&self, application_id: &str) -> Result<bool, SourceError> {
        Ok(self.applications.read().await.contains_key(application_id))
    }

    async fn active_connections(
        &self,
        application_id: &str,
    ) -> Result<Vec<ActiveConnection>, SourceError> {
        let applications = self.applications.read().await;
        let entries = applications
            .get(application_id)
            .ok_or_else(|| SourceError::ApplicationNotFound(application_id.to_string()))?;

        Ok(entries
            .iter()
            .filter(|e| e.active)
            .map(|e| e.connection.clone())
            .collect())
    }
}
