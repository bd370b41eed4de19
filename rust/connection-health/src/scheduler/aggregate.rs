//! Reduction of per-connection outcomes into one run status.
//!
//! Everything here is pure: no I/O, no clock access.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Message recorded when an application has nothing to test.
pub const NO_CONNECTIONS_MESSAGE: &str = "No active database connections found";

/// Aggregated classification of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every connection test succeeded.
    Success,
    /// Some connection tests succeeded and some failed.
    Partial,
    /// Every connection test failed.
    Failed,
    /// There were no active connections to test.
    Skipped,
    /// The run aborted before testing connections.
    Error,
}

impl RunStatus {
    /// Convert status to string for database storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Error => "error",
        }
    }

    /// Parse status from database string.
    #[allow(clippy::should_implement_trait, reason = "Different signature than std::str::FromStr")]
    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "success" => Ok(Self::Success),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "error" => Ok(Self::Error),
            _ => anyhow::bail!("Invalid run status: {s}"),
        }
    }

    /// Classify a completed run from its counts.
    #[must_use]
    pub const fn classify(success_count: usize, failure_count: usize) -> Self {
        match (success_count, failure_count) {
            (0, 0) => Self::Skipped,
            (_, 0) => Self::Success,
            (0, _) => Self::Failed,
            _ => Self::Partial,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of testing one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOutcome {
    pub connection_id: String,
    pub connection_name: String,
    pub is_successful: bool,
    pub message: String,
    #[serde(rename = "response_time_ms", with = "duration_ms")]
    pub response_time: Duration,
}

impl ConnectionOutcome {
    /// Outcome for a test that raised, timed out or was cancelled.
    pub fn failure(
        connection_id: impl Into<String>,
        connection_name: impl Into<String>,
        message: impl Into<String>,
        response_time: Duration,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            connection_name: connection_name.into(),
            is_successful: false,
            message: message.into(),
            response_time,
        }
    }
}

/// Aggregated result of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub message: String,
    pub success_count: usize,
    pub failure_count: usize,
    pub total_connections: usize,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
    /// Per-connection results in connection enumeration order.
    pub outcomes: Vec<ConnectionOutcome>,
}

impl RunOutcome {
    /// Outcome of a run that aborted before the connection loop.
    pub fn error(message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            status: RunStatus::Error,
            message: message.into(),
            success_count: 0,
            failure_count: 0,
            total_connections: 0,
            duration: elapsed,
            outcomes: Vec::new(),
        }
    }
}

/// Reduce per-connection outcomes into one [`RunOutcome`].
///
/// `label` names the kind of run (for example `"Scheduled test"`) and
/// prefixes the summary message.
pub fn aggregate(outcomes: Vec<ConnectionOutcome>, elapsed: Duration, label: &str) -> RunOutcome {
    if outcomes.is_empty() {
        return RunOutcome {
            status: RunStatus::Skipped,
            message: NO_CONNECTIONS_MESSAGE.to_string(),
            success_count: 0,
            failure_count: 0,
            total_connections: 0,
            duration: elapsed,
            outcomes,
        };
    }

    let total = outcomes.len();
    let success_count = outcomes.iter().filter(|o| o.is_successful).count();
    let failure_count = total - success_count;

    RunOutcome {
        status: RunStatus::classify(success_count, failure_count),
        message: format!(
            "{label}: {success_count} successful, {failure_count} failed out of {total} connections"
        ),
        success_count,
        failure_count,
        total_connections: total,
        duration: elapsed,
        outcomes,
    }
}

/// Serde helper storing a [`Duration`] as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn outcome(id: &str, ok: bool) -> ConnectionOutcome {
        ConnectionOutcome {
            connection_id: id.to_string(),
            connection_name: format!("conn {id}"),
            is_successful: ok,
            message: if ok { "Connected".into() } else { "Test failed: refused".into() },
            response_time: Duration::from_millis(12),
        }
    }

    #[test]
    fn test_empty_is_skipped() {
        let result = aggregate(Vec::new(), Duration::from_millis(3), "Scheduled test");
        assert_eq!(result.status, RunStatus::Skipped);
        assert_eq!(result.success_count, 0);
        assert_eq!(result.failure_count, 0);
        assert_eq!(result.message, NO_CONNECTIONS_MESSAGE);
        assert_eq!(result.duration, Duration::from_millis(3));
    }

    #[test]
    fn test_all_success() {
        let result = aggregate(
            vec![outcome("a", true), outcome("b", true)],
            Duration::from_secs(1),
            "Manual test",
        );
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(
            result.message,
            "Manual test: 2 successful, 0 failed out of 2 connections"
        );
    }

    #[test]
    fn test_all_failed() {
        let result = aggregate(
            vec![outcome("a", false), outcome("b", false)],
            Duration::ZERO,
            "Scheduled test",
        );
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.failure_count, 2);
    }

    #[test]
    fn test_mixed_is_partial_and_keeps_order() {
        let result = aggregate(
            vec![outcome("a", true), outcome("b", false), outcome("c", true)],
            Duration::from_millis(250),
            "Scheduled test",
        );
        assert_eq!(result.status, RunStatus::Partial);
        assert_eq!(result.success_count, 2);
        assert_eq!(result.failure_count, 1);
        assert_eq!(result.total_connections, 3);
        let ids: Vec<_> = result.outcomes.iter().map(|o| o.connection_id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn test_error_outcome() {
        let result = RunOutcome::error("Failed to load connections: gone", Duration::from_millis(5));
        assert_eq!(result.status, RunStatus::Error);
        assert_eq!(result.total_connections, 0);
    }

    #[test]
    fn test_status_round_trip_names() {
        for status in [
            RunStatus::Success,
            RunStatus::Partial,
            RunStatus::Failed,
            RunStatus::Skipped,
            RunStatus::Error,
        ] {
            assert_eq!(RunStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(RunStatus::from_str("running").is_err());
    }

    #[test]
    fn test_serializes_durations_as_millis() {
        let result = aggregate(vec![outcome("a", true)], Duration::from_millis(1500), "Manual test");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["duration_ms"], 1500);
        assert_eq!(json["outcomes"][0]["response_time_ms"], 12);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_counts_sum_to_input(results in proptest::collection::vec(any::<bool>(), 0..40)) {
            let outcomes: Vec<_> = results
                .iter()
                .enumerate()
                .map(|(i, ok)| outcome(&i.to_string(), *ok))
                .collect();
            let result = aggregate(outcomes, Duration::ZERO, "Scheduled test");

            prop_assert_eq!(result.success_count + result.failure_count, results.len());
            prop_assert_eq!(result.total_connections, results.len());
            let expected = match (result.success_count, result.failure_count) {
                (0, 0) => RunStatus::Skipped,
                (_, 0) => RunStatus::Success,
                (0, _) => RunStatus::Failed,
                _ => RunStatus::Partial,
            };
            prop_assert_eq!(result.status, expected);
        }
    }
}
