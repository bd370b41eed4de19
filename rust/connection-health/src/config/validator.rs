//! Startup validation of the loaded configuration.
//!
//! Every rule runs, and all problems are reported together so one edit of
//! the file can fix them.

use std::collections::HashSet;
use std::time::Duration;

use super::error::{ConfigResult, ConfigurationError};
use super::{AppConfig, ConnectionConfig, LoggingConfig, ProbeConfig, SchedulerConfig};

/// Configuration validator.
///
/// | Rule | Setting |
/// |------|---------|
/// | non-zero | tick interval, timeouts, worker count, persist attempts |
/// | per-connection timeout <= run timeout | `scheduler.*` |
/// | lease TTL > run timeout + persistence budget | `scheduler.*` |
/// | unique ids | applications, connections |
/// | known application | `connections[].application_id` |
/// | parsable target | `connections[].probe` |
/// | known format | `logging.format` |
#[derive(Debug)]
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire application configuration.
    pub fn validate(config: &AppConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if config.database.path.trim().is_empty() {
            errors.push(ConfigurationError::missing_required(
                "database.path",
                "Schedule persistence (use \":memory:\" for a throwaway store)",
            ));
        }

        for result in [
            Self::validate_scheduler(&config.scheduler),
            Self::validate_logging(&config.logging),
            Self::validate_catalog(config),
        ] {
            match result {
                Ok(()) => {}
                Err(ConfigurationError::Multiple(errs)) => errors.extend(errs),
                Err(e) => errors.push(e),
            }
        }

        ConfigurationError::collect(errors)
    }

    /// Validate timing and concurrency settings.
    pub fn validate_scheduler(config: &SchedulerConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();

        let positive = [
            ("scheduler.tick_interval_secs", config.tick_interval_secs),
            ("scheduler.per_connection_timeout_ms", config.per_connection_timeout_ms),
            ("scheduler.run_timeout_secs", config.run_timeout_secs),
            ("scheduler.lease_ttl_secs", config.lease_ttl_secs),
            ("scheduler.max_concurrent_tests", u64::try_from(config.max_concurrent_tests).unwrap_or(u64::MAX)),
            ("scheduler.persist_max_attempts", u64::from(config.persist_max_attempts)),
        ];
        for (setting, value) in positive {
            if value == 0 {
                errors.push(ConfigurationError::invalid(
                    setting,
                    "must be greater than zero",
                    format!("Set {setting} to a positive value"),
                ));
            }
        }

        if config.run_timeout_secs > 0
            && config.per_connection_timeout_ms > config.run_timeout_secs.saturating_mul(1000)
        {
            errors.push(ConfigurationError::incompatible(
                format!("scheduler.per_connection_timeout_ms={}", config.per_connection_timeout_ms),
                format!("scheduler.run_timeout_secs={}", config.run_timeout_secs),
                "A single connection test may not outlive the whole run. \
                Lower the per-connection timeout or raise the run timeout.",
            ));
        }

        let lease_ttl = Duration::from_secs(config.lease_ttl_secs);
        let run_budget = config.run_timeout() + config.persist_budget();
        if config.lease_ttl_secs > 0 && lease_ttl <= run_budget {
            errors.push(ConfigurationError::incompatible(
                format!("scheduler.lease_ttl_secs={}", config.lease_ttl_secs),
                format!(
                    "scheduler.run_timeout_secs={} plus {}ms to persist the result",
                    config.run_timeout_secs,
                    config.persist_budget().as_millis()
                ),
                format!(
                    "The run lease would expire while the run is still in progress or \
                    its result is being written, letting another executor start the same \
                    schedule. Set lease_ttl_secs above {}.",
                    run_budget.as_secs()
                ),
            ));
        }

        ConfigurationError::collect(errors)
    }

    /// Validate the logging section.
    pub fn validate_logging(config: &LoggingConfig) -> ConfigResult<()> {
        let format = config.format.to_ascii_lowercase();
        if format == "pretty" || format == "json" {
            Ok(())
        } else {
            Err(ConfigurationError::invalid(
                "logging.format",
                format!("unknown format '{}'", config.format),
                "Set logging.format to \"pretty\" or \"json\"",
            ))
        }
    }

    /// Validate applications and connections.
    pub fn validate_catalog(config: &AppConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut applications = HashSet::new();

        for (i, app) in config.applications.iter().enumerate() {
            if app.id.trim().is_empty() {
                errors.push(ConfigurationError::missing_required(
                    format!("applications[{i}].id"),
                    "Identifying the application that owns a schedule",
                ));
            } else if !applications.insert(app.id.as_str()) {
                errors.push(ConfigurationError::Duplicate {
                    kind: "application",
                    id: app.id.clone(),
                });
            }
        }

        let mut connections = HashSet::new();
        for (i, conn) in config.connections.iter().enumerate() {
            if conn.id.trim().is_empty() {
                errors.push(ConfigurationError::missing_required(
                    format!("connections[{i}].id"),
                    "Reporting per-connection outcomes",
                ));
            } else if !connections.insert(conn.id.as_str()) {
                errors.push(ConfigurationError::Duplicate {
                    kind: "connection",
                    id: conn.id.clone(),
                });
            }

            if !applications.contains(conn.application_id.as_str()) {
                errors.push(ConfigurationError::UnknownReference {
                    connection: conn.id.clone(),
                    application: conn.application_id.clone(),
                });
            }

            if let Err(e) = Self::validate_probe(i, conn) {
                errors.push(e);
            }
        }

        ConfigurationError::collect(errors)
    }

    fn validate_probe(index: usize, conn: &ConnectionConfig) -> ConfigResult<()> {
        match &conn.probe {
            ProbeConfig::Tcp { address } => {
                let valid = address
                    .rsplit_once(':')
                    .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
                if valid {
                    Ok(())
                } else {
                    Err(ConfigurationError::invalid(
                        format!("connections[{index}].probe.address"),
                        format!("'{address}' is not a host:port pair"),
                        "Use an address such as \"db.internal:5432\"",
                    ))
                }
            }
            ProbeConfig::Http { url, expect_status } => {
                let scheme_ok = url::Url::parse(url)
                    .is_ok_and(|u| matches!(u.scheme(), "http" | "https"));
                if !scheme_ok {
                    return Err(ConfigurationError::invalid(
                        format!("connections[{index}].probe.url"),
                        format!("'{url}' is not an http(s) URL"),
                        "Use an absolute URL such as \"https://api.internal/health\"",
                    ));
                }
                match expect_status {
                    Some(status) if !(100..=599).contains(status) => {
                        Err(ConfigurationError::invalid(
                            format!("connections[{index}].probe.expect_status"),
                            format!("{status} is not an HTTP status code"),
                            "Use a status between 100 and 599 or omit it to accept any 2xx",
                        ))
                    }
                    _ => Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApplicationConfig;

    fn app(id: &str) -> ApplicationConfig {
        ApplicationConfig {
            id: id.into(),
            name: id.to_uppercase(),
        }
    }

    fn tcp(id: &str, application_id: &str, address: &str) -> ConnectionConfig {
        ConnectionConfig {
            id: id.into(),
            application_id: application_id.into(),
            name: id.into(),
            active: true,
            probe: ProbeConfig::Tcp {
                address: address.into(),
            },
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(ConfigValidator::validate(&AppConfig::default()).is_ok());
    }

    #[test]
    fn test_zero_values_rejected() {
        let config = SchedulerConfig {
            tick_interval_secs: 0,
            max_concurrent_tests: 0,
            ..SchedulerConfig::default()
        };
        let err = ConfigValidator::validate_scheduler(&config).unwrap_err();
        assert_eq!(err.count(), 2);
    }

    #[test]
    fn test_timeouts_must_nest() {
        let config = SchedulerConfig {
            per_connection_timeout_ms: 20_000,
            run_timeout_secs: 10,
            lease_ttl_secs: 5,
            ..SchedulerConfig::default()
        };
        let err = ConfigValidator::validate_scheduler(&config).unwrap_err();
        assert_eq!(err.count(), 2);
        let msg = err.to_string();
        assert!(msg.contains("per_connection_timeout_ms=20000"));
        assert!(msg.contains("lease_ttl_secs=5"));
    }

    #[test]
    fn test_lease_must_cover_run_and_persistence() {
        // 300s run + 3 attempts * 5s busy timeout + (1 + 2) * 500ms backoff.
        let config = SchedulerConfig::default();
        assert_eq!(config.persist_budget(), Duration::from_millis(16_500));

        let equal = SchedulerConfig {
            lease_ttl_secs: 300,
            ..SchedulerConfig::default()
        };
        let err = ConfigValidator::validate_scheduler(&equal).unwrap_err();
        assert!(err.to_string().contains("lease_ttl_secs=300"));

        let short = SchedulerConfig {
            lease_ttl_secs: 316,
            ..SchedulerConfig::default()
        };
        assert!(ConfigValidator::validate_scheduler(&short).is_err());

        let enough = SchedulerConfig {
            lease_ttl_secs: 317,
            ..SchedulerConfig::default()
        };
        assert!(ConfigValidator::validate_scheduler(&enough).is_ok());
    }

    #[test]
    fn test_unknown_log_format() {
        let logging = LoggingConfig {
            format: "xml".into(),
            ..LoggingConfig::default()
        };
        assert!(ConfigValidator::validate_logging(&logging).is_err());
        let logging = LoggingConfig {
            format: "JSON".into(),
            ..LoggingConfig::default()
        };
        assert!(ConfigValidator::validate_logging(&logging).is_ok());
    }

    #[test]
    fn test_catalog_errors_are_reported_together() {
        let mut http = tcp("api", "billing", "");
        http.probe = ProbeConfig::Http {
            url: "ftp://files.internal".into(),
            expect_status: None,
        };
        let config = AppConfig {
            applications: vec![app("billing"), app("billing")],
            connections: vec![
                tcp("db", "billing", "db.internal:5432"),
                tcp("db", "billing", "db.internal"),
                tcp("cache", "search", "cache:6379"),
                http,
            ],
            ..AppConfig::default()
        };

        let err = ConfigValidator::validate(&config).unwrap_err();
        assert_eq!(err.count(), 5);
        let msg = err.to_string();
        assert!(msg.contains("Duplicate application id 'billing'"));
        assert!(msg.contains("Duplicate connection id 'db'"));
        assert!(msg.contains("not a host:port pair"));
        assert!(msg.contains("unknown application 'search'"));
        assert!(msg.contains("not an http(s) URL"));
    }

    #[test]
    fn test_valid_catalog() {
        let config = AppConfig {
            applications: vec![app("billing")],
            connections: vec![
                tcp("db", "billing", "db.internal:5432"),
                ConnectionConfig {
                    probe: ProbeConfig::Http {
                        url: "https://billing.internal/health".into(),
                        expect_status: Some(200),
                    },
                    ..tcp("api", "billing", "")
                },
            ],
            ..AppConfig::default()
        };
        assert!(ConfigValidator::validate(&config).is_ok());
    }
}
