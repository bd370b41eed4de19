//! Configuration error types with actionable messages.

use std::fmt;

/// Configuration errors, each carrying enough context to fix the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// A value is out of range or malformed.
    Invalid {
        /// Dotted path of the offending key.
        setting: String,
        /// What is wrong.
        message: String,
        /// How to fix it.
        fix_hint: String,
    },
    /// Two settings that contradict each other.
    Incompatible {
        setting1: String,
        setting2: String,
        reason: String,
    },
    /// A required value is empty.
    MissingRequired {
        setting: String,
        context: String,
    },
    /// The same identifier is declared twice.
    Duplicate {
        kind: &'static str,
        id: String,
    },
    /// A connection points at an application that is not declared.
    UnknownReference {
        connection: String,
        application: String,
    },
    /// Multiple errors occurred.
    Multiple(Vec<ConfigurationError>),
}

impl std::error::Error for ConfigurationError {}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid {
                setting,
                message,
                fix_hint,
            } => {
                write!(
                    f,
                    "Invalid configuration for {setting}: {message}\n\nHow to fix: {fix_hint}"
                )
            }
            Self::Incompatible {
                setting1,
                setting2,
                reason,
            } => {
                write!(
                    f,
                    "Incompatible settings: {setting1} conflicts with {setting2}\n\n\
                    Reason: {reason}"
                )
            }
            Self::MissingRequired { setting, context } => {
                write!(
                    f,
                    "Missing required configuration: {setting}\n\nRequired for: {context}"
                )
            }
            Self::Duplicate { kind, id } => {
                write!(f, "Duplicate {kind} id '{id}'\n\nHow to fix: give every {kind} a unique id")
            }
            Self::UnknownReference {
                connection,
                application,
            } => {
                write!(
                    f,
                    "Connection '{connection}' references unknown application '{application}'\n\n\
                    How to fix: declare the application under [[applications]] or correct application_id"
                )
            }
            Self::Multiple(errors) => {
                writeln!(f, "Multiple configuration errors:")?;
                for (i, err) in errors.iter().enumerate() {
                    writeln!(f, "\n{}. {}", i + 1, err)?;
                }
                Ok(())
            }
        }
    }
}

impl ConfigurationError {
    #[must_use]
    pub fn invalid(
        setting: impl Into<String>,
        message: impl Into<String>,
        fix_hint: impl Into<String>,
    ) -> Self {
        Self::Invalid {
            setting: setting.into(),
            message: message.into(),
            fix_hint: fix_hint.into(),
        }
    }

    #[must_use]
    pub fn incompatible(
        setting1: impl Into<String>,
        setting2: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Incompatible {
            setting1: setting1.into(),
            setting2: setting2.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn missing_required(setting: impl Into<String>, context: impl Into<String>) -> Self {
        Self::MissingRequired {
            setting: setting.into(),
            context: context.into(),
        }
    }

    /// Collapse a list of errors: `Ok` when empty, the error itself when
    /// there is one, [`Self::Multiple`] otherwise.
    pub fn collect(mut errors: Vec<Self>) -> ConfigResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple(errors)),
        }
    }

    /// Get the number of errors (1 for single errors, N for multiple).
    #[must_use]
    pub fn count(&self) -> usize {
        match self {
            Self::Multiple(errors) => errors.len(),
            _ => 1,
        }
    }
}

/// Result type for configuration validation.
pub type ConfigResult<T> = Result<T, ConfigurationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_error_display() {
        let err = ConfigurationError::invalid(
            "scheduler.max_concurrent_tests",
            "must be greater than zero",
            "Set scheduler.max_concurrent_tests to at least 1",
        );
        let msg = err.to_string();
        assert!(msg.contains("Invalid configuration for scheduler.max_concurrent_tests"));
        assert!(msg.contains("How to fix"));
    }

    #[test]
    fn test_incompatible_error_display() {
        let err = ConfigurationError::incompatible(
            "scheduler.lease_ttl_secs=60",
            "scheduler.run_timeout_secs=300",
            "A lease shorter than a run lets a second executor start the same schedule",
        );
        let msg = err.to_string();
        assert!(msg.contains("Incompatible"));
        assert!(msg.contains("lease_ttl_secs=60"));
    }

    #[test]
    fn test_unknown_reference_display() {
        let err = ConfigurationError::UnknownReference {
            connection: "db".into(),
            application: "billing".into(),
        };
        assert!(err.to_string().contains("unknown application 'billing'"));
    }

    #[test]
    fn test_collect() {
        assert!(ConfigurationError::collect(Vec::new()).is_ok());

        let single = ConfigurationError::collect(vec![ConfigurationError::missing_required(
            "database.path",
            "Schedule persistence",
        )])
        .unwrap_err();
        assert_eq!(single.count(), 1);
        assert!(single.to_string().contains("database.path"));

        let many = ConfigurationError::collect(vec![
            ConfigurationError::Duplicate { kind: "application", id: "a".into() },
            ConfigurationError::Duplicate { kind: "connection", id: "c".into() },
        ])
        .unwrap_err();
        let msg = many.to_string();
        assert!(msg.contains("Multiple configuration errors"));
        assert!(msg.contains("1."));
        assert!(msg.contains("2."));
        assert_eq!(many.count(), 2);
    }
}
