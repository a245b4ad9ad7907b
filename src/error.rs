//! Error taxonomy for the harness
//!
//! Two typed error enums cover the failures a caller needs to tell apart:
//!
//! - [`MigrationError`]: everything the migration engine can reject (drift, ordering,
//!   failing statements, unreadable scripts).
//! - [`HarnessError`]: what `TestRegistryServer::start` surfaces. Setup, migration and
//!   startup-timeout failures are all fatal; teardown failures never show up here.

use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Migration Errors
// =============================================================================

/// Errors raised while loading, validating or applying migration scripts
#[derive(Debug)]
pub enum MigrationError {
    /// A file carries the script prefix and suffix but no parseable version
    InvalidFileName { file: String },

    /// Two scripts resolve to the same version
    DuplicateVersion {
        version: String,
        first: String,
        second: String,
    },

    /// A pending script is older than the newest applied one
    OutOfOrder { version: String, applied: String },

    /// An applied script changed on disk since it was recorded
    ChecksumMismatch {
        version: String,
        recorded: String,
        actual: String,
    },

    /// The ledger records a version that no longer exists on disk
    MissingScript { version: String },

    /// The ledger carries a failed entry for this version
    FailedMigration { version: String },

    /// A statement inside a script failed; nothing of the script was kept
    StatementFailed {
        version: String,
        statement: String,
        message: String,
    },

    /// Reading the script directory or a script failed
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Ledger bookkeeping failed
    Database(rusqlite::Error),
}

impl MigrationError {
    /// Version the error is attributed to, if any
    pub fn version(&self) -> Option<&str> {
        match self {
            MigrationError::DuplicateVersion { version, .. }
            | MigrationError::OutOfOrder { version, .. }
            | MigrationError::ChecksumMismatch { version, .. }
            | MigrationError::MissingScript { version }
            | MigrationError::FailedMigration { version }
            | MigrationError::StatementFailed { version, .. } => Some(version),
            MigrationError::InvalidFileName { .. }
            | MigrationError::Io { .. }
            | MigrationError::Database(_) => None,
        }
    }
}

impl std::fmt::Display for MigrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationError::InvalidFileName { file } => {
                write!(f, "Invalid migration file name '{}'", file)
            }
            MigrationError::DuplicateVersion {
                version,
                first,
                second,
            } => write!(
                f,
                "Found more than one migration with version {} ('{}' and '{}')",
                version, first, second
            ),
            MigrationError::OutOfOrder { version, applied } => write!(
                f,
                "Detected resolved migration not applied to database: {} (newest applied is {})",
                version, applied
            ),
            MigrationError::ChecksumMismatch {
                version,
                recorded,
                actual,
            } => write!(
                f,
                "Migration checksum mismatch for version {}: applied to database = {}, resolved locally = {}",
                version, recorded, actual
            ),
            MigrationError::MissingScript { version } => write!(
                f,
                "Detected applied migration not resolved locally: {}",
                version
            ),
            MigrationError::FailedMigration { version } => {
                write!(f, "Detected failed migration to version {}", version)
            }
            MigrationError::StatementFailed {
                version,
                statement,
                message,
            } => write!(
                f,
                "Migration {} failed: {}\nStatement: {}",
                version, message, statement
            ),
            MigrationError::Io { path, source } => {
                write!(f, "Failed to read {}: {}", path.display(), source)
            }
            MigrationError::Database(e) => write!(f, "Migration ledger error: {}", e),
        }
    }
}

impl std::error::Error for MigrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MigrationError::Io { source, .. } => Some(source),
            MigrationError::Database(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for MigrationError {
    fn from(err: rusqlite::Error) -> Self {
        MigrationError::Database(err)
    }
}

// =============================================================================
// Harness Errors
// =============================================================================

/// Fatal failures surfaced by the orchestrator
#[derive(Debug)]
pub enum HarnessError {
    /// Bootstrap directory, integration artifacts, port bind, database start, ...
    Setup(String),

    /// Schema migration failed
    Migration(MigrationError),

    /// The dependent service did not report readiness within the bound
    StartupTimeout(Duration),

    /// The dependent service reported a startup failure
    ServiceFailed(String),
}

impl HarnessError {
    /// Create a setup error
    pub fn setup(message: impl Into<String>) -> Self {
        HarnessError::Setup(message.into())
    }

    pub fn is_setup(&self) -> bool {
        matches!(self, HarnessError::Setup(_))
    }

    pub fn is_migration(&self) -> bool {
        matches!(self, HarnessError::Migration(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, HarnessError::StartupTimeout(_))
    }
}

impl std::fmt::Display for HarnessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HarnessError::Setup(message) => write!(f, "Setup failed: {}", message),
            HarnessError::Migration(e) => write!(f, "{}", e),
            HarnessError::StartupTimeout(bound) => write!(
                f,
                "Registry did not start within {} seconds",
                bound.as_secs_f64()
            ),
            HarnessError::ServiceFailed(message) => {
                write!(f, "Registry failed to start: {}", message)
            }
        }
    }
}

impl std::error::Error for HarnessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HarnessError::Migration(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MigrationError> for HarnessError {
    fn from(err: MigrationError) -> Self {
        HarnessError::Migration(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_failure_names_version_and_statement() {
        let err = MigrationError::StatementFailed {
            version: "002".to_string(),
            statement: "CREATE TABLE broken (".to_string(),
            message: "incomplete input".to_string(),
        };
        assert_eq!(err.version(), Some("002"));

        let text = err.to_string();
        assert!(text.contains("002"));
        assert!(text.contains("CREATE TABLE broken ("));
    }

    #[test]
    fn test_harness_error_classification() {
        let err: HarnessError = MigrationError::MissingScript {
            version: "003".to_string(),
        }
        .into();
        assert!(err.is_migration());
        assert!(!err.is_setup());

        assert!(HarnessError::setup("no bootstrap").is_setup());
        assert!(HarnessError::StartupTimeout(Duration::from_secs(60)).is_timeout());
    }
}
