#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! Registry Harness - ephemeral schema registry instances for integration tests
//!
//! The harness stands up a fully-wired registry for a test process: an embedded
//! database reachable over the network, a schema migrated from the project's versioned
//! bootstrap scripts, a synthesized service configuration and a managed service
//! lifecycle with a bounded readiness wait.
//!
//! # Feature Flags
//!
//! | Feature | Description | Key Dependencies |
//! |---------|-------------|------------------|
//! | `display` | Table formatting with `tabled` | `tabled` |
//! | `cli` | The `registry-harness` binary | All above + `clap`, `tracing-subscriber` |
//!
//! The library itself (database, migrations, orchestrator) is always available.
//!
//! # Architecture
//!
//! - **[`server`]**: the lifecycle orchestrator (`TestRegistryServer`)
//! - **[`database`]**: embedded database, pool, network endpoint and client
//! - **[`migration`]**: script preprocessing and the ledger-backed migrator
//! - **[`registry`]**: service configuration, file storage, integration, launcher
//! - **[`ports`]**: free port allocation
//! - **[`config`]**: harness configuration
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use registry_harness::{HarnessConfig, ProcessLauncher, TestRegistryServer};
//!
//! let config = HarnessConfig::new(&None)?;
//! let launcher = ProcessLauncher::new("bin/registry-server.sh {config}");
//! let server = TestRegistryServer::new(config, Arc::new(launcher));
//!
//! server.start()?;
//! println!("registry on port {:?}, database on {:?}", server.port(), server.db_port());
//!
//! // between test cases
//! server.cleanup_db()?;
//!
//! let report = server.stop();
//! assert!(report.is_clean());
//! ```
//!
//! ## Migrations only
//!
//! ```rust,ignore
//! use registry_harness::database::DatabaseConn;
//! use registry_harness::migration::{Migrator, PreprocessRules, Preprocessor};
//!
//! let sanitized = Preprocessor::new(PreprocessRules::default())?
//!     .process_dir("bootstrap/sql/mysql".as_ref())?;
//! let db = DatabaseConn::open_path("registry.sqlite3")?;
//! let report = Migrator::new(sanitized.path()).migrate(&db.conn)?;
//! ```

pub mod config;
pub mod database;
pub mod error;
pub mod migration;
pub mod output;
pub mod ports;
pub mod registry;
pub mod server;

// =============================================================================
// Configuration and errors
// =============================================================================

pub use config::HarnessConfig;
pub use error::{HarnessError, MigrationError};
pub use output::OutputFormat;

// =============================================================================
// Database
// =============================================================================

pub use database::{DatabaseConn, DbConnectionProperties, EmbeddedDatabase, RemoteConnection};

// =============================================================================
// Migrations
// =============================================================================

pub use migration::{MigrateReport, Migrator, PreprocessRules, Preprocessor};

// =============================================================================
// Registry service and orchestrator
// =============================================================================

pub use ports::find_free_port;
pub use registry::{
    ConfigSynthesizer, FileStorage, LocalFileStorage, ProcessLauncher, RegistryService,
    ServiceConfiguration, ServiceLauncher,
};
pub use server::{LifecycleState, TeardownReport, TestRegistryServer};
