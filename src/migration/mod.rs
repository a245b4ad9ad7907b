//! Schema migrations
//!
//! - **bootstrap**: locating the directory of versioned scripts
//! - **preprocess**: sanitizing MySQL scripts for the embedded engine
//! - **script**: versions, checksums and statement splitting
//! - **engine**: the ledger-backed migrator (`migrate`, `validate`, `clean`, `reset`)
//!
//! ```rust,ignore
//! use registry_harness::migration::{Migrator, Preprocessor, PreprocessRules};
//!
//! let sanitized = Preprocessor::new(PreprocessRules::default())?.process_dir(&bootstrap)?;
//! let migrator = Migrator::new(sanitized.path());
//! migrator.migrate(&conn)?;
//! ```

mod bootstrap;
mod engine;
mod preprocess;
mod script;

pub use bootstrap::{bootstrap_candidates, find_bootstrap_dir, probe_bootstrap_dir};
pub use engine::{
    validate_entries, LedgerEntry, LedgerKind, MigrateReport, Migrator, ScriptInfo, ScriptState,
    DEFAULT_LEDGER_TABLE,
};
pub use preprocess::{
    DialectRewriter, PreprocessReport, PreprocessRules, Preprocessor, SanitizedScripts,
};
pub use script::{
    checksum, load_scripts, parse_file_name, split_statements, MigrationScript, MigrationVersion,
    DEFAULT_SCRIPT_PREFIX, SCRIPT_SUFFIX,
};
