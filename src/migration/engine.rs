//! Versioned migration engine
//!
//! [`Migrator`] applies the scripts of one directory to a SQLite connection and keeps a
//! ledger table inside the database recording every applied version.
//!
//! # Ledger format
//!
//! ```text
//! SCRIPT_CHANGE_LOG
//!   installed_rank  INTEGER PRIMARY KEY   -- application order
//!   version         TEXT UNIQUE           -- version as written in the filename
//!   description     TEXT
//!   type            TEXT                  -- BASELINE | SQL
//!   script          TEXT                  -- filename
//!   checksum        TEXT                  -- hex SHA-256, see `script::checksum`
//!   installed_on    TEXT                  -- RFC 3339
//!   execution_time  INTEGER               -- milliseconds
//!   success         INTEGER               -- 1 for completed scripts
//! ```
//!
//! # Policy
//!
//! - A missing ledger is created together with a `000` baseline row, so every real
//!   script is pending on the first run.
//! - Before anything is applied, every recorded script is validated against disk:
//!   checksum drift, missing scripts and failed entries are fatal.
//! - Pending scripts older than the newest applied version are rejected (no backfill).
//! - Each script runs in its own transaction together with its ledger row; a failing
//!   statement rolls the whole script back and stops the run.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::error::MigrationError;
use crate::migration::script::{
    load_scripts, MigrationScript, MigrationVersion, DEFAULT_SCRIPT_PREFIX,
};

/// Default name of the ledger table
pub const DEFAULT_LEDGER_TABLE: &str = "SCRIPT_CHANGE_LOG";

/// Kind of a ledger row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerKind {
    Baseline,
    Sql,
}

impl LedgerKind {
    fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::Baseline => "BASELINE",
            LedgerKind::Sql => "SQL",
        }
    }

    fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("BASELINE") {
            LedgerKind::Baseline
        } else {
            LedgerKind::Sql
        }
    }
}

/// One row of the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub installed_rank: i64,
    pub version: String,
    pub description: String,
    pub kind: LedgerKind,
    pub script: String,
    pub checksum: String,
    pub installed_on: String,
    pub execution_time_ms: i64,
    pub success: bool,
}

/// Result of a `migrate` run
#[derive(Debug, Clone, Default)]
pub struct MigrateReport {
    /// Versions applied by this run, in order
    pub applied: Vec<String>,
    /// Newest version in the ledger after the run
    pub current_version: Option<String>,
}

/// State of a script relative to the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptState {
    Baseline,
    Applied,
    Pending,
    BelowBaseline,
}

impl std::fmt::Display for ScriptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptState::Baseline => write!(f, "Baseline"),
            ScriptState::Applied => write!(f, "Applied"),
            ScriptState::Pending => write!(f, "Pending"),
            ScriptState::BelowBaseline => write!(f, "Below Baseline"),
        }
    }
}

/// Status line produced by [`Migrator::info`]
#[derive(Debug, Clone)]
pub struct ScriptInfo {
    pub version: String,
    pub description: String,
    pub state: ScriptState,
    pub installed_on: Option<String>,
}

/// Applies the versioned scripts of one directory
#[derive(Debug, Clone)]
pub struct Migrator {
    location: PathBuf,
    table: String,
    prefix: String,
    baseline: MigrationVersion,
}

impl Migrator {
    /// Create a migrator for the scripts in `location`
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
            table: DEFAULT_LEDGER_TABLE.to_string(),
            prefix: DEFAULT_SCRIPT_PREFIX.to_string(),
            baseline: MigrationVersion::baseline(),
        }
    }

    /// Use a different ledger table name
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Use a different script filename prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Scripts found on disk, in ascending version order
    pub fn scripts(&self) -> Result<Vec<MigrationScript>, MigrationError> {
        load_scripts(&self.location, &self.prefix)
    }

    // -------------------------------------------------------------------------
    // Ledger bookkeeping
    // -------------------------------------------------------------------------

    fn ledger_exists(&self, conn: &Connection) -> Result<bool, MigrationError> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
            [&self.table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn create_ledger(&self, conn: &Connection) -> Result<(), MigrationError> {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(&format!(
            r#"
            CREATE TABLE "{}" (
                installed_rank INTEGER PRIMARY KEY,
                version TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL,
                type TEXT NOT NULL,
                script TEXT NOT NULL,
                checksum TEXT NOT NULL,
                installed_on TEXT NOT NULL,
                execution_time INTEGER NOT NULL,
                success INTEGER NOT NULL
            );
            "#,
            self.table
        ))?;
        self.insert_entry(
            &tx,
            &self.baseline,
            "<< Baseline >>",
            LedgerKind::Baseline,
            "<< Baseline >>",
            "",
            0,
        )?;
        tx.commit()?;

        info!(
            "Created ledger table {} with baseline version {}",
            self.table, self.baseline
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_entry(
        &self,
        conn: &Connection,
        version: &MigrationVersion,
        description: &str,
        kind: LedgerKind,
        script: &str,
        checksum: &str,
        execution_time_ms: i64,
    ) -> Result<(), MigrationError> {
        conn.execute(
            &format!(
                r#"INSERT INTO "{}" (version, description, type, script, checksum, installed_on, execution_time, success)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)"#,
                self.table
            ),
            params![
                version.as_str(),
                description,
                kind.as_str(),
                script,
                checksum,
                Utc::now().to_rfc3339(),
                execution_time_ms
            ],
        )?;
        Ok(())
    }

    /// Rows of the ledger in application order; empty if the ledger does not exist
    pub fn ledger(&self, conn: &Connection) -> Result<Vec<LedgerEntry>, MigrationError> {
        if !self.ledger_exists(conn)? {
            return Ok(Vec::new());
        }

        let mut stmt = conn.prepare(&format!(
            r#"SELECT installed_rank, version, description, type, script, checksum,
                      installed_on, execution_time, success
               FROM "{}" ORDER BY installed_rank"#,
            self.table
        ))?;
        let entries = stmt
            .query_map([], |row| {
                Ok(LedgerEntry {
                    installed_rank: row.get(0)?,
                    version: row.get(1)?,
                    description: row.get(2)?,
                    kind: LedgerKind::parse(&row.get::<_, String>(3)?),
                    script: row.get(4)?,
                    checksum: row.get(5)?,
                    installed_on: row.get(6)?,
                    execution_time_ms: row.get(7)?,
                    success: row.get::<_, i64>(8)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // -------------------------------------------------------------------------
    // Validation
    // -------------------------------------------------------------------------

    /// Check every recorded script against disk without applying anything
    pub fn validate(&self, conn: &Connection) -> Result<(), MigrationError> {
        let scripts = self.scripts()?;
        let entries = self.ledger(conn)?;
        validate_entries(&scripts, &entries)
    }

    // -------------------------------------------------------------------------
    // Migrate
    // -------------------------------------------------------------------------

    /// Apply all pending scripts in ascending version order
    pub fn migrate(&self, conn: &Connection) -> Result<MigrateReport, MigrationError> {
        let scripts = self.scripts()?;

        if !self.ledger_exists(conn)? {
            self.create_ledger(conn)?;
        }
        let entries = self.ledger(conn)?;
        validate_entries(&scripts, &entries)?;

        let applied: HashSet<MigrationVersion> = entries
            .iter()
            .filter_map(|e| MigrationVersion::parse(&e.version))
            .collect();
        let mut newest = applied
            .iter()
            .max()
            .cloned()
            .unwrap_or_else(|| self.baseline.clone());

        let mut report = MigrateReport::default();
        for script in scripts.iter().filter(|s| !applied.contains(&s.version)) {
            if script.version <= self.baseline {
                debug!(
                    "Ignoring migration {} at or below baseline {}",
                    script.version, self.baseline
                );
                continue;
            }
            if script.version < newest {
                return Err(MigrationError::OutOfOrder {
                    version: script.version.to_string(),
                    applied: newest.to_string(),
                });
            }

            self.apply_script(conn, script)?;
            report.applied.push(script.version.to_string());
            newest = script.version.clone();
        }

        report.current_version = Some(newest.to_string());
        if report.applied.is_empty() {
            info!("Schema is up to date at version {}", newest);
        } else {
            info!(
                "Successfully applied {} migration(s), now at version {}",
                report.applied.len(),
                newest
            );
        }
        Ok(report)
    }

    fn apply_script(
        &self,
        conn: &Connection,
        script: &MigrationScript,
    ) -> Result<(), MigrationError> {
        debug!("Migrating schema to version {} - {}", script.version, script.description);
        let started = Instant::now();

        let tx = conn.unchecked_transaction()?;
        for statement in script.statements() {
            if let Err(e) = tx.execute_batch(&statement) {
                // dropping the transaction rolls the whole script back
                return Err(MigrationError::StatementFailed {
                    version: script.version.to_string(),
                    statement,
                    message: e.to_string(),
                });
            }
        }

        let elapsed = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.insert_entry(
            &tx,
            &script.version,
            &script.description,
            LedgerKind::Sql,
            &script.file_name,
            &script.checksum,
            elapsed,
        )?;
        tx.commit()?;

        debug!("Applied migration {} in {} ms", script.version, elapsed);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Info / Clean / Reset
    // -------------------------------------------------------------------------

    /// Status of every known version, ledger entries first, then pending scripts
    pub fn info(&self, conn: &Connection) -> Result<Vec<ScriptInfo>, MigrationError> {
        let scripts = self.scripts()?;
        let entries = self.ledger(conn)?;

        let mut infos: Vec<ScriptInfo> = entries
            .iter()
            .map(|e| ScriptInfo {
                version: e.version.clone(),
                description: e.description.clone(),
                state: match e.kind {
                    LedgerKind::Baseline => ScriptState::Baseline,
                    LedgerKind::Sql => ScriptState::Applied,
                },
                installed_on: Some(e.installed_on.clone()),
            })
            .collect();

        let applied: HashSet<MigrationVersion> = entries
            .iter()
            .filter_map(|e| MigrationVersion::parse(&e.version))
            .collect();
        for script in scripts.iter().filter(|s| !applied.contains(&s.version)) {
            infos.push(ScriptInfo {
                version: script.version.to_string(),
                description: script.description.clone(),
                state: if script.version <= self.baseline {
                    ScriptState::BelowBaseline
                } else {
                    ScriptState::Pending
                },
                installed_on: None,
            });
        }

        Ok(infos)
    }

    /// Drop every view, trigger, index and table, the ledger included
    ///
    /// Destructive. Only meant for resetting embedded test databases.
    pub fn clean(&self, conn: &Connection) -> Result<usize, MigrationError> {
        let foreign_keys: i64 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA foreign_keys = OFF")?;

        let result = drop_all_objects(conn);

        conn.execute_batch(if foreign_keys != 0 {
            "PRAGMA foreign_keys = ON"
        } else {
            "PRAGMA foreign_keys = OFF"
        })?;

        let dropped = result?;
        info!("Cleaned schema, dropped {} object(s)", dropped);
        Ok(dropped)
    }

    /// `clean` followed by a fresh `migrate`
    pub fn reset(&self, conn: &Connection) -> Result<MigrateReport, MigrationError> {
        self.clean(conn)?;
        self.migrate(conn)
    }
}

/// Compare recorded scripts against the scripts on disk
pub fn validate_entries(
    scripts: &[MigrationScript],
    entries: &[LedgerEntry],
) -> Result<(), MigrationError> {
    for entry in entries {
        if entry.kind == LedgerKind::Baseline {
            continue;
        }
        if !entry.success {
            return Err(MigrationError::FailedMigration {
                version: entry.version.clone(),
            });
        }

        let version =
            MigrationVersion::parse(&entry.version).ok_or_else(|| MigrationError::MissingScript {
                version: entry.version.clone(),
            })?;
        let script = scripts.iter().find(|s| s.version == version).ok_or_else(|| {
            MigrationError::MissingScript {
                version: entry.version.clone(),
            }
        })?;

        if script.checksum != entry.checksum {
            return Err(MigrationError::ChecksumMismatch {
                version: entry.version.clone(),
                recorded: entry.checksum.clone(),
                actual: script.checksum.clone(),
            });
        }
    }
    Ok(())
}

fn drop_all_objects(conn: &Connection) -> Result<usize, MigrationError> {
    let objects: Vec<(String, String)> = {
        let mut stmt = conn.prepare(
            "SELECT type, name FROM sqlite_master
             WHERE name NOT LIKE 'sqlite_%' AND sql IS NOT NULL
             ORDER BY CASE type WHEN 'view' THEN 0 WHEN 'trigger' THEN 1 WHEN 'index' THEN 2 ELSE 3 END",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let tx = conn.unchecked_transaction()?;
    let mut dropped = 0;
    for (kind, name) in &objects {
        let keyword = match kind.as_str() {
            "view" => "VIEW",
            "trigger" => "TRIGGER",
            "index" => "INDEX",
            "table" => "TABLE",
            _ => continue,
        };
        tx.execute_batch(&format!(
            r#"DROP {} IF EXISTS "{}""#,
            keyword,
            name.replace('"', "\"\"")
        ))?;
        dropped += 1;
    }
    tx.commit()?;

    Ok(dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, sql: &str) {
        std::fs::write(dir.join(name), sql).unwrap();
    }

    fn setup() -> (TempDir, Connection, Migrator) {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "v001__create_schema.sql",
            "CREATE TABLE schema_metadata_info (id INTEGER PRIMARY KEY, name TEXT NOT NULL);\n",
        );
        write(
            dir.path(),
            "v002__seed_schema.sql",
            "INSERT INTO schema_metadata_info (id, name) VALUES (1, 'first');\nCREATE INDEX idx_name ON schema_metadata_info(name);\n",
        );
        let conn = Connection::open_in_memory().unwrap();
        let migrator = Migrator::new(dir.path());
        (dir, conn, migrator)
    }

    fn ledger_shape(migrator: &Migrator, conn: &Connection) -> Vec<(String, String, String, bool)> {
        migrator
            .ledger(conn)
            .unwrap()
            .into_iter()
            .map(|e| (e.version, e.script, e.checksum, e.success))
            .collect()
    }

    #[test]
    fn test_first_run_creates_baseline_and_applies_all() {
        let (_dir, conn, migrator) = setup();

        let report = migrator.migrate(&conn).unwrap();
        assert_eq!(report.applied, vec!["001", "002"]);
        assert_eq!(report.current_version.as_deref(), Some("002"));

        let ledger = migrator.ledger(&conn).unwrap();
        assert_eq!(ledger.len(), 3);
        assert_eq!(ledger[0].kind, LedgerKind::Baseline);
        assert_eq!(ledger[0].version, "000");
        assert!(ledger[1].installed_rank < ledger[2].installed_rank);

        let name: String = conn
            .query_row("SELECT name FROM schema_metadata_info WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(name, "first");
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let (_dir, conn, migrator) = setup();
        migrator.migrate(&conn).unwrap();
        let before = ledger_shape(&migrator, &conn);

        let report = migrator.migrate(&conn).unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(ledger_shape(&migrator, &conn), before);
    }

    #[test]
    fn test_new_script_is_applied_later() {
        let (dir, conn, migrator) = setup();
        migrator.migrate(&conn).unwrap();

        write(dir.path(), "v003__add_column.sql", "ALTER TABLE schema_metadata_info ADD COLUMN description TEXT;");
        let report = migrator.migrate(&conn).unwrap();
        assert_eq!(report.applied, vec!["003"]);
    }

    #[test]
    fn test_out_of_order_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "v001__a.sql", "CREATE TABLE a (id INTEGER);");
        write(dir.path(), "v003__c.sql", "CREATE TABLE c (id INTEGER);");
        let conn = Connection::open_in_memory().unwrap();
        let migrator = Migrator::new(dir.path());
        migrator.migrate(&conn).unwrap();

        write(dir.path(), "v002__b.sql", "CREATE TABLE b (id INTEGER);");
        let err = migrator.migrate(&conn).unwrap_err();
        assert!(matches!(err, MigrationError::OutOfOrder { ref version, .. } if version == "002"));
    }

    #[test]
    fn test_checksum_drift_detected() {
        let (dir, conn, migrator) = setup();
        migrator.migrate(&conn).unwrap();

        write(
            dir.path(),
            "v001__create_schema.sql",
            "CREATE TABLE schema_metadata_info (id INTEGER PRIMARY KEY, name TEXT);\n",
        );
        assert!(matches!(
            migrator.validate(&conn),
            Err(MigrationError::ChecksumMismatch { ref version, .. }) if version == "001"
        ));
        assert!(matches!(
            migrator.migrate(&conn),
            Err(MigrationError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_missing_script_detected() {
        let (dir, conn, migrator) = setup();
        migrator.migrate(&conn).unwrap();

        std::fs::remove_file(dir.path().join("v002__seed_schema.sql")).unwrap();
        assert!(matches!(
            migrator.validate(&conn),
            Err(MigrationError::MissingScript { ref version }) if version == "002"
        ));
    }

    #[test]
    fn test_failing_statement_rolls_back_script() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "v001__a.sql", "CREATE TABLE a (id INTEGER);");
        write(
            dir.path(),
            "v002__b.sql",
            "CREATE TABLE b (id INTEGER);\nINSERT INTO missing_table VALUES (1);\n",
        );
        write(dir.path(), "v003__c.sql", "CREATE TABLE c (id INTEGER);");
        let conn = Connection::open_in_memory().unwrap();
        let migrator = Migrator::new(dir.path());

        let err = migrator.migrate(&conn).unwrap_err();
        match err {
            MigrationError::StatementFailed {
                version, statement, ..
            } => {
                assert_eq!(version, "002");
                assert_eq!(statement, "INSERT INTO missing_table VALUES (1)");
            }
            other => panic!("unexpected error: {other}"),
        }

        let versions: Vec<String> = migrator
            .ledger(&conn)
            .unwrap()
            .into_iter()
            .map(|e| e.version)
            .collect();
        assert_eq!(versions, vec!["000", "001"]);

        let b_exists: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name IN ('b', 'c')",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(b_exists, 0);
    }

    #[test]
    fn test_failed_ledger_entry_blocks_migrate() {
        let (_dir, conn, migrator) = setup();
        migrator.migrate(&conn).unwrap();
        conn.execute(
            r#"UPDATE "SCRIPT_CHANGE_LOG" SET success = 0 WHERE version = '002'"#,
            [],
        )
        .unwrap();

        assert!(matches!(
            migrator.migrate(&conn),
            Err(MigrationError::FailedMigration { .. })
        ));
    }

    #[test]
    fn test_clean_then_migrate_matches_fresh_migrate() {
        let (dir, conn, migrator) = setup();
        migrator.migrate(&conn).unwrap();
        conn.execute(
            "INSERT INTO schema_metadata_info (id, name) VALUES (2, 'second')",
            [],
        )
        .unwrap();

        let report = migrator.reset(&conn).unwrap();
        assert_eq!(report.applied, vec!["001", "002"]);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_metadata_info", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);

        let fresh_conn = Connection::open_in_memory().unwrap();
        let fresh = Migrator::new(dir.path());
        fresh.migrate(&fresh_conn).unwrap();
        assert_eq!(
            ledger_shape(&migrator, &conn),
            ledger_shape(&fresh, &fresh_conn)
        );
    }

    #[test]
    fn test_clean_drops_everything() {
        let (_dir, conn, migrator) = setup();
        migrator.migrate(&conn).unwrap();
        conn.execute_batch(
            "CREATE VIEW v_names AS SELECT name FROM schema_metadata_info;
             CREATE TABLE child (id INTEGER, parent INTEGER REFERENCES schema_metadata_info(id));
             INSERT INTO child VALUES (1, 1);
             PRAGMA foreign_keys = ON;",
        )
        .unwrap();

        let dropped = migrator.clean(&conn).unwrap();
        assert!(dropped >= 4);

        let remaining: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name NOT LIKE 'sqlite_%'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(remaining, 0);

        let foreign_keys: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |r| r.get(0))
            .unwrap();
        assert_eq!(foreign_keys, 1);
    }

    #[test]
    fn test_info_reports_pending() {
        let (dir, conn, migrator) = setup();
        migrator.migrate(&conn).unwrap();
        write(dir.path(), "v003__later.sql", "CREATE TABLE later (id INTEGER);");

        let infos = migrator.info(&conn).unwrap();
        let states: Vec<(String, ScriptState)> =
            infos.into_iter().map(|i| (i.version, i.state)).collect();
        assert_eq!(
            states,
            vec![
                ("000".to_string(), ScriptState::Baseline),
                ("001".to_string(), ScriptState::Applied),
                ("002".to_string(), ScriptState::Applied),
                ("003".to_string(), ScriptState::Pending),
            ]
        );
    }
}
