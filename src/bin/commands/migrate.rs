use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Args;
use registry_harness::database::{ensure_parent_dir, DatabaseConn};
use registry_harness::migration::Migrator;
use registry_harness::{HarnessConfig, OutputFormat};
use serde::Serialize;
use tracing::info;

use super::{display_path, preprocessor, BootstrapArgs};

/// Arguments for the Migrate command
#[derive(Args)]
pub struct MigrateArgs {
    /// SQLite database file to migrate (created if missing)
    #[clap(short, long)]
    pub database: PathBuf,

    /// Drop every schema object first, then migrate from scratch
    #[clap(long)]
    pub reset: bool,

    #[clap(flatten)]
    pub bootstrap: BootstrapArgs,
}

#[derive(Debug, Serialize)]
struct MigrateOutput {
    database: String,
    applied: Vec<String>,
    current_version: Option<String>,
    skipped_files: Vec<String>,
    failed_files: Vec<String>,
}

pub fn run(config: &HarnessConfig, args: MigrateArgs, output_format: OutputFormat) -> Result<()> {
    let MigrateArgs {
        database,
        reset,
        bootstrap,
    } = args;

    let source = bootstrap.resolve(config)?;
    let sanitized = preprocessor(config)?.process_dir(&source)?;

    let db_path = database
        .to_str()
        .ok_or_else(|| anyhow!("Database path is not valid UTF-8"))?;
    ensure_parent_dir(db_path)?;
    let db = DatabaseConn::open_path(db_path)?;

    let migrator = Migrator::new(sanitized.path()).with_prefix(&config.script_prefix);
    let report = if reset {
        info!("Resetting {}", db_path);
        migrator.reset(&db.conn)?
    } else {
        migrator.migrate(&db.conn)?
    };

    let output = MigrateOutput {
        database: display_path(&database),
        applied: report.applied,
        current_version: report.current_version,
        skipped_files: sanitized.report().skipped.clone(),
        failed_files: sanitized.report().failed.clone(),
    };

    if output_format.is_json() {
        println!("{}", output_format.to_json(&output)?);
        return Ok(());
    }

    if output.applied.is_empty() {
        println!("{} is up to date", output.database);
    } else {
        println!(
            "Applied {} scripts to {}: {}",
            output.applied.len(),
            output.database,
            output.applied.join(", ")
        );
    }
    if let Some(version) = &output.current_version {
        println!("Current version: {}", version);
    }
    if !output.failed_files.is_empty() {
        eprintln!(
            "WARNING: {} scripts could not be fully preprocessed: {}",
            output.failed_files.len(),
            output.failed_files.join(", ")
        );
    }
    Ok(())
}
