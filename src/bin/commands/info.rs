use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Args;
use registry_harness::database::DatabaseConn;
use registry_harness::migration::{Migrator, ScriptInfo};
use registry_harness::{HarnessConfig, OutputFormat};
use serde::Serialize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use super::{preprocessor, BootstrapArgs};

/// Arguments for the Info command
#[derive(Args)]
pub struct InfoArgs {
    /// SQLite database file to inspect
    #[clap(short, long)]
    pub database: PathBuf,

    #[clap(flatten)]
    pub bootstrap: BootstrapArgs,
}

#[derive(Debug, Serialize, Tabled)]
struct ScriptRow {
    version: String,
    description: String,
    state: String,
    installed_on: String,
}

impl From<ScriptInfo> for ScriptRow {
    fn from(info: ScriptInfo) -> Self {
        ScriptRow {
            version: info.version,
            description: info.description,
            state: info.state.to_string(),
            installed_on: info.installed_on.unwrap_or_default(),
        }
    }
}

pub fn run(config: &HarnessConfig, args: InfoArgs, output_format: OutputFormat) -> Result<()> {
    let InfoArgs {
        database,
        bootstrap,
    } = args;

    if !database.exists() {
        return Err(anyhow!("Database {} does not exist", database.display()));
    }
    let db_path = database
        .to_str()
        .ok_or_else(|| anyhow!("Database path is not valid UTF-8"))?;

    let source = bootstrap.resolve(config)?;
    let sanitized = preprocessor(config)?.process_dir(&source)?;
    let db = DatabaseConn::open_path(db_path)?;

    let migrator = Migrator::new(sanitized.path()).with_prefix(&config.script_prefix);
    let rows: Vec<ScriptRow> = migrator
        .info(&db.conn)?
        .into_iter()
        .map(ScriptRow::from)
        .collect();

    match output_format {
        OutputFormat::Table => println!("{}", Table::new(&rows).with(Style::rounded())),
        OutputFormat::Markdown => println!("{}", Table::new(&rows).with(Style::markdown())),
        OutputFormat::Json | OutputFormat::JsonPretty => {
            println!("{}", output_format.to_json(&rows)?)
        }
    }

    if let Err(e) = migrator.validate(&db.conn) {
        eprintln!("WARNING: {}", e);
    }
    Ok(())
}
