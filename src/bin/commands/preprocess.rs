use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Args;
use registry_harness::{HarnessConfig, OutputFormat};
use serde::Serialize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use super::{display_path, preprocessor, BootstrapArgs};

/// Arguments for the Preprocess command
#[derive(Args)]
pub struct PreprocessArgs {
    /// Directory receiving the sanitized scripts
    #[clap(short, long)]
    pub out: PathBuf,

    #[clap(flatten)]
    pub bootstrap: BootstrapArgs,
}

#[derive(Debug, Serialize, Tabled)]
struct FileRow {
    file: String,
    status: &'static str,
}

pub fn run(config: &HarnessConfig, args: PreprocessArgs, output_format: OutputFormat) -> Result<()> {
    let PreprocessArgs { out, bootstrap } = args;

    let source = bootstrap.resolve(config)?;
    std::fs::create_dir_all(&out)
        .map_err(|e| anyhow!("Failed to create {}: {}", out.display(), e))?;

    let report = preprocessor(config)?.process_dir_into(&source, &out)?;

    let mut rows: Vec<FileRow> = report
        .written
        .iter()
        .map(|path| FileRow {
            file: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| display_path(path)),
            status: "written",
        })
        .collect();
    rows.extend(report.skipped.iter().map(|name| FileRow {
        file: name.clone(),
        status: "skipped",
    }));
    rows.extend(report.failed.iter().map(|name| FileRow {
        file: name.clone(),
        status: "failed",
    }));

    match output_format {
        OutputFormat::Table => println!("{}", Table::new(&rows).with(Style::rounded())),
        OutputFormat::Markdown => println!("{}", Table::new(&rows).with(Style::markdown())),
        OutputFormat::Json | OutputFormat::JsonPretty => {
            println!("{}", output_format.to_json(&rows)?)
        }
    }

    if !report.failed.is_empty() {
        return Err(anyhow!(
            "{} scripts could not be fully written to {}",
            report.failed.len(),
            out.display()
        ));
    }
    Ok(())
}
