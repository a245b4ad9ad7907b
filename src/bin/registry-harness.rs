#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use clap::{Parser, Subcommand};
use registry_harness::{HarnessConfig, OutputFormat};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::info::InfoArgs;
use commands::migrate::MigrateArgs;
use commands::preprocess::PreprocessArgs;
use commands::render_config::RenderConfigArgs;
use commands::up::UpArgs;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    /// configuration file path, by default ./registry-harness.toml is used when present
    #[clap(short, long)]
    config: Option<String>,

    /// Print debug information
    #[clap(long, global = true)]
    debug: bool,

    /// Output format: table (default), markdown, json, json-pretty
    #[clap(short, long, global = true, default_value = "table")]
    format: OutputFormat,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a registry instance with its database and keep it up until Ctrl-C
    Up(UpArgs),

    /// Preprocess the bootstrap scripts and migrate a SQLite database file
    Migrate(MigrateArgs),

    /// Write sanitized bootstrap scripts to a directory
    Preprocess(PreprocessArgs),

    /// Print the service configuration synthesized for a database URL
    RenderConfig(RenderConfigArgs),

    /// Show the migration status of a SQLite database file
    Info(InfoArgs),
}

fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match HarnessConfig::new(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Up(args) => commands::up::run(config, args),
        Commands::Migrate(args) => commands::migrate::run(&config, args, cli.format),
        Commands::Preprocess(args) => commands::preprocess::run(&config, args, cli.format),
        Commands::RenderConfig(args) => commands::render_config::run(&config, args),
        Commands::Info(args) => commands::info::run(&config, args, cli.format),
    };

    if let Err(e) = result {
        eprintln!("ERROR: {}", e);
        std::process::exit(1);
    }
}
