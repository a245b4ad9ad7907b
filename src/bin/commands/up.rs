use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Args;
use registry_harness::{HarnessConfig, ProcessLauncher, TestRegistryServer};
use tracing::{info, warn};

/// Arguments for the Up command
#[derive(Args)]
pub struct UpArgs {
    /// Command starting the registry; `{config}` and `{port}` are substituted
    #[clap(long)]
    pub service_command: Option<String>,

    /// Seconds to wait for the registry to become ready
    #[clap(long)]
    pub startup_timeout: Option<u64>,

    /// Enable the catalog integration
    #[clap(long)]
    pub integration: bool,

    /// Port of the catalog the integration talks to
    #[clap(long)]
    pub integration_port: Option<u16>,
}

pub fn run(mut config: HarnessConfig, args: UpArgs) -> Result<()> {
    let UpArgs {
        service_command,
        startup_timeout,
        integration,
        integration_port,
    } = args;

    if let Some(command) = service_command {
        config.service_command = Some(command);
    }
    if let Some(secs) = startup_timeout {
        config.startup_timeout_secs = secs;
    }

    let launcher = ProcessLauncher::from_config(&config)
        .ok_or_else(|| anyhow!("No service command given (--service-command or service_command)"))?;
    let server = TestRegistryServer::new(config, Arc::new(launcher));
    server.set_integration_enabled(integration)?;
    if let Some(port) = integration_port {
        server.set_integration_port(port)?;
    }

    server.start()?;

    println!("Registry port:    {}", server.port().unwrap_or_default());
    println!("Database port:    {}", server.db_port().unwrap_or_default());
    if let Some(props) = server.external_properties() {
        println!("Database URL:     {}", props.data_source_url);
    }
    if let Some(path) = server.config_path() {
        println!("Configuration:    {}", path.display());
    }
    println!("Press Ctrl-C to stop");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| anyhow!("Failed to build signal runtime: {}", e))?;
    if let Err(e) = runtime.block_on(tokio::signal::ctrl_c()) {
        warn!("Failed to listen for Ctrl-C: {}", e);
    }
    runtime.shutdown_timeout(Duration::from_secs(1));

    info!("Stopping registry");
    let report = server.stop();
    for (step, reason) in &report.failures {
        eprintln!("WARNING: {} failed: {}", step, reason);
    }
    Ok(())
}
