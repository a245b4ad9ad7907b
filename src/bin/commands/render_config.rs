use anyhow::Result;
use clap::Args;
use registry_harness::database::DbConnectionProperties;
use registry_harness::registry::{integration_for, ConfigSynthesizer};
use registry_harness::HarnessConfig;

/// Arguments for the RenderConfig command
#[derive(Args)]
pub struct RenderConfigArgs {
    /// Database URL the service should connect to
    #[clap(long)]
    pub db_url: String,

    /// Port the service listens on
    #[clap(short, long, default_value_t = 9090)]
    pub port: u16,

    /// Upload directory to write into the file-storage section, instead of a temp directory
    #[clap(long)]
    pub upload_dir: Option<String>,

    /// Enable the catalog integration
    #[clap(long)]
    pub integration: bool,

    /// Port of the catalog the integration talks to
    #[clap(long, default_value_t = 21000)]
    pub integration_port: u16,
}

pub fn run(config: &HarnessConfig, args: RenderConfigArgs) -> Result<()> {
    let RenderConfigArgs {
        db_url,
        port,
        upload_dir,
        integration,
        integration_port,
    } = args;

    let props = DbConnectionProperties::from_url(&db_url)?;
    let integration = integration_for(
        integration,
        integration_port,
        config.integration_artifacts_dir.as_deref(),
    );

    let synthesized =
        ConfigSynthesizer::from_config(config).synthesize(&props, integration.as_ref(), port)?;
    let mut configuration = synthesized.configuration.clone();
    if let Some(dir) = upload_dir {
        configuration.file_storage_configuration.properties.directory = dir;
    }

    print!("{}", configuration.to_yaml()?);
    Ok(())
}
