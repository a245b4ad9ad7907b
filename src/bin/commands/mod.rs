pub mod info;
pub mod migrate;
pub mod preprocess;
pub mod render_config;
pub mod up;

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Args;
use registry_harness::migration::{find_bootstrap_dir, PreprocessRules, Preprocessor};
use registry_harness::HarnessConfig;

/// Where to read bootstrap scripts from
#[derive(Args, Debug, Clone)]
pub struct BootstrapArgs {
    /// Bootstrap script directory, overrides the configured or probed one
    #[clap(short, long)]
    pub bootstrap_dir: Option<PathBuf>,
}

impl BootstrapArgs {
    pub(crate) fn resolve(&self, config: &HarnessConfig) -> Result<PathBuf> {
        let explicit = self
            .bootstrap_dir
            .clone()
            .or_else(|| config.bootstrap_dir.as_ref().map(PathBuf::from));
        Ok(find_bootstrap_dir(explicit.as_deref(), &config.db_type)?)
    }
}

pub(crate) fn preprocessor(config: &HarnessConfig) -> Result<Preprocessor> {
    Preprocessor::new(PreprocessRules::from_config(config))
}

pub(crate) fn display_path(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
