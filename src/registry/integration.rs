//! Optional metadata-catalog integration
//!
//! The registry can publish schema events to an Atlas catalog. The harness does not load
//! the catalog client itself; it only fills the integration section of the service
//! configuration. [`DisabledIntegration`] is the default and writes the section with
//! `enabled: false`.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::HarnessError;
use crate::registry::config::IntegrationConfiguration;

/// Directory holding the catalog client's runtime artifacts
pub const ARTIFACTS_DIR_NAME: &str = "atlasJars";

/// Loader the service uses for the custom classpath
pub const CUSTOM_CLASSPATH_LOADER: &str =
    "org.apache.atlas.plugin.classloader.AtlasCustomPathClassLoader";

/// Builds the integration section of a service configuration
pub trait IntegrationClientFactory: Send + Sync {
    /// Short name used in log lines
    fn name(&self) -> &str;

    fn is_enabled(&self) -> bool;

    /// Fill `section`; fails when the integration cannot be wired up
    fn configure(&self, section: &mut IntegrationConfiguration) -> Result<(), HarnessError>;
}

/// The default: integration switched off
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledIntegration;

impl IntegrationClientFactory for DisabledIntegration {
    fn name(&self) -> &str {
        "disabled"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    fn configure(&self, section: &mut IntegrationConfiguration) -> Result<(), HarnessError> {
        section.enabled = false;
        Ok(())
    }
}

/// Integration with an Atlas catalog listening on a local port
#[derive(Debug, Clone)]
pub struct AtlasIntegration {
    port: u16,
    artifacts_dir: Option<PathBuf>,
    search_base: Option<PathBuf>,
}

impl AtlasIntegration {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            artifacts_dir: None,
            search_base: None,
        }
    }

    /// Use this artifacts directory instead of probing
    pub fn with_artifacts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifacts_dir = Some(dir.into());
        self
    }

    /// Probe relative to `base` instead of the working directory
    pub fn with_search_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.search_base = Some(base.into());
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn resolve_artifacts_dir(&self) -> Result<PathBuf, HarnessError> {
        if let Some(dir) = &self.artifacts_dir {
            return if dir.is_dir() {
                Ok(dir.clone())
            } else {
                Err(HarnessError::setup(format!(
                    "Integration artifacts directory {} does not exist",
                    dir.display()
                )))
            };
        }

        let base = match &self.search_base {
            Some(base) => base.clone(),
            None => std::env::current_dir().map_err(|e| {
                HarnessError::setup(format!("Cannot read working directory: {}", e))
            })?,
        };

        probe_artifacts_dir(&base).ok_or_else(|| {
            HarnessError::setup(format!(
                "Integration is enabled but no {} directory was found near {}",
                ARTIFACTS_DIR_NAME,
                base.display()
            ))
        })
    }
}

impl IntegrationClientFactory for AtlasIntegration {
    fn name(&self) -> &str {
        "atlas"
    }

    fn is_enabled(&self) -> bool {
        true
    }

    fn configure(&self, section: &mut IntegrationConfiguration) -> Result<(), HarnessError> {
        let dir = self.resolve_artifacts_dir()?;
        let dir = std::fs::canonicalize(&dir).map_err(|e| {
            HarnessError::setup(format!("Cannot resolve {}: {}", dir.display(), e))
        })?;

        section.enabled = true;
        section.atlas_urls = vec![format!("http://localhost:{}", self.port)];
        section.custom_classpath_loader = Some(CUSTOM_CLASSPATH_LOADER.to_string());
        section.custom_classpath = Some(forward_slashes(&dir));

        info!("Atlas integration enabled on port {}", self.port);
        Ok(())
    }
}

/// Locations probed for the artifacts directory, nearest first
pub fn artifacts_candidates(base: &Path) -> Vec<PathBuf> {
    let mut candidates = Vec::with_capacity(4);
    let mut dir = base.to_path_buf();
    for _ in 0..4 {
        candidates.push(dir.join(ARTIFACTS_DIR_NAME));
        dir = dir.join("..");
    }
    candidates
}

/// First existing artifacts directory near `base`
pub fn probe_artifacts_dir(base: &Path) -> Option<PathBuf> {
    artifacts_candidates(base).into_iter().find(|candidate| {
        let found = candidate.is_dir();
        debug!("Probed integration artifacts {} ({})", candidate.display(), found);
        found
    })
}

fn forward_slashes(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Pick the factory matching the caller's toggle
pub fn integration_for(
    enabled: bool,
    port: u16,
    artifacts_dir: Option<&str>,
) -> Box<dyn IntegrationClientFactory> {
    if !enabled {
        return Box::new(DisabledIntegration);
    }
    let integration = AtlasIntegration::new(port);
    match artifacts_dir {
        Some(dir) => Box::new(integration.with_artifacts_dir(dir)),
        None => Box::new(integration),
    }
}
