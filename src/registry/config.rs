//! Service configuration synthesis
//!
//! Builds the document the registry service reads at startup. It has three sections,
//! all always present:
//!
//! ```yaml
//! storageProviderConfiguration:   # provider class, db type, timeout, connection properties
//! fileStorageConfiguration:       # storage class + scratch upload directory
//! atlasConfiguration:             # optional integration, `enabled: false` by default
//! ```
//!
//! Two syntheses with the same inputs differ only in the upload directory, which is a
//! fresh temp directory each time.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tempfile::{TempDir, TempPath};
use tracing::debug;

use crate::config::HarnessConfig;
use crate::database::DbConnectionProperties;
use crate::error::HarnessError;
use crate::registry::integration::IntegrationClientFactory;

pub const STORAGE_PROVIDER_CLASS: &str =
    "com.hortonworks.registries.storage.impl.jdbc.JdbcStorageManager";
pub const FILE_STORAGE_CLASS: &str = "com.hortonworks.registries.common.util.LocalFileSystemStorage";

pub const INTEGRATION_USER: &str = "kafka";
pub const INTEGRATION_PASSWORD: &str = "cloudera";

/// Prefix of the scratch upload directory
pub const UPLOAD_DIR_PREFIX: &str = "uploadtmp";

// =============================================================================
// Configuration document
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfiguration {
    pub server: ServerConfiguration,
    pub storage_provider_configuration: StorageProviderConfiguration,
    pub file_storage_configuration: FileStorageConfiguration,
    pub atlas_configuration: IntegrationConfiguration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfiguration {
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageProviderConfiguration {
    pub provider_class: String,
    pub properties: StorageProviderProperties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageProviderProperties {
    pub dbtype: String,
    pub query_timeout_in_secs: u64,
    pub properties: DbConnectionProperties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStorageConfiguration {
    pub class_name: String,
    pub properties: FileStorageProperties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStorageProperties {
    pub directory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl Default for BasicAuth {
    fn default() -> Self {
        Self {
            username: INTEGRATION_USER.to_string(),
            password: INTEGRATION_PASSWORD.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationConfiguration {
    pub enabled: bool,
    #[serde(default)]
    pub atlas_urls: Vec<String>,
    pub basic_auth: BasicAuth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_classpath_loader: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_classpath: Option<String>,
}

impl ServiceConfiguration {
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| anyhow!("Failed to render configuration: {}", e))
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| anyhow!("Failed to parse configuration: {}", e))
    }

    /// Upload directory of the file-storage section
    pub fn upload_dir(&self) -> PathBuf {
        PathBuf::from(&self.file_storage_configuration.properties.directory)
    }
}

// =============================================================================
// Synthesizer
// =============================================================================

/// A configuration together with the scratch directory it points at
///
/// Dropping it removes the scratch directory.
#[derive(Debug)]
pub struct SynthesizedConfig {
    pub configuration: ServiceConfiguration,
    scratch: TempDir,
}

impl SynthesizedConfig {
    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    /// Write the configuration to a fresh `registry*.yaml` temp file
    ///
    /// The file is removed when the returned path is dropped.
    pub fn write_artifact(&self) -> Result<TempPath> {
        let yaml = self.configuration.to_yaml()?;
        let mut file = tempfile::Builder::new()
            .prefix("registry")
            .suffix(".yaml")
            .tempfile()
            .map_err(|e| anyhow!("Failed to create configuration file: {}", e))?;
        file.write_all(yaml.as_bytes())
            .map_err(|e| anyhow!("Failed to write configuration file: {}", e))?;
        file.flush()?;

        let path = file.into_temp_path();
        debug!("Registry configuration written to {}", path.display());
        Ok(path)
    }

    /// Remove the scratch directory now
    pub fn close(self) -> Result<()> {
        self.scratch
            .close()
            .map_err(|e| anyhow!("Failed to remove scratch directory: {}", e))
    }
}

/// Builds service configurations with the harness defaults
#[derive(Debug, Clone)]
pub struct ConfigSynthesizer {
    db_type: String,
    query_timeout_secs: u64,
}

impl Default for ConfigSynthesizer {
    fn default() -> Self {
        Self::from_config(&HarnessConfig::default())
    }
}

impl ConfigSynthesizer {
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            db_type: config.db_type.clone(),
            query_timeout_secs: config.query_timeout_secs,
        }
    }

    /// Build the configuration for a service on `service_port` backed by `db`
    pub fn synthesize(
        &self,
        db: &DbConnectionProperties,
        integration: &dyn IntegrationClientFactory,
        service_port: u16,
    ) -> Result<SynthesizedConfig, HarnessError> {
        let mut atlas_configuration = IntegrationConfiguration::default();
        integration.configure(&mut atlas_configuration)?;

        let scratch = tempfile::Builder::new()
            .prefix(UPLOAD_DIR_PREFIX)
            .tempdir()
            .map_err(|e| HarnessError::setup(format!("Failed to create upload directory: {}", e)))?;
        let directory = scratch.path().to_string_lossy().replace('\\', "/");

        let configuration = ServiceConfiguration {
            server: ServerConfiguration { port: service_port },
            storage_provider_configuration: StorageProviderConfiguration {
                provider_class: STORAGE_PROVIDER_CLASS.to_string(),
                properties: StorageProviderProperties {
                    dbtype: self.db_type.clone(),
                    query_timeout_in_secs: self.query_timeout_secs,
                    properties: db.clone(),
                },
            },
            file_storage_configuration: FileStorageConfiguration {
                class_name: FILE_STORAGE_CLASS.to_string(),
                properties: FileStorageProperties {
                    directory,
                    fs_url: None,
                },
            },
            atlas_configuration,
        };

        debug!(
            "Synthesized configuration (integration: {})",
            integration.name()
        );
        Ok(SynthesizedConfig {
            configuration,
            scratch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::integration::{AtlasIntegration, DisabledIntegration};

    fn props() -> DbConnectionProperties {
        DbConnectionProperties::remote("registry-test", "localhost", 40311)
    }

    #[test]
    fn test_sections_present_with_defaults() {
        let synthesized = ConfigSynthesizer::default()
            .synthesize(&props(), &DisabledIntegration, 9090)
            .unwrap();
        let config = &synthesized.configuration;

        assert_eq!(config.server.port, 9090);
        assert_eq!(
            config.storage_provider_configuration.provider_class,
            STORAGE_PROVIDER_CLASS
        );
        let storage = &config.storage_provider_configuration.properties;
        assert_eq!(storage.dbtype, "mysql");
        assert_eq!(storage.query_timeout_in_secs, 30);
        assert_eq!(storage.properties, props());

        assert_eq!(config.file_storage_configuration.class_name, FILE_STORAGE_CLASS);
        assert!(synthesized.scratch_dir().is_dir());
        assert_eq!(config.upload_dir(), synthesized.scratch_dir());

        assert!(!config.atlas_configuration.enabled);
        assert_eq!(config.atlas_configuration.basic_auth, BasicAuth::default());
    }

    #[test]
    fn test_same_inputs_differ_only_in_upload_dir() {
        let synthesizer = ConfigSynthesizer::default();
        let first = synthesizer.synthesize(&props(), &DisabledIntegration, 9090).unwrap();
        let second = synthesizer.synthesize(&props(), &DisabledIntegration, 9090).unwrap();
        assert_ne!(first.scratch_dir(), second.scratch_dir());

        let mut a = first.configuration.clone();
        let mut b = second.configuration.clone();
        a.file_storage_configuration.properties.directory = "scratch".to_string();
        b.file_storage_configuration.properties.directory = "scratch".to_string();
        assert_eq!(a.to_yaml().unwrap(), b.to_yaml().unwrap());
    }

    #[test]
    fn test_yaml_uses_service_field_names() {
        let synthesized = ConfigSynthesizer::default()
            .synthesize(&props(), &DisabledIntegration, 9090)
            .unwrap();
        let yaml = synthesized.configuration.to_yaml().unwrap();

        assert!(yaml.contains("storageProviderConfiguration:"));
        assert!(yaml.contains("queryTimeoutInSecs: 30"));
        assert!(yaml.contains("dataSourceUrl:"));
        assert!(yaml.contains("sqlite:tcp://localhost:40311/mem:registry-test"));
        assert!(yaml.contains("fileStorageConfiguration:"));
        assert!(yaml.contains("atlasConfiguration:"));
        assert!(!yaml.contains("customClasspath"));

        let parsed = ServiceConfiguration::from_yaml(&yaml).unwrap();
        assert_eq!(parsed, synthesized.configuration);
    }

    #[test]
    fn test_artifact_is_removed_on_drop() {
        let synthesized = ConfigSynthesizer::default()
            .synthesize(&props(), &DisabledIntegration, 9090)
            .unwrap();
        let artifact = synthesized.write_artifact().unwrap();
        let path = artifact.to_path_buf();

        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("registry") && name.ends_with(".yaml"));
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, synthesized.configuration.to_yaml().unwrap());

        drop(artifact);
        assert!(!path.exists());

        let scratch = synthesized.scratch_dir().to_path_buf();
        synthesized.close().unwrap();
        assert!(!scratch.exists());
    }

    #[test]
    fn test_missing_integration_artifacts_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let deep = root.path().join("w").join("x").join("y").join("z");
        std::fs::create_dir_all(&deep).unwrap();

        let integration = AtlasIntegration::new(21000).with_search_base(&deep);
        let err = ConfigSynthesizer::default()
            .synthesize(&props(), &integration, 9090)
            .unwrap_err();
        assert!(err.is_setup());
    }
}
