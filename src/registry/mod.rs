//! Everything the harness knows about the registry service it launches
//!
//! - **config**: the service configuration document and its synthesizer
//! - **integration**: the optional metadata-catalog integration
//! - **storage**: the file storage the service uploads into
//! - **service**: launching and stopping the service

mod config;
mod integration;
mod service;
mod storage;

pub use config::{
    BasicAuth, ConfigSynthesizer, FileStorageConfiguration, FileStorageProperties,
    IntegrationConfiguration, ServerConfiguration, ServiceConfiguration,
    StorageProviderConfiguration, StorageProviderProperties, SynthesizedConfig,
    FILE_STORAGE_CLASS, INTEGRATION_PASSWORD, INTEGRATION_USER, STORAGE_PROVIDER_CLASS,
    UPLOAD_DIR_PREFIX,
};
pub use integration::{
    artifacts_candidates, integration_for, probe_artifacts_dir, AtlasIntegration,
    DisabledIntegration, IntegrationClientFactory, ARTIFACTS_DIR_NAME, CUSTOM_CLASSPATH_LOADER,
};
pub use service::{ProcessLauncher, ProcessService, RegistryService, ServiceLauncher};
pub use storage::{adjust_directory, FileStorage, LocalFileStorage, DEFAULT_DIR};
