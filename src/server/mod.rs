//! Test registry lifecycle
//!
//! [`TestRegistryServer`] stands up one complete registry instance for a test process:
//!
//! ```text
//! start():  embedded database + endpoint
//!             → preprocess + migrate bootstrap scripts
//!             → allocate service port
//!             → synthesize configuration, write registry*.yaml
//!             → launch service on the worker pool, wait (bounded) for readiness
//! stop():   service → database endpoint → worker pool → database → temp files
//! ```
//!
//! Only the first of several concurrent `start()` callers provisions anything; the others
//! return immediately. `stop()` never fails: every step runs and failures are reported
//! in the returned [`TeardownReport`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use registry_harness::{HarnessConfig, ProcessLauncher, TestRegistryServer};
//!
//! let config = HarnessConfig::new(&None)?;
//! let server = TestRegistryServer::from_config(config)?;
//! server.start()?;
//!
//! let port = server.port();
//! // ... exercise the registry ...
//!
//! server.cleanup_db()?;   // between test cases
//! server.stop();
//! ```

mod global;
mod state;
mod teardown;

pub use global::{global, init_global, shutdown_global};
pub use state::LifecycleState;
pub use teardown::{Teardown, TeardownReport};

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use tempfile::TempPath;
use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::database::{DbConnectionProperties, EmbeddedDatabase, PooledConn, RemoteConnection};
use crate::error::HarnessError;
use crate::migration::{
    find_bootstrap_dir, MigrateReport, Migrator, PreprocessRules, Preprocessor, SanitizedScripts,
};
use crate::ports::find_free_port;
use crate::registry::{
    integration_for, ConfigSynthesizer, LocalFileStorage, ProcessLauncher, RegistryService,
    ServiceConfiguration, ServiceLauncher, SynthesizedConfig,
};
use teardown::panic_message;

/// Name prefix of the startup worker threads
pub const WORKER_THREAD_PREFIX: &str = "sr-";

#[derive(Debug, Clone, Copy, Default)]
struct IntegrationSettings {
    enabled: bool,
    port: Option<u16>,
}

/// Resources of one provisioned instance
struct Instance {
    db: EmbeddedDatabase,
    external: DbConnectionProperties,
    migrator: Migrator,
    db_port: u16,
    service_port: u16,
    synthesized: SynthesizedConfig,
    artifact: TempPath,
    service: Option<Arc<dyn RegistryService>>,
    workers: Option<rayon::ThreadPool>,
    sanitized: SanitizedScripts,
}

/// One ephemeral registry instance with its database
pub struct TestRegistryServer {
    config: HarnessConfig,
    launcher: Arc<dyn ServiceLauncher>,
    startup_timeout: Duration,
    started: AtomicBool,
    state: Mutex<LifecycleState>,
    integration: Mutex<IntegrationSettings>,
    instance: Mutex<Option<Instance>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TestRegistryServer {
    pub fn new(config: HarnessConfig, launcher: Arc<dyn ServiceLauncher>) -> Self {
        let startup_timeout = config.startup_timeout();
        Self {
            config,
            launcher,
            startup_timeout,
            started: AtomicBool::new(false),
            state: Mutex::new(LifecycleState::NotStarted),
            integration: Mutex::new(IntegrationSettings::default()),
            instance: Mutex::new(None),
        }
    }

    /// Instance launching the configured `service_command`
    pub fn from_config(config: HarnessConfig) -> Result<Self, HarnessError> {
        let launcher = ProcessLauncher::from_config(&config)
            .ok_or_else(|| HarnessError::setup("No service_command configured"))?;
        Ok(Self::new(config, Arc::new(launcher)))
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Enable the catalog integration against a catalog on `port`
    pub fn with_integration(self, port: u16) -> Self {
        *lock(&self.integration) = IntegrationSettings {
            enabled: true,
            port: Some(port),
        };
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }

    pub fn state(&self) -> LifecycleState {
        *lock(&self.state)
    }

    fn set_state(&self, state: LifecycleState) {
        let mut current = lock(&self.state);
        debug!("Registry lifecycle: {} -> {}", *current, state);
        *current = state;
    }

    // =========================================================================
    // Start
    // =========================================================================

    /// Provision everything and start the service
    ///
    /// Returns once the service is ready. A concurrent or repeated call while an instance
    /// is starting or running is a no-op.
    pub fn start(&self) -> Result<(), HarnessError> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Registry already started");
            return Ok(());
        }

        let state = self.state();
        if !state.can_start() {
            self.started.store(false, Ordering::Release);
            return Err(HarnessError::setup(format!(
                "Registry cannot start while {}",
                state
            )));
        }

        let begin = Instant::now();
        self.set_state(LifecycleState::Starting);

        let provisioned = catch_unwind(AssertUnwindSafe(|| self.provision()))
            .unwrap_or_else(|panic| {
                Err(HarnessError::setup(format!(
                    "Provisioning panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });
        let mut instance = match provisioned {
            Ok(instance) => instance,
            Err(e) => {
                self.set_state(LifecycleState::NotStarted);
                self.started.store(false, Ordering::Release);
                return Err(e);
            }
        };

        let launched = catch_unwind(AssertUnwindSafe(|| self.launch(&mut instance)))
            .unwrap_or_else(|panic| {
                Err(HarnessError::ServiceFailed(format!(
                    "launcher panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });
        match launched {
            Ok(()) => {
                info!(
                    "Registry running on port {} (database port {}) after {:.1}s",
                    instance.service_port,
                    instance.db_port,
                    begin.elapsed().as_secs_f64()
                );
                *lock(&self.instance) = Some(instance);
                self.set_state(LifecycleState::Running);
                Ok(())
            }
            Err(e) => {
                warn!("Registry start failed: {}", e);
                self.set_state(LifecycleState::Stopping);
                let report = teardown(instance);
                if !report.is_clean() {
                    warn!("{} teardown steps failed", report.failures.len());
                }
                self.set_state(LifecycleState::Stopped);
                self.started.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    fn provision(&self) -> Result<Instance, HarnessError> {
        let mut db = EmbeddedDatabase::start()?;
        let external = db.open_endpoint()?;
        let db_port = db
            .tcp_port()
            .ok_or_else(|| HarnessError::setup("Database endpoint has no port"))?;

        let bootstrap = find_bootstrap_dir(
            self.config.bootstrap_dir.as_deref().map(Path::new),
            &self.config.db_type,
        )?;
        let preprocessor = Preprocessor::new(PreprocessRules::from_config(&self.config))
            .map_err(|e| HarnessError::setup(e.to_string()))?;
        let sanitized = preprocessor
            .process_dir(&bootstrap)
            .map_err(|e| HarnessError::setup(e.to_string()))?;

        let migrator = Migrator::new(sanitized.path()).with_prefix(&self.config.script_prefix);
        let report = migrator.migrate(db.anchor())?;
        info!(
            "Schema migrated to version {} ({} scripts applied)",
            report.current_version.as_deref().unwrap_or("none"),
            report.applied.len()
        );

        let service_port = find_free_port()?;

        let settings = *lock(&self.integration);
        let integration_port = match (settings.enabled, settings.port) {
            (true, None) => {
                return Err(HarnessError::setup(
                    "Integration is enabled but no integration port is set",
                ))
            }
            (_, port) => port.unwrap_or_default(),
        };
        let integration = integration_for(
            settings.enabled,
            integration_port,
            self.config.integration_artifacts_dir.as_deref(),
        );

        let synthesized = ConfigSynthesizer::from_config(&self.config).synthesize(
            &external,
            integration.as_ref(),
            service_port,
        )?;
        let artifact = synthesized
            .write_artifact()
            .map_err(|e| HarnessError::setup(e.to_string()))?;

        Ok(Instance {
            db,
            external,
            migrator,
            db_port,
            service_port,
            synthesized,
            artifact,
            service: None,
            workers: None,
            sanitized,
        })
    }

    fn launch(&self, instance: &mut Instance) -> Result<(), HarnessError> {
        let service = self
            .launcher
            .launch(&instance.artifact, instance.service_port)
            .map_err(|e| HarnessError::ServiceFailed(e.to_string()))?;
        instance.service = Some(service.clone());

        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .thread_name(|i| format!("{}{}", WORKER_THREAD_PREFIX, i))
            .build()
            .map_err(|e| HarnessError::setup(format!("Failed to create worker pool: {}", e)))?;

        let (tx, rx) = mpsc::channel();
        workers.spawn(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| service.start()));
            // the receiver is gone once start() has timed out
            let _ = tx.send(outcome);
        });
        instance.workers = Some(workers);

        match rx.recv_timeout(self.startup_timeout) {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(HarnessError::ServiceFailed(e.to_string())),
            Ok(Err(panic)) => Err(HarnessError::ServiceFailed(panic_message(panic.as_ref()))),
            Err(RecvTimeoutError::Timeout) => Err(HarnessError::StartupTimeout(self.startup_timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(HarnessError::ServiceFailed(
                "startup worker exited without a result".to_string(),
            )),
        }
    }

    // =========================================================================
    // Stop
    // =========================================================================

    /// Tear everything down; safe to call in any state
    pub fn stop(&self) -> TeardownReport {
        let instance = lock(&self.instance).take();
        let Some(instance) = instance else {
            debug!("Registry stop: nothing to tear down ({})", self.state());
            return TeardownReport::default();
        };

        self.set_state(LifecycleState::Stopping);
        let report = teardown(instance);
        self.set_state(LifecycleState::Stopped);
        self.started.store(false, Ordering::Release);

        info!(
            "Registry stopped ({} steps, {} failed)",
            report.steps_run(),
            report.failures.len()
        );
        report
    }

    /// Drop all schema objects and migrate again, keeping the service running
    pub fn cleanup_db(&self) -> Result<MigrateReport, HarnessError> {
        info!("Cleaning up the database ...");
        let guard = lock(&self.instance);
        let instance = guard
            .as_ref()
            .ok_or_else(|| HarnessError::setup("Registry is not running"))?;
        Ok(instance.migrator.reset(instance.db.anchor())?)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Port of the database endpoint while running
    pub fn db_port(&self) -> Option<u16> {
        lock(&self.instance).as_ref().map(|i| i.db_port)
    }

    /// Port of the registry service while running
    pub fn port(&self) -> Option<u16> {
        lock(&self.instance).as_ref().map(|i| i.service_port)
    }

    pub fn is_integration_enabled(&self) -> bool {
        lock(&self.integration).enabled
    }

    pub fn integration_port(&self) -> Option<u16> {
        lock(&self.integration).port
    }

    fn ensure_not_started(&self) -> Result<(), HarnessError> {
        if self.started.load(Ordering::Acquire) {
            return Err(HarnessError::setup(
                "Integration settings must be changed before start()",
            ));
        }
        Ok(())
    }

    pub fn set_integration_enabled(&self, enabled: bool) -> Result<(), HarnessError> {
        self.ensure_not_started()?;
        lock(&self.integration).enabled = enabled;
        Ok(())
    }

    pub fn set_integration_port(&self, port: u16) -> Result<(), HarnessError> {
        self.ensure_not_started()?;
        lock(&self.integration).port = Some(port);
        Ok(())
    }

    /// Pooled connection to the embedded database
    pub fn connection(&self) -> Result<PooledConn, HarnessError> {
        lock(&self.instance)
            .as_ref()
            .ok_or_else(|| HarnessError::setup("Registry is not running"))?
            .db
            .connection()
    }

    /// Connection properties for in-process access
    pub fn local_properties(&self) -> Option<DbConnectionProperties> {
        lock(&self.instance)
            .as_ref()
            .map(|i| i.db.local_properties().clone())
    }

    /// Connection properties handed to the service
    pub fn external_properties(&self) -> Option<DbConnectionProperties> {
        lock(&self.instance).as_ref().map(|i| i.external.clone())
    }

    /// Client for the database endpoint, as the service sees it
    pub fn remote_connection(&self) -> anyhow::Result<RemoteConnection> {
        let props = self
            .external_properties()
            .ok_or_else(|| anyhow!("Registry is not running"))?;
        RemoteConnection::connect(&props)
    }

    /// Path of the configuration artifact the service was started with
    pub fn config_path(&self) -> Option<PathBuf> {
        lock(&self.instance).as_ref().map(|i| i.artifact.to_path_buf())
    }

    pub fn service_configuration(&self) -> Option<ServiceConfiguration> {
        lock(&self.instance)
            .as_ref()
            .map(|i| i.synthesized.configuration.clone())
    }

    /// The service's upload directory as file storage
    pub fn file_storage(&self) -> anyhow::Result<LocalFileStorage> {
        let configuration = self
            .service_configuration()
            .ok_or_else(|| anyhow!("Registry is not running"))?;
        LocalFileStorage::from_config(&configuration.file_storage_configuration)
    }
}

impl Drop for TestRegistryServer {
    fn drop(&mut self) {
        let instance = self
            .instance
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(instance) = instance {
            teardown(instance);
        }
    }
}

/// Release an instance, one isolated step per resource
fn teardown(instance: Instance) -> TeardownReport {
    let Instance {
        db,
        service,
        workers,
        synthesized,
        artifact,
        sanitized,
        ..
    } = instance;

    let db = Arc::new(Mutex::new(Some(db)));
    let endpoint_db = db.clone();

    Teardown::new()
        .step("stop registry service", move || match service {
            Some(service) => service.stop(),
            None => Ok(()),
        })
        .step("stop database endpoint", move || {
            match lock(&endpoint_db).as_mut() {
                Some(db) => db.shutdown_endpoint(),
                None => Ok(()),
            }
        })
        .step("shut down worker pool", move || {
            drop(workers);
            Ok(())
        })
        .step("close database", move || match lock(&db).take() {
            Some(db) => db.close(),
            None => Ok(()),
        })
        .step("remove configuration artifact", move || {
            artifact
                .close()
                .map_err(|e| anyhow!("Failed to remove configuration artifact: {}", e))
        })
        .step("remove scratch directories", move || {
            synthesized.close()?;
            sanitized.close()
        })
        .run()
}
