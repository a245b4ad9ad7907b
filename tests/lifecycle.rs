use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use registry_harness::database::RemoteConnection;
use registry_harness::server::{global, init_global, shutdown_global};
use registry_harness::{
    FileStorage, HarnessConfig, LifecycleState, RegistryService, ServiceConfiguration,
    ServiceLauncher, TestRegistryServer,
};
use serde_json::json;
use tempfile::TempDir;

const CREATE_TABLES: &str = r#"-- Copyright (c) Cloudera, Inc. All rights reserved.
-- schema metadata

CREATE TABLE IF NOT EXISTS `schema_metadata_info` (
  `id`          BIGINT AUTO_INCREMENT NOT NULL,
  `type`        VARCHAR(255) NOT NULL,
  `name`        VARCHAR(255) NOT NULL,
  `description` TEXT,
  PRIMARY KEY (`id`)
) ENGINE = InnoDB DEFAULT CHARSET = utf8;

DELIMITER //
CREATE PROCEDURE add_timestamp_column()
BEGIN
  ALTER TABLE schema_metadata_info ADD COLUMN `timestamp` BIGINT;
END //
DELIMITER ;

call add_timestamp_column();
DROP PROCEDURE IF EXISTS add_timestamp_column;
"#;

const ADD_VERSIONS: &str = r#"-- versions
CREATE TABLE IF NOT EXISTS `schema_version_info` (
  `id`                 BIGINT AUTO_INCREMENT NOT NULL,
  `schema_metadata_id` BIGINT NOT NULL,
  `version`            INT UNSIGNED NOT NULL,
  `schema_text`        TEXT NOT NULL,
  PRIMARY KEY (`id`),
  FOREIGN KEY (`schema_metadata_id`) REFERENCES `schema_metadata_info` (`id`)
) ENGINE = InnoDB DEFAULT CHARSET = utf8;

INSERT INTO `schema_metadata_info` (`id`, `type`, `name`) VALUES (1, 'avro', 'seed');
"#;

fn bootstrap_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("v001__create_schema_tables.sql"), CREATE_TABLES).unwrap();
    std::fs::write(dir.path().join("v002__add_versions.sql"), ADD_VERSIONS).unwrap();
    dir
}

fn config_for(dir: &Path) -> HarnessConfig {
    HarnessConfig {
        bootstrap_dir: Some(dir.to_string_lossy().to_string()),
        ..HarnessConfig::default()
    }
}

// =============================================================================
// Service doubles
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Behavior {
    /// Read the configuration and query the database through the endpoint
    Ready,
    /// Never become ready within the test's bound
    Hang(Duration),
    /// Report a startup failure
    Fail,
    /// The launcher itself panics before a service exists
    LaunchPanics,
}

struct FakeService {
    config_path: PathBuf,
    behavior: Behavior,
    stops: Arc<AtomicUsize>,
}

impl RegistryService for FakeService {
    fn start(&self) -> Result<()> {
        match self.behavior {
            Behavior::Ready => {
                let yaml = std::fs::read_to_string(&self.config_path)?;
                let config = ServiceConfiguration::from_yaml(&yaml)?;
                let props = &config.storage_provider_configuration.properties.properties;
                let remote = RemoteConnection::connect(props)?;
                remote.query("SELECT COUNT(*) FROM schema_metadata_info", Vec::new())?;
                Ok(())
            }
            Behavior::Hang(duration) => {
                std::thread::sleep(duration);
                Ok(())
            }
            Behavior::Fail => Err(anyhow!("address already in use")),
            Behavior::LaunchPanics => unreachable!("no service is launched"),
        }
    }

    fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeLauncher {
    behavior: Behavior,
    launches: AtomicUsize,
    stops: Arc<AtomicUsize>,
    seen: Mutex<Vec<(PathBuf, u16)>>,
}

impl FakeLauncher {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            launches: AtomicUsize::new(0),
            stops: Arc::new(AtomicUsize::new(0)),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl ServiceLauncher for FakeLauncher {
    fn launch(&self, config_path: &Path, port: u16) -> Result<Arc<dyn RegistryService>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if let Behavior::LaunchPanics = self.behavior {
            panic!("launcher crashed");
        }
        self.seen
            .lock()
            .unwrap()
            .push((config_path.to_path_buf(), port));
        Ok(Arc::new(FakeService {
            config_path: config_path.to_path_buf(),
            behavior: self.behavior,
            stops: self.stops.clone(),
        }))
    }
}

fn server_with(launcher: &Arc<FakeLauncher>, dir: &Path) -> TestRegistryServer {
    TestRegistryServer::new(config_for(dir), launcher.clone())
}

// =============================================================================
// Lifecycle
// =============================================================================

#[test]
fn test_start_and_stop() {
    let dir = bootstrap_dir();
    let launcher = FakeLauncher::new(Behavior::Ready);
    let server = server_with(&launcher, dir.path());
    assert_eq!(server.state(), LifecycleState::NotStarted);

    server.start().unwrap();
    assert_eq!(server.state(), LifecycleState::Running);
    assert_eq!(launcher.launches(), 1);

    let port = server.port().unwrap();
    let config_path = server.config_path().unwrap();
    assert!(config_path.exists());
    assert_eq!(launcher.seen.lock().unwrap()[0], (config_path.clone(), port));

    // the service sees the same database as the test
    let db_port = server.db_port().unwrap();
    let external = server.external_properties().unwrap();
    assert!(external
        .data_source_url
        .contains(&format!("tcp://localhost:{}/mem:", db_port)));
    let remote = server.remote_connection().unwrap();
    let response = remote
        .query("SELECT name FROM schema_metadata_info", Vec::new())
        .unwrap();
    assert_eq!(response.rows, vec![vec![json!("seed")]]);

    assert!(remote.is_healthy());

    let ledger_rows: i64 = server
        .connection()
        .unwrap()
        .query_row("SELECT COUNT(*) FROM SCRIPT_CHANGE_LOG", [], |row| row.get(0))
        .unwrap();
    assert_eq!(ledger_rows, 3);

    let storage = server.file_storage().unwrap();
    storage.upload(&mut &b"jar"[..], "serdes.jar").unwrap();
    let upload_dir = storage.root().to_path_buf();
    assert!(upload_dir.join("serdes.jar").exists());

    let report = server.stop();
    assert!(report.is_clean(), "{:?}", report.failures);
    assert_eq!(server.state(), LifecycleState::Stopped);
    assert_eq!(launcher.stops(), 1);
    assert!(server.port().is_none());
    assert!(!config_path.exists());
    assert!(!upload_dir.exists());
}

#[test]
fn test_concurrent_start_provisions_once() {
    let dir = bootstrap_dir();
    let launcher = FakeLauncher::new(Behavior::Hang(Duration::from_millis(300)));
    let server = Arc::new(server_with(&launcher, dir.path()));
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let server = server.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                server.start()
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert_eq!(launcher.launches(), 1);
    assert_eq!(server.state(), LifecycleState::Running);

    // a single database endpoint, and it is the one the service was configured with
    let db_port = server.db_port().unwrap();
    let (config_path, _) = launcher.seen.lock().unwrap()[0].clone();
    let config =
        ServiceConfiguration::from_yaml(&std::fs::read_to_string(config_path).unwrap()).unwrap();
    assert!(config
        .storage_provider_configuration
        .properties
        .properties
        .data_source_url
        .contains(&format!("tcp://localhost:{}/", db_port)));

    // repeated start while running is a no-op
    server.start().unwrap();
    assert_eq!(launcher.launches(), 1);

    server.stop();
}

#[test]
fn test_startup_timeout() {
    let dir = bootstrap_dir();
    let launcher = FakeLauncher::new(Behavior::Hang(Duration::from_secs(5)));
    let server =
        server_with(&launcher, dir.path()).with_startup_timeout(Duration::from_millis(200));

    let err = server.start().unwrap_err();
    assert!(err.is_timeout(), "{}", err);
    assert_ne!(server.state(), LifecycleState::Running);
    assert_eq!(server.state(), LifecycleState::Stopped);
    assert_eq!(launcher.stops(), 1);
    assert!(server.port().is_none());

    // nothing left to tear down
    assert_eq!(server.stop().steps_run(), 0);
}

#[test]
fn test_service_failure_is_reported() {
    let dir = bootstrap_dir();
    let launcher = FakeLauncher::new(Behavior::Fail);
    let server = server_with(&launcher, dir.path());

    let err = server.start().unwrap_err();
    assert!(matches!(err, registry_harness::HarnessError::ServiceFailed(_)));
    assert!(err.to_string().contains("address already in use"));
    assert_eq!(server.state(), LifecycleState::Stopped);
}

#[test]
fn test_two_cycles_get_fresh_resources() {
    let dir = bootstrap_dir();
    let launcher = FakeLauncher::new(Behavior::Ready);
    let server = server_with(&launcher, dir.path());

    server.start().unwrap();
    let first_port = server.port().unwrap();
    let first_config = server.config_path().unwrap();
    let first_upload = server.service_configuration().unwrap().upload_dir();
    assert!(server.stop().is_clean());

    server.start().unwrap();
    let second_port = server.port().unwrap();
    let second_config = server.config_path().unwrap();
    let second_upload = server.service_configuration().unwrap().upload_dir();

    assert_ne!(first_port, second_port);
    assert_ne!(first_config, second_config);
    assert_ne!(first_upload, second_upload);
    assert_eq!(launcher.launches(), 2);

    assert!(server.stop().is_clean());
}

#[test]
fn test_cleanup_db_restores_seeded_schema() {
    let dir = bootstrap_dir();
    let launcher = FakeLauncher::new(Behavior::Ready);
    let server = server_with(&launcher, dir.path());
    server.start().unwrap();

    let remote = server.remote_connection().unwrap();
    remote
        .execute("INSERT INTO schema_metadata_info (id, type, name) VALUES (2, 'json', 'orders')")
        .unwrap();

    let report = server.cleanup_db().unwrap();
    assert_eq!(report.applied, vec!["001".to_string(), "002".to_string()]);

    let names = remote
        .query("SELECT name FROM schema_metadata_info ORDER BY id", Vec::new())
        .unwrap();
    assert_eq!(names.rows, vec![vec![json!("seed")]]);
    assert_eq!(server.state(), LifecycleState::Running);

    server.stop();
}

#[test]
fn test_cleanup_db_with_open_reader() {
    let dir = bootstrap_dir();
    let launcher = FakeLauncher::new(Behavior::Ready);
    let server = server_with(&launcher, dir.path());
    server.start().unwrap();

    let reader = server.connection().unwrap();
    let mut stmt = reader
        .prepare("SELECT name FROM schema_metadata_info")
        .unwrap();
    let mut rows = stmt.query([]).unwrap();
    let first: String = rows.next().unwrap().unwrap().get(0).unwrap();
    assert_eq!(first, "seed");

    // the reader is still positioned inside its result set
    let report = server.cleanup_db().unwrap();
    assert_eq!(report.applied.len(), 2);

    assert!(rows.next().unwrap().is_none());
    drop(rows);
    drop(stmt);
    drop(reader);

    let count: i64 = server
        .connection()
        .unwrap()
        .query_row("SELECT COUNT(*) FROM schema_metadata_info", [], |row| {
            row.get(0)
        })
        .unwrap();
    assert_eq!(count, 1);

    assert!(server.stop().is_clean());
}

#[test]
fn test_concurrent_database_access() {
    let dir = bootstrap_dir();
    let launcher = FakeLauncher::new(Behavior::Ready);
    let server = Arc::new(server_with(&launcher, dir.path()));
    server.start().unwrap();
    let db_port = server.db_port().unwrap();

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let server = server.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                server
                    .connection()
                    .unwrap()
                    .execute(
                        "INSERT INTO schema_metadata_info (id, type, name) VALUES (?1, 'avro', ?2)",
                        rusqlite::params![10 + i as i64, format!("schema-{}", i)],
                    )
                    .unwrap();

                let remote = server.remote_connection().unwrap();
                remote
                    .execute(&format!(
                        "INSERT INTO schema_version_info (id, schema_metadata_id, version, schema_text) \
                         VALUES ({}, {}, 1, '{{}}')",
                        10 + i,
                        10 + i
                    ))
                    .unwrap();
                let response = remote
                    .query("SELECT COUNT(*) FROM schema_metadata_info", Vec::new())
                    .unwrap();
                assert_eq!(response.rows.len(), 1);
                server.db_port()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), Some(db_port));
    }

    let conn = server.connection().unwrap();
    let schemas: i64 = conn
        .query_row("SELECT COUNT(*) FROM schema_metadata_info", [], |row| {
            row.get(0)
        })
        .unwrap();
    let versions: i64 = conn
        .query_row("SELECT COUNT(*) FROM schema_version_info", [], |row| {
            row.get(0)
        })
        .unwrap();
    assert_eq!(schemas, 1 + threads as i64);
    assert_eq!(versions, threads as i64);
    drop(conn);

    assert_eq!(server.db_port(), Some(db_port));
    assert!(server.stop().is_clean());
}

#[test]
fn test_start_inside_async_runtime() {
    let dir = bootstrap_dir();
    let launcher = FakeLauncher::new(Behavior::Ready);
    let server = server_with(&launcher, dir.path());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        server.start().unwrap();
        assert_eq!(server.state(), LifecycleState::Running);
        assert!(server.db_port().is_some());
        assert!(server.stop().is_clean());
    });
    assert_eq!(server.state(), LifecycleState::Stopped);
    assert_eq!(launcher.launches(), 1);
}

#[test]
fn test_launcher_panic_is_reported() {
    let dir = bootstrap_dir();
    let launcher = FakeLauncher::new(Behavior::LaunchPanics);
    let server = server_with(&launcher, dir.path());

    let err = server.start().unwrap_err();
    assert!(matches!(err, registry_harness::HarnessError::ServiceFailed(_)));
    assert!(err.to_string().contains("launcher crashed"), "{}", err);
    assert_eq!(server.state(), LifecycleState::Stopped);
    assert!(server.db_port().is_none());

    // the failed attempt does not leave the instance marked as started
    assert!(server.start().is_err());
    assert_eq!(launcher.launches(), 2);
}

#[test]
fn test_stop_before_start_is_safe() {
    let dir = bootstrap_dir();
    let launcher = FakeLauncher::new(Behavior::Ready);
    let server = server_with(&launcher, dir.path());

    let report = server.stop();
    assert!(report.is_clean());
    assert_eq!(report.steps_run(), 0);
    assert_eq!(server.state(), LifecycleState::NotStarted);
    assert!(server.cleanup_db().is_err());
}

// =============================================================================
// Start failures
// =============================================================================

#[test]
fn test_missing_bootstrap_dir_is_setup_error() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = FakeLauncher::new(Behavior::Ready);
    let server = server_with(&launcher, &dir.path().join("missing"));

    let err = server.start().unwrap_err();
    assert!(err.is_setup(), "{}", err);
    assert_eq!(server.state(), LifecycleState::NotStarted);
    assert_eq!(launcher.launches(), 0);
}

#[test]
fn test_broken_script_is_migration_error() {
    let dir = bootstrap_dir();
    std::fs::write(
        dir.path().join("v003__broken.sql"),
        "CREATE TABLE half_done (id INTEGER;\n",
    )
    .unwrap();
    let launcher = FakeLauncher::new(Behavior::Ready);
    let server = server_with(&launcher, dir.path());

    let err = server.start().unwrap_err();
    assert!(err.is_migration(), "{}", err);
    assert!(err.to_string().contains("003"));
    assert_eq!(server.state(), LifecycleState::NotStarted);
    assert_eq!(launcher.launches(), 0);
}

#[test]
fn test_integration_without_artifacts_is_setup_error() {
    let dir = bootstrap_dir();
    let artifacts = tempfile::tempdir().unwrap();
    let mut config = config_for(dir.path());
    config.integration_artifacts_dir = Some(
        artifacts
            .path()
            .join("atlasJars")
            .to_string_lossy()
            .to_string(),
    );
    let launcher = FakeLauncher::new(Behavior::Ready);
    let server = TestRegistryServer::new(config, launcher.clone()).with_integration(21000);
    assert!(server.is_integration_enabled());
    assert_eq!(server.integration_port(), Some(21000));

    let err = server.start().unwrap_err();
    assert!(err.is_setup(), "{}", err);
    assert_eq!(launcher.launches(), 0);
}

#[test]
fn test_integration_written_into_configuration() {
    let dir = bootstrap_dir();
    let artifacts = tempfile::tempdir().unwrap();
    let mut config = config_for(dir.path());
    config.integration_artifacts_dir = Some(artifacts.path().to_string_lossy().to_string());

    let launcher = FakeLauncher::new(Behavior::Ready);
    let server = TestRegistryServer::new(config, launcher.clone());
    server.set_integration_enabled(true).unwrap();
    server.set_integration_port(21000).unwrap();
    server.start().unwrap();

    let integration = server.service_configuration().unwrap().atlas_configuration;
    assert!(integration.enabled);
    assert_eq!(integration.atlas_urls, vec!["http://localhost:21000".to_string()]);
    assert!(integration.custom_classpath.is_some());

    // settings are frozen once started
    assert!(server.set_integration_enabled(false).is_err());
    assert!(server.set_integration_port(1).is_err());

    server.stop();
    server.set_integration_enabled(false).unwrap();
}

// =============================================================================
// Shared instance
// =============================================================================

#[test]
fn test_global_instance() {
    let dir = bootstrap_dir();
    let launcher = FakeLauncher::new(Behavior::Ready);
    let created = AtomicUsize::new(0);

    let first = init_global(|| {
        created.fetch_add(1, Ordering::SeqCst);
        server_with(&launcher, dir.path())
    });
    let second = init_global(|| {
        created.fetch_add(1, Ordering::SeqCst);
        server_with(&launcher, dir.path())
    });
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(created.load(Ordering::SeqCst), 1);

    first.start().unwrap();
    assert!(global().unwrap().state().is_running());
    let config_path = first.config_path().unwrap();
    let upload_dir = first.service_configuration().unwrap().upload_dir();
    assert!(config_path.exists());
    assert!(upload_dir.is_dir());

    let report = shutdown_global().unwrap();
    assert!(report.is_clean());
    assert!(global().is_none());
    assert_eq!(first.state(), LifecycleState::Stopped);
    assert!(!config_path.exists());
    assert!(!upload_dir.exists());
}
