//! Process-wide registry instance
//!
//! Test suites usually share one registry per process. The handle is created explicitly
//! with [`init_global`] and torn down with [`shutdown_global`]; a later `init_global`
//! creates a fresh instance.
//!
//! Statics are never dropped. An instance that is not released through
//! [`shutdown_global`] keeps its service running and leaves its scratch directory,
//! configuration file and database file behind when the process exits, so suites must
//! call it from their teardown.

use std::sync::{Arc, Mutex, OnceLock};

use tracing::info;

use super::{lock, TeardownReport, TestRegistryServer};

static GLOBAL: OnceLock<Mutex<Option<Arc<TestRegistryServer>>>> = OnceLock::new();

fn slot() -> &'static Mutex<Option<Arc<TestRegistryServer>>> {
    GLOBAL.get_or_init(|| Mutex::new(None))
}

/// The shared instance, created by `create` on first use
///
/// Concurrent callers all receive the same instance; `create` runs at most once per
/// initialization.
pub fn init_global<F>(create: F) -> Arc<TestRegistryServer>
where
    F: FnOnce() -> TestRegistryServer,
{
    let mut guard = lock(slot());
    match guard.as_ref() {
        Some(server) => server.clone(),
        None => {
            let server = Arc::new(create());
            *guard = Some(server.clone());
            server
        }
    }
}

/// The shared instance, if initialized
pub fn global() -> Option<Arc<TestRegistryServer>> {
    lock(slot()).clone()
}

/// Stop and release the shared instance
///
/// Removes the instance's scratch directory and configuration artifact. Nothing does
/// this at process exit.
pub fn shutdown_global() -> Option<TeardownReport> {
    let server = lock(slot()).take()?;
    let report = server.stop();
    info!("Shared registry instance released");
    Some(report)
}
