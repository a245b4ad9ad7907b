//! The dependent registry service
//!
//! The orchestrator only needs two things from the service: a blocking `start()` that
//! returns once the service is ready, and a `stop()`. [`ServiceLauncher`] builds a service
//! for a given configuration artifact and port. [`ProcessLauncher`] runs an external
//! command; tests supply in-process doubles.

use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::{debug, info, warn};

use crate::config::HarnessConfig;

/// A registry service instance
pub trait RegistryService: Send + Sync {
    /// Start the service and block until it is ready to serve requests
    fn start(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;
}

/// Creates a service for a configuration artifact and a listen port
pub trait ServiceLauncher: Send + Sync {
    fn launch(&self, config_path: &Path, port: u16) -> Result<Arc<dyn RegistryService>>;
}

// =============================================================================
// External process
// =============================================================================

const CONFIG_PLACEHOLDER: &str = "{config}";
const PORT_PLACEHOLDER: &str = "{port}";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

/// Launches the registry as a child process from a command template
///
/// `{config}` and `{port}` in the template are replaced by the artifact path and the
/// service port. Arguments are split on whitespace; no shell is involved.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    command: String,
    poll_interval: Duration,
}

impl ProcessLauncher {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Launcher for the configured `service_command`, if any
    pub fn from_config(config: &HarnessConfig) -> Option<Self> {
        config.service_command.as_deref().map(Self::new)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The command line for one launch
    pub fn render(&self, config_path: &Path, port: u16) -> Vec<String> {
        let config = config_path.to_string_lossy();
        let port = port.to_string();
        self.command
            .split_whitespace()
            .map(|arg| {
                arg.replace(CONFIG_PLACEHOLDER, &config)
                    .replace(PORT_PLACEHOLDER, &port)
            })
            .collect()
    }
}

impl ServiceLauncher for ProcessLauncher {
    fn launch(&self, config_path: &Path, port: u16) -> Result<Arc<dyn RegistryService>> {
        let mut argv = self.render(config_path, port).into_iter();
        let program = argv
            .next()
            .ok_or_else(|| anyhow!("Service command is empty"))?;

        Ok(Arc::new(ProcessService {
            program,
            args: argv.collect(),
            port,
            poll_interval: self.poll_interval,
            child: Mutex::new(None),
        }))
    }
}

/// A registry running as a child process
pub struct ProcessService {
    program: String,
    args: Vec<String>,
    port: u16,
    poll_interval: Duration,
    child: Mutex<Option<Child>>,
}

impl ProcessService {
    fn port_open(&self) -> bool {
        let addr = SocketAddr::from(([127, 0, 0, 1], self.port));
        TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).is_ok()
    }

    fn lock_child(&self) -> Result<std::sync::MutexGuard<'_, Option<Child>>> {
        self.child
            .lock()
            .map_err(|_| anyhow!("Service process state is poisoned"))
    }
}

impl RegistryService for ProcessService {
    fn start(&self) -> Result<()> {
        {
            let mut child = self.lock_child()?;
            if child.is_some() {
                return Err(anyhow!("Service process already started"));
            }
            info!("Starting registry: {} {}", self.program, self.args.join(" "));
            let spawned = Command::new(&self.program)
                .args(&self.args)
                .stdin(Stdio::null())
                .spawn()
                .map_err(|e| anyhow!("Failed to spawn '{}': {}", self.program, e))?;
            *child = Some(spawned);
        }

        loop {
            {
                let mut guard = self.lock_child()?;
                let child = guard
                    .as_mut()
                    .ok_or_else(|| anyhow!("Service process was stopped during startup"))?;
                if let Some(status) = child.try_wait()? {
                    *guard = None;
                    return Err(anyhow!(
                        "Service process exited before becoming ready ({})",
                        status
                    ));
                }
            }

            if self.port_open() {
                info!("Registry is accepting connections on port {}", self.port);
                return Ok(());
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    fn stop(&self) -> Result<()> {
        let child = self.lock_child()?.take();
        match child {
            Some(mut child) => {
                if let Err(e) = child.kill() {
                    warn!("Failed to kill service process {}: {}", child.id(), e);
                }
                let status = child.wait()?;
                debug!("Service process exited with {}", status);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for ProcessService {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.child.lock() {
            if let Some(mut child) = guard.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}
