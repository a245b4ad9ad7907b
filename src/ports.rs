//! Free port allocation
//!
//! Ports are obtained by binding `127.0.0.1:0` and reading back the OS-assigned port.
//! Every port handed out is remembered for the lifetime of the process, so two
//! consecutive allocations never return the same number even if the OS recycles it.

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::{Mutex, OnceLock};

use tracing::debug;

use crate::error::HarnessError;

const MAX_ATTEMPTS: usize = 64;

static ISSUED_PORTS: OnceLock<Mutex<HashSet<u16>>> = OnceLock::new();

/// Find an unused TCP port on the loopback interface
pub fn find_free_port() -> Result<u16, HarnessError> {
    let issued = ISSUED_PORTS.get_or_init(|| Mutex::new(HashSet::new()));

    for _ in 0..MAX_ATTEMPTS {
        let port = TcpListener::bind(("127.0.0.1", 0))
            .and_then(|listener| listener.local_addr())
            .map(|addr| addr.port())
            .map_err(|e| HarnessError::setup(format!("Failed to bind a free port: {}", e)))?;

        let mut issued = issued.lock().unwrap_or_else(|e| e.into_inner());
        if issued.insert(port) {
            debug!("Allocated free port {}", port);
            return Ok(port);
        }
    }

    Err(HarnessError::setup(format!(
        "No previously unused port found after {} attempts",
        MAX_ATTEMPTS
    )))
}
