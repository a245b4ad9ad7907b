//! Database module
//!
//! Everything the harness needs to stand up and reach its database:
//!
//! - **properties**: connection URLs and `DbConnectionProperties`
//! - **embedded**: the in-process provisioner (WAL database file, anchor connection, r2d2 pool)
//! - **endpoint**: the network endpoint and its blocking client
//! - **connection**: standalone connections to database files (CLI)
//!
//! # Architecture
//!
//! ```text
//! test code ──pool──▶ EmbeddedDatabase ◀──anchor (keeps it alive)
//!                            │
//!                       DbEndpoint (127.0.0.1:<ephemeral>)
//!                            ▲
//! registry service ── RemoteConnection (sqlite:tcp://localhost:<port>/mem:<name>)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use registry_harness::database::{EmbeddedDatabase, RemoteConnection};
//!
//! let mut db = EmbeddedDatabase::start()?;
//! let external = db.open_endpoint()?;
//!
//! let remote = RemoteConnection::connect(&external)?;
//! remote.execute("CREATE TABLE topics (name TEXT)")?;
//! ```

mod connection;
mod embedded;
mod endpoint;
mod properties;

pub use connection::DatabaseConn;
pub use embedded::{
    checkout, DbPool, EmbeddedDatabase, PooledConn, BUSY_TIMEOUT, LIVENESS_QUERY, POOL_MAX_SIZE,
    POOL_MIN_IDLE,
};
pub use endpoint::{
    execute_query, DbEndpoint, QueryRequest, QueryResponse, RemoteConnection, ENDPOINT_HOST,
};
pub use properties::{
    connection_url, tcp_location, DbConnectionProperties, DbLocation, DbUrl, DEFAULT_PASSWORD,
    DEFAULT_USER, DRIVER_NAME, MEMORY_LOCATION, URL_OPTIONS, URL_SCHEME,
};

// =============================================================================
// Helper function
// =============================================================================

/// Ensure the parent directory of a database file exists
pub fn ensure_parent_dir(path: &str) -> anyhow::Result<()> {
    match std::path::Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent)
            .map_err(|e| anyhow::anyhow!("Failed to create directory '{}': {}", parent.display(), e)),
        _ => Ok(()),
    }
}
