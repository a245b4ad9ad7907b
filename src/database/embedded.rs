//! Embedded database provisioner
//!
//! Starts a uniquely named SQLite database in a private scratch directory, keeps it open
//! with an anchor connection, and hands out pooled connections to it.
//! [`EmbeddedDatabase::open_endpoint`] additionally serves the same database over the
//! network for out-of-process clients.
//!
//! The database runs in WAL mode: readers see the last committed state and never wait on
//! a writer, and concurrent writers queue on the busy timeout. Pooled connections, the
//! endpoint and the anchor can therefore be used from any number of test threads at once.

use std::time::Duration;

use anyhow::{anyhow, Result};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tempfile::TempDir;
use tracing::{debug, info};

use crate::database::endpoint::{DbEndpoint, ENDPOINT_HOST};
use crate::database::properties::DbConnectionProperties;
use crate::error::HarnessError;

/// Upper bound of pooled connections
pub const POOL_MAX_SIZE: u32 = 30;

/// Idle connections the pool keeps open
pub const POOL_MIN_IDLE: u32 = 2;

/// Liveness query run on checkout
pub const LIVENESS_QUERY: &str = "SELECT 1";

/// How long a writer waits for another writer before giving up
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

pub type DbPool = r2d2::Pool<SqliteConnectionManager>;
pub type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

fn configure(conn: &Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")
}

/// Check out a pooled connection that answers the liveness query
pub fn checkout(pool: &DbPool) -> Result<PooledConn, HarnessError> {
    let conn = pool
        .get()
        .map_err(|e| HarnessError::setup(format!("Failed to get pooled connection: {}", e)))?;
    conn.query_row(LIVENESS_QUERY, [], |_| Ok(()))
        .map_err(|e| HarnessError::setup(format!("Pooled connection is not alive: {}", e)))?;
    Ok(conn)
}

/// A running embedded database
pub struct EmbeddedDatabase {
    name: String,
    local: DbConnectionProperties,
    external: Option<DbConnectionProperties>,
    pool: DbPool,
    endpoint: Option<DbEndpoint>,
    anchor: Connection,
    // Dropped last, after every connection to the file is gone
    dir: TempDir,
}

impl EmbeddedDatabase {
    /// Start a database with a fresh unique name
    pub fn start() -> Result<Self, HarnessError> {
        let name = format!("registry-{}", uuid::Uuid::new_v4().simple());
        Self::start_named(&name)
    }

    /// Start a database under a caller-chosen name
    pub fn start_named(name: &str) -> Result<Self, HarnessError> {
        let local = DbConnectionProperties::in_memory(name);
        let url = local
            .parsed_url()
            .map_err(|e| HarnessError::setup(format!("Invalid database URL: {}", e)))?;

        let dir = tempfile::Builder::new()
            .prefix("registry-db")
            .tempdir()
            .map_err(|e| HarnessError::setup(format!("Failed to create database directory: {}", e)))?;
        let path = dir.path().join(url.file_name());

        let anchor = Connection::open(&path)
            .and_then(|conn| {
                conn.pragma_update(None, "journal_mode", "WAL")?;
                configure(&conn)?;
                Ok(conn)
            })
            .map_err(|e| {
                HarnessError::setup(format!("Failed to start embedded database '{}': {}", name, e))
            })?;

        let manager = SqliteConnectionManager::file(&path).with_init(|conn| configure(conn));
        let pool = r2d2::Pool::builder()
            .max_size(POOL_MAX_SIZE)
            .min_idle(Some(POOL_MIN_IDLE))
            .test_on_check_out(true)
            .connection_timeout(POOL_CONNECTION_TIMEOUT)
            .build(manager)
            .map_err(|e| {
                HarnessError::setup(format!("Failed to create connection pool: {}", e))
            })?;

        info!("Started embedded database {} at {}", name, path.display());
        Ok(Self {
            name: name.to_string(),
            local,
            external: None,
            pool,
            endpoint: None,
            anchor,
            dir,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Properties for in-process use
    pub fn local_properties(&self) -> &DbConnectionProperties {
        &self.local
    }

    /// Properties pointing at the network endpoint, once it is open
    pub fn external_properties(&self) -> Option<&DbConnectionProperties> {
        self.external.as_ref()
    }

    /// Port of the network endpoint, once it is open
    pub fn tcp_port(&self) -> Option<u16> {
        self.endpoint.as_ref().map(DbEndpoint::port)
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Check out a pooled connection
    pub fn connection(&self) -> Result<PooledConn, HarnessError> {
        checkout(&self.pool)
    }

    /// The anchor connection, for work that must not wait on the pool
    pub fn anchor(&self) -> &Connection {
        &self.anchor
    }

    /// Expose the database over the network; opening twice returns the same endpoint
    pub fn open_endpoint(&mut self) -> Result<DbConnectionProperties, HarnessError> {
        if let Some(props) = &self.external {
            return Ok(props.clone());
        }

        let endpoint = DbEndpoint::bind(&self.name, self.pool.clone()).map_err(|e| {
            HarnessError::setup(format!("Failed to open database endpoint: {}", e))
        })?;
        let props = DbConnectionProperties::remote(&self.name, ENDPOINT_HOST, endpoint.port());
        debug!("External database URL: {}", props.data_source_url);

        self.endpoint = Some(endpoint);
        self.external = Some(props.clone());
        Ok(props)
    }

    /// Stop the network endpoint, keeping the database itself alive
    pub fn shutdown_endpoint(&mut self) -> Result<()> {
        self.external = None;
        match self.endpoint.take() {
            Some(endpoint) => endpoint.shutdown(),
            None => Ok(()),
        }
    }

    /// Release the endpoint, the pool and the database
    pub fn close(mut self) -> Result<()> {
        self.shutdown_endpoint()?;
        let Self {
            name,
            pool,
            anchor,
            dir,
            ..
        } = self;
        drop(pool);
        anchor
            .close()
            .map_err(|(_, e)| anyhow!("Failed to close database '{}': {}", name, e))?;
        dir.close()
            .map_err(|e| anyhow!("Failed to remove database directory: {}", e))?;
        info!("Closed embedded database {}", name);
        Ok(())
    }
}

impl std::fmt::Debug for EmbeddedDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedDatabase")
            .field("name", &self.name)
            .field("tcp_port", &self.tcp_port())
            .finish()
    }
}
