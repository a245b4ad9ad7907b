//! Network endpoint of the embedded database
//!
//! The registry service runs outside the test's process, so it cannot reach the embedded
//! database through the provisioner's pool. [`DbEndpoint`] serves it over HTTP on an ephemeral
//! loopback port:
//!
//! - `GET /health` returns `OK`
//! - `POST /query` takes a [`QueryRequest`] and answers with a [`QueryResponse`]
//!
//! Statements run on connections from the provisioner's pool, so both sides see the same
//! data. [`RemoteConnection`] is the matching blocking client, built from the external
//! connection properties.

use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::database::embedded::{checkout, DbPool};
use crate::database::properties::{DbConnectionProperties, DbLocation};

/// Host the endpoint binds to and advertises
pub const ENDPOINT_HOST: &str = "localhost";

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// =============================================================================
// Protocol
// =============================================================================

/// A statement sent to the endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Name of the database the client expects to reach
    pub database: String,
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

/// Result of a statement; `error` is set instead of rows on failure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
    #[serde(default)]
    pub changes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryResponse {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(hex::encode(b)),
    }
}

/// Run one statement on a pooled connection
pub fn execute_query(pool: &DbPool, request: &QueryRequest) -> Result<QueryResponse> {
    let conn = checkout(pool)?;
    let mut stmt = conn.prepare(&request.sql)?;
    let params: Vec<SqlValue> = request.params.iter().map(json_to_sql).collect();

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    if columns.is_empty() {
        let changes = stmt.execute(rusqlite::params_from_iter(params.iter()))?;
        return Ok(QueryResponse {
            changes,
            ..Default::default()
        });
    }

    let mut cursor = stmt.query(rusqlite::params_from_iter(params.iter()))?;
    let mut rows = Vec::new();
    while let Some(row) = cursor.next()? {
        let mut values = Vec::with_capacity(columns.len());
        for idx in 0..columns.len() {
            values.push(sql_to_json(row.get_ref(idx)?));
        }
        rows.push(values);
    }

    Ok(QueryResponse {
        columns,
        rows,
        ..Default::default()
    })
}

// =============================================================================
// Server
// =============================================================================

#[derive(Clone)]
struct EndpointState {
    database: Arc<str>,
    pool: DbPool,
}

fn create_router(state: EndpointState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/query", post(query_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn query_handler(
    State(state): State<EndpointState>,
    Json(request): Json<QueryRequest>,
) -> Json<QueryResponse> {
    if request.database != *state.database {
        return Json(QueryResponse::error(format!(
            "Database '{}' not found, this endpoint serves '{}'",
            request.database, state.database
        )));
    }

    debug!("Endpoint query: {}", request.sql);
    let pool = state.pool.clone();
    let result = tokio::task::spawn_blocking(move || execute_query(&pool, &request)).await;

    Json(match result {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => QueryResponse::error(e.to_string()),
        Err(e) => QueryResponse::error(format!("Query task failed: {}", e)),
    })
}

/// HTTP endpoint serving one embedded database
///
/// The listener is bound on the caller's thread; serving happens on a dedicated thread
/// that owns its own tokio runtime. Binding and shutting down are therefore safe from
/// synchronous test code and from inside another runtime alike.
pub struct DbEndpoint {
    port: u16,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl DbEndpoint {
    /// Bind an ephemeral loopback port and start serving `pool`
    pub fn bind(database: &str, pool: DbPool) -> Result<Self> {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0))
            .map_err(|e| anyhow!("Failed to bind database endpoint: {}", e))?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let app = create_router(EndpointState {
            database: Arc::from(database),
            pool,
        });

        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let worker = std::thread::Builder::new()
            .name(format!("db-endpoint-{}", port))
            .spawn(move || serve(listener, app, shutdown, ready_tx))
            .map_err(|e| anyhow!("Failed to spawn endpoint thread: {}", e))?;

        ready_rx
            .recv()
            .map_err(|_| anyhow!("Database endpoint exited before it was ready"))??;

        info!("Database endpoint listening on {}:{}", ENDPOINT_HOST, port);
        Ok(Self {
            port,
            cancel,
            worker: Some(worker),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting connections and wait for in-flight requests
    pub fn shutdown(mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| anyhow!("Database endpoint thread panicked"))?;
        }
        info!("Database endpoint on port {} stopped", self.port);
        Ok(())
    }
}

impl Drop for DbEndpoint {
    fn drop(&mut self) {
        // the worker finishes on its own once cancelled
        self.cancel.cancel();
    }
}

fn serve(
    listener: std::net::TcpListener,
    app: Router,
    shutdown: CancellationToken,
    ready: mpsc::Sender<Result<()>>,
) {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("db-endpoint")
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(anyhow!("Failed to build endpoint runtime: {}", e)));
            return;
        }
    };

    runtime.block_on(async move {
        let listener = match tokio::net::TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(e) => {
                let _ = ready.send(Err(anyhow!("Failed to register endpoint listener: {}", e)));
                return;
            }
        };
        let _ = ready.send(Ok(()));

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = served {
            error!("Database endpoint failed: {}", e);
        }
    });
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
}

// =============================================================================
// Client
// =============================================================================

/// Blocking client for a [`DbEndpoint`]
pub struct RemoteConnection {
    base_url: String,
    database: String,
    agent: ureq::Agent,
}

impl RemoteConnection {
    /// Connect using external connection properties
    pub fn connect(props: &DbConnectionProperties) -> Result<Self> {
        let url = props.parsed_url()?;
        let (host, port) = match url.location {
            DbLocation::Tcp { host, port } => (host, port),
            DbLocation::Memory => {
                return Err(anyhow!(
                    "Properties point at an in-process database, not an endpoint: {}",
                    props.data_source_url
                ))
            }
        };

        let config = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(30)))
            .build();

        Ok(Self {
            base_url: format!("http://{}:{}", host, port),
            database: url.name,
            agent: ureq::Agent::new_with_config(config),
        })
    }

    /// Whether the endpoint answers its health check
    pub fn is_healthy(&self) -> bool {
        self.agent
            .get(&format!("{}/health", self.base_url))
            .call()
            .and_then(|mut resp| resp.body_mut().read_to_string())
            .map(|body| body == "OK")
            .unwrap_or(false)
    }

    /// Run a statement and return its full response
    pub fn query(&self, sql: &str, params: Vec<Value>) -> Result<QueryResponse> {
        let request = QueryRequest {
            database: self.database.clone(),
            sql: sql.to_string(),
            params,
        };

        let response: QueryResponse = self
            .agent
            .post(&format!("{}/query", self.base_url))
            .send_json(&request)?
            .body_mut()
            .read_json()?;

        match response.error {
            Some(message) => Err(anyhow!("Remote query failed: {}", message)),
            None => Ok(response),
        }
    }

    /// Run a statement that returns no rows, returning the number of changed rows
    pub fn execute(&self, sql: &str) -> Result<usize> {
        Ok(self.query(sql, Vec::new())?.changes)
    }
}
