use anyhow::{anyhow, Result};
use config::Config;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Default name of the configuration file looked up in the working directory
pub const CONFIG_FILE_NAME: &str = "registry-harness.toml";

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Database flavour the bootstrap scripts are written for (`bootstrap/sql/<db_type>`)
    pub db_type: String,

    /// Explicit bootstrap directory; when unset the usual locations are probed
    pub bootstrap_dir: Option<String>,

    /// Filename prefix of versioned migration scripts
    pub script_prefix: String,

    /// Script filename prefixes skipped during preprocessing
    pub excluded_prefixes: Vec<String>,

    /// Lines containing any of these markers are dropped during preprocessing
    pub banner_markers: Vec<String>,

    /// Rewrite MySQL table options and column attributes SQLite does not understand
    pub dialect_rewrites: bool,

    /// Upper bound for the dependent service to report readiness (default: 60 seconds)
    pub startup_timeout_secs: u64,

    /// Query timeout written into the storage section of the service configuration
    pub query_timeout_secs: u64,

    /// Command line used to launch the registry service (`{config}` and `{port}` are substituted)
    pub service_command: Option<String>,

    /// Directory holding the runtime artifacts of the optional integration
    pub integration_artifacts_dir: Option<String>,
}

const EMPTY_CONFIG: &str = r#"### registry-harness configuration file

### database flavour of the bootstrap scripts (bootstrap/sql/<db_type>)
# db_type = "mysql"

### explicit bootstrap directory, probed near the working directory when unset
# bootstrap_dir = "bootstrap/sql/mysql"

### migration scripts
# script_prefix = "v"
# excluded_prefixes = "v006"          # comma separated
# banner_markers = "Cloudera"         # comma separated
# dialect_rewrites = true

### dependent service
# startup_timeout_secs = 60
# query_timeout_secs = 30
# service_command = "bin/registry-server.sh {config}"

### optional integration
# integration_artifacts_dir = "atlasJars"
"#;

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            db_type: "mysql".to_string(),
            bootstrap_dir: None,
            script_prefix: "v".to_string(),
            excluded_prefixes: Vec::new(),
            banner_markers: vec!["Cloudera".to_string()],
            dialect_rewrites: true,
            startup_timeout_secs: 60,
            query_timeout_secs: 30,
            service_command: None,
            integration_artifacts_dir: None,
        }
    }
}

impl HarnessConfig {
    /// Function to create and initialize a new configuration
    ///
    /// With an explicit path, the file is read if it exists and a commented template is
    /// written otherwise. Without a path, `registry-harness.toml` in the working directory
    /// is read when present. Environment variables prefixed `REGISTRY_HARNESS_` override
    /// file settings.
    pub fn new(path: &Option<String>) -> Result<HarnessConfig> {
        let mut builder = Config::builder();

        match path {
            Some(p) => {
                let path = Path::new(p.as_str());
                if path.exists() {
                    let path_str = path
                        .to_str()
                        .ok_or_else(|| anyhow!("Could not convert path to string"))?;
                    builder = builder.add_source(config::File::with_name(path_str));
                } else {
                    std::fs::write(p.as_str(), EMPTY_CONFIG)
                        .map_err(|e| anyhow!("Unable to create config file: {}", e))?;
                }
            }
            None => {
                if Path::new(CONFIG_FILE_NAME).exists() {
                    builder = builder.add_source(config::File::with_name(CONFIG_FILE_NAME));
                }
            }
        }

        // E.g., `REGISTRY_HARNESS_STARTUP_TIMEOUT_SECS=120` raises the readiness bound
        builder = builder.add_source(config::Environment::with_prefix("REGISTRY_HARNESS"));

        let settings = builder
            .build()
            .map_err(|e| anyhow!("Failed to build configuration: {}", e))?;

        let config = settings
            .try_deserialize::<HashMap<String, String>>()
            .map_err(|e| anyhow!("Failed to deserialize configuration: {}", e))?;

        Self::from_map(&config)
    }

    /// Build a configuration from flat key/value settings, falling back to defaults
    pub fn from_map(config: &HashMap<String, String>) -> Result<HarnessConfig> {
        let defaults = HarnessConfig::default();

        let startup_timeout_secs = match config.get("startup_timeout_secs") {
            Some(s) => s
                .trim()
                .parse()
                .map_err(|e| anyhow!("Invalid startup_timeout_secs '{}': {}", s, e))?,
            None => defaults.startup_timeout_secs,
        };

        let query_timeout_secs = match config.get("query_timeout_secs") {
            Some(s) => s
                .trim()
                .parse()
                .map_err(|e| anyhow!("Invalid query_timeout_secs '{}': {}", s, e))?,
            None => defaults.query_timeout_secs,
        };

        let dialect_rewrites = match config.get("dialect_rewrites") {
            Some(s) => parse_bool(s)
                .ok_or_else(|| anyhow!("Invalid dialect_rewrites '{}'", s))?,
            None => defaults.dialect_rewrites,
        };

        Ok(HarnessConfig {
            db_type: non_empty(config.get("db_type")).unwrap_or(defaults.db_type),
            bootstrap_dir: non_empty(config.get("bootstrap_dir")),
            script_prefix: non_empty(config.get("script_prefix"))
                .unwrap_or(defaults.script_prefix),
            excluded_prefixes: config
                .get("excluded_prefixes")
                .map(|s| split_list(s))
                .unwrap_or(defaults.excluded_prefixes),
            banner_markers: config
                .get("banner_markers")
                .map(|s| split_list(s))
                .unwrap_or(defaults.banner_markers),
            dialect_rewrites,
            startup_timeout_secs,
            query_timeout_secs,
            service_command: non_empty(config.get("service_command")),
            integration_artifacts_dir: non_empty(config.get("integration_artifacts_dir")),
        })
    }

    /// Get the readiness bound as Duration
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    /// Display configuration summary
    pub fn summary(&self) -> String {
        let lines = [
            format!("Database Type:      {}", self.db_type),
            format!(
                "Bootstrap Dir:      {}",
                self.bootstrap_dir.as_deref().unwrap_or("(probe)")
            ),
            format!("Script Prefix:      {}", self.script_prefix),
            format!("Excluded Prefixes:  {}", self.excluded_prefixes.join(", ")),
            format!("Banner Markers:     {}", self.banner_markers.join(", ")),
            format!("Dialect Rewrites:   {}", self.dialect_rewrites),
            format!("Startup Timeout:    {} seconds", self.startup_timeout_secs),
            format!("Query Timeout:      {} seconds", self.query_timeout_secs),
            format!(
                "Service Command:    {}",
                self.service_command.as_deref().unwrap_or("(none)")
            ),
        ];
        lines.join("\n")
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
