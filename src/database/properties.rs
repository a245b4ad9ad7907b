//! Connection properties of the embedded database
//!
//! URLs follow one template for both the in-process and the external view of the same
//! database:
//!
//! ```text
//! sqlite:{location}:{name};MODE=MYSQL;CASE_INSENSITIVE_IDENTIFIERS=TRUE;DB_CLOSE_DELAY=-1
//!
//! in-process:  sqlite:mem:registry-4f1c...;MODE=MYSQL;...
//! external:    sqlite:tcp://localhost:40311/mem:registry-4f1c...;MODE=MYSQL;...
//! ```
//!
//! Only the location segment differs, so both URLs always name the same logical database.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// URL scheme of embedded database URLs
pub const URL_SCHEME: &str = "sqlite";

/// Options appended to every URL
pub const URL_OPTIONS: &str = "MODE=MYSQL;CASE_INSENSITIVE_IDENTIFIERS=TRUE;DB_CLOSE_DELAY=-1";

/// Location segment of the in-process URL
pub const MEMORY_LOCATION: &str = "mem";

/// Driver identifier written into the service configuration
pub const DRIVER_NAME: &str = "org.sqlite.SQLiteDataSource";

/// Default credentials of the embedded database
pub const DEFAULT_USER: &str = "sa";
pub const DEFAULT_PASSWORD: &str = "";

/// Build a URL from the template
pub fn connection_url(location: &str, name: &str) -> String {
    format!("{}:{}:{};{}", URL_SCHEME, location, name, URL_OPTIONS)
}

/// Location segment pointing at a network endpoint
pub fn tcp_location(host: &str, port: u16) -> String {
    format!("tcp://{}:{}/{}", host, port, MEMORY_LOCATION)
}

/// Connection properties handed to the migrator and the dependent service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbConnectionProperties {
    pub data_source_class_name: String,
    pub data_source_url: String,
    pub data_source_user: String,
    pub data_source_password: String,
}

impl DbConnectionProperties {
    /// Properties for in-process access to the named database
    pub fn in_memory(name: &str) -> Self {
        Self::with_url(connection_url(MEMORY_LOCATION, name))
    }

    /// Properties for access through the network endpoint
    pub fn remote(name: &str, host: &str, port: u16) -> Self {
        Self::with_url(connection_url(&tcp_location(host, port), name))
    }

    /// Properties for an existing URL, which must follow the template
    pub fn from_url(url: &str) -> Result<Self> {
        DbUrl::parse(url)?;
        Ok(Self::with_url(url.to_string()))
    }

    fn with_url(url: String) -> Self {
        Self {
            data_source_class_name: DRIVER_NAME.to_string(),
            data_source_url: url,
            data_source_user: DEFAULT_USER.to_string(),
            data_source_password: DEFAULT_PASSWORD.to_string(),
        }
    }

    /// Parse the URL of these properties
    pub fn parsed_url(&self) -> Result<DbUrl> {
        DbUrl::parse(&self.data_source_url)
    }
}

/// Where a URL points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbLocation {
    Memory,
    Tcp { host: String, port: u16 },
}

/// A parsed database URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbUrl {
    pub location: DbLocation,
    pub name: String,
    pub options: BTreeMap<String, String>,
}

impl DbUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix(URL_SCHEME)
            .and_then(|r| r.strip_prefix(':'))
            .ok_or_else(|| anyhow!("Not a {} URL: {}", URL_SCHEME, url))?;

        let mut segments = rest.split(';');
        let head = segments.next().unwrap_or_default();
        let (location, name) = head
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("Missing database name in URL: {}", url))?;
        if name.is_empty() {
            return Err(anyhow!("Missing database name in URL: {}", url));
        }

        let location = if location == MEMORY_LOCATION {
            DbLocation::Memory
        } else if let Some(endpoint) = location.strip_prefix("tcp://") {
            let (authority, path) = endpoint
                .split_once('/')
                .ok_or_else(|| anyhow!("Missing database path in URL: {}", url))?;
            if path != MEMORY_LOCATION {
                return Err(anyhow!("Unsupported database path '{}' in URL: {}", path, url));
            }
            let (host, port) = authority
                .rsplit_once(':')
                .ok_or_else(|| anyhow!("Missing port in URL: {}", url))?;
            let port = port
                .parse()
                .map_err(|e| anyhow!("Invalid port '{}' in URL {}: {}", port, url, e))?;
            DbLocation::Tcp {
                host: host.to_string(),
                port,
            }
        } else {
            return Err(anyhow!("Unsupported location '{}' in URL: {}", location, url));
        };

        let options = segments
            .filter(|s| !s.is_empty())
            .map(|s| {
                let (k, v) = s.split_once('=').unwrap_or((s, ""));
                (k.trim().to_ascii_uppercase(), v.trim().to_string())
            })
            .collect();

        Ok(Self {
            location,
            name: name.to_string(),
            options,
        })
    }

    /// File name backing this database inside the provisioner's scratch directory
    pub fn file_name(&self) -> String {
        format!("{}.sqlite3", self.name)
    }

    /// Whether the database must outlive its last client connection
    pub fn keep_alive(&self) -> bool {
        self.options
            .get("DB_CLOSE_DELAY")
            .map(|v| v == "-1")
            .unwrap_or(false)
    }

    /// Compatibility mode requested by the URL
    pub fn mode(&self) -> Option<&str> {
        self.options.get("MODE").map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_and_remote_differ_only_in_location() {
        let local = DbConnectionProperties::in_memory("test");
        let remote = DbConnectionProperties::remote("test", "localhost", 9092);

        assert_eq!(
            local.data_source_url,
            "sqlite:mem:test;MODE=MYSQL;CASE_INSENSITIVE_IDENTIFIERS=TRUE;DB_CLOSE_DELAY=-1"
        );
        assert_eq!(
            remote.data_source_url,
            local
                .data_source_url
                .replacen("mem:", "tcp://localhost:9092/mem:", 1)
        );

        let local = local.parsed_url().unwrap();
        let remote = remote.parsed_url().unwrap();
        assert_eq!(local.name, remote.name);
        assert_eq!(local.options, remote.options);
        assert_eq!(local.location, DbLocation::Memory);
        assert_eq!(
            remote.location,
            DbLocation::Tcp {
                host: "localhost".to_string(),
                port: 9092
            }
        );
    }

    #[test]
    fn test_url_options() {
        let url = DbUrl::parse(&connection_url(MEMORY_LOCATION, "registry-1")).unwrap();
        assert!(url.keep_alive());
        assert_eq!(url.mode(), Some("MYSQL"));
        assert_eq!(url.file_name(), "registry-1.sqlite3");
    }

    #[test]
    fn test_invalid_urls() {
        assert!(DbUrl::parse("jdbc:h2:mem:test").is_err());
        assert!(DbUrl::parse("sqlite:mem:").is_err());
        assert!(DbUrl::parse("sqlite:tcp://localhost/mem:test").is_err());
        assert!(DbUrl::parse("sqlite:tcp://localhost:99999/mem:test").is_err());
        assert!(DbUrl::parse("sqlite:disk:test").is_err());
        assert!(DbConnectionProperties::from_url("jdbc:h2:mem:test").is_err());
    }

    #[test]
    fn test_properties_serialize_camel_case() {
        let props = DbConnectionProperties::in_memory("test");
        let json = serde_json::to_value(&props).unwrap();
        assert_eq!(json["dataSourceUser"], "sa");
        assert!(json["dataSourceUrl"].as_str().unwrap().starts_with("sqlite:mem:test"));
    }
}
