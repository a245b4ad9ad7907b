//! File storage backing the registry's serializer uploads
//!
//! The service configuration names a storage class and a directory. [`LocalFileStorage`]
//! is the local-filesystem flavour the harness configures; tests use it to inspect or seed
//! what the service stores in the scratch directory.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use tracing::debug;

use crate::registry::config::FileStorageConfiguration;

/// Directory used when the configuration leaves it blank
pub const DEFAULT_DIR: &str = "/tmp/uploaded-files";

/// Named blobs under one storage root
pub trait FileStorage: Send + Sync {
    /// Store `name`, failing if it already exists; returns the stored path
    fn upload(&self, input: &mut dyn Read, name: &str) -> Result<String>;

    fn download(&self, name: &str) -> Result<Box<dyn Read + Send>>;

    /// Remove `name`; `false` when there was nothing to remove
    fn delete(&self, name: &str) -> Result<bool>;

    fn exists(&self, name: &str) -> Result<bool>;
}

/// Prefix the path component of `fs_url` onto `directory`, with exactly one separator
///
/// ```text
/// adjust_directory("abfs://c@acct.dfs.core.windows.net/base", "jars")  -> /base/jars
/// adjust_directory("hdfs://namenode:8020/", "/jars")                   -> /jars
/// adjust_directory("hdfs://namenode:8020", "/jars")                    -> /jars
/// ```
pub fn adjust_directory(fs_url: &str, directory: &str) -> String {
    let path_in_url = url_path(fs_url);
    match (path_in_url.ends_with('/'), directory.starts_with('/')) {
        (false, false) => format!("{}/{}", path_in_url, directory),
        (true, true) => format!("{}{}", path_in_url, &directory[1..]),
        _ => format!("{}{}", path_in_url, directory),
    }
}

/// Path component of a URL: after the authority, before any query or fragment
fn url_path(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    let url = &url[..end];
    match url.split_once("://") {
        Some((_, rest)) => rest.find('/').map(|idx| &rest[idx..]).unwrap_or(""),
        None => match url.split_once(':') {
            Some((scheme, rest)) if !scheme.contains('/') => rest,
            _ => url,
        },
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
    {
        return Err(anyhow!("Invalid file name '{}'", name));
    }
    Ok(())
}

/// Storage rooted at a local directory
#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    root: PathBuf,
}

impl LocalFileStorage {
    /// Storage rooted at `root`, creating the directory if needed
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| anyhow!("Failed to create storage directory {}: {}", root.display(), e))?;
        Ok(Self { root })
    }

    /// Storage for the file-storage section of a service configuration
    pub fn from_config(config: &FileStorageConfiguration) -> Result<Self> {
        let properties = &config.properties;
        let directory = if properties.directory.trim().is_empty() {
            DEFAULT_DIR
        } else {
            properties.directory.as_str()
        };
        match &properties.fs_url {
            Some(fs_url) => Self::from_url(fs_url, directory),
            None => Self::new(directory),
        }
    }

    /// Storage for a `file://` URL whose path is prefixed onto `directory`
    pub fn from_url(fs_url: &str, directory: &str) -> Result<Self> {
        if !fs_url.starts_with("file:") {
            return Err(anyhow!("Unsupported file system URL for local storage: {}", fs_url));
        }
        Self::new(adjust_directory(fs_url, directory))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> Result<PathBuf> {
        check_name(name)?;
        Ok(self.root.join(name))
    }
}

impl FileStorage for LocalFileStorage {
    fn upload(&self, input: &mut dyn Read, name: &str) -> Result<String> {
        let path = self.path_of(name)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| anyhow!("Failed to create {}: {}", path.display(), e))?;
        let written = io::copy(input, &mut file)?;
        debug!("Stored {} ({} bytes)", path.display(), written);
        Ok(path.to_string_lossy().to_string())
    }

    fn download(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.path_of(name)?;
        let file = File::open(&path).map_err(|e| anyhow!("Failed to open {}: {}", path.display(), e))?;
        Ok(Box::new(file))
    }

    fn delete(&self, name: &str) -> Result<bool> {
        let path = self.path_of(name)?;
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match removed {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(anyhow!("Failed to delete {}: {}", path.display(), e)),
        }
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.path_of(name)?.exists())
    }
}
