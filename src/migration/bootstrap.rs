//! Bootstrap directory lookup
//!
//! The migration scripts live under `bootstrap/sql/<db_type>` at the project root. Tests
//! may run from the root or from a nested crate directory, so a fixed list of locations is
//! probed and the first existing directory wins.

use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::error::HarnessError;

/// Locations probed for `bootstrap/sql/<db_type>`, in priority order
pub fn bootstrap_candidates(base: &Path, home: Option<&Path>, db_type: &str) -> Vec<PathBuf> {
    let relative = Path::new("bootstrap").join("sql").join(db_type);

    let mut candidates = vec![base.join(&relative)];
    if let Some(home) = home {
        candidates.push(home.join(&relative));
    }
    candidates.push(base.join("..").join(&relative));
    candidates.push(base.join("..").join("..").join(&relative));
    candidates.push(base.join("..").join("..").join("..").join(&relative));
    candidates
}

/// First existing candidate directory, if any
pub fn probe_bootstrap_dir(base: &Path, home: Option<&Path>, db_type: &str) -> Option<PathBuf> {
    bootstrap_candidates(base, home, db_type)
        .into_iter()
        .find(|candidate| {
            let found = candidate.is_dir();
            trace!("Probed bootstrap candidate {} ({})", candidate.display(), found);
            found
        })
}

/// Resolve the bootstrap directory
///
/// An explicit directory must exist; otherwise the working directory, the home directory
/// and up to three parent directories are probed.
pub fn find_bootstrap_dir(
    explicit: Option<&Path>,
    db_type: &str,
) -> Result<PathBuf, HarnessError> {
    if let Some(dir) = explicit {
        return if dir.is_dir() {
            debug!("Bootstrap directory: {}", dir.display());
            Ok(dir.to_path_buf())
        } else {
            Err(HarnessError::setup(format!(
                "Configured bootstrap directory {} does not exist",
                dir.display()
            )))
        };
    }

    let base = std::env::current_dir()
        .map_err(|e| HarnessError::setup(format!("Cannot read working directory: {}", e)))?;
    let home = dirs::home_dir();

    match probe_bootstrap_dir(&base, home.as_deref(), db_type) {
        Some(dir) => {
            debug!("Bootstrap directory: {}", dir.display());
            Ok(dir)
        }
        None => Err(HarnessError::setup(format!(
            "Could not find bootstrap directory near {}",
            base.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_prefers_base() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("crates").join("tests");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::create_dir_all(root.path().join("bootstrap/sql/mysql")).unwrap();

        let found = probe_bootstrap_dir(&nested, None, "mysql").unwrap();
        assert_eq!(
            found,
            nested.join("..").join("..").join("bootstrap/sql/mysql")
        );

        std::fs::create_dir_all(nested.join("bootstrap/sql/mysql")).unwrap();
        let found = probe_bootstrap_dir(&nested, None, "mysql").unwrap();
        assert_eq!(found, nested.join("bootstrap/sql/mysql"));
    }

    #[test]
    fn test_probe_uses_home() {
        let base = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(home.path().join("bootstrap/sql/postgresql")).unwrap();

        assert!(probe_bootstrap_dir(base.path(), None, "postgresql").is_none());
        assert!(probe_bootstrap_dir(base.path(), Some(home.path()), "postgresql").is_some());
    }

    #[test]
    fn test_missing_explicit_dir_is_setup_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = find_bootstrap_dir(Some(&missing), "mysql").unwrap_err();
        assert!(err.is_setup());
    }
}
