//! Versioned migration scripts
//!
//! Scripts follow the `<prefix><version>__<description>.sql` convention. A version is a
//! sequence of numeric parts separated by `.` or `_` (`001`, `2.1`, `2_1_3`) and orders
//! part-wise, so `002` < `002.1` < `010`. Trailing zero parts do not count: `1` and `1.0`
//! are the same version.
//!
//! The checksum of a script is the lowercase hex SHA-256 of its content with `\r\n`
//! normalized to `\n`. It is what the ledger records and what drift detection compares.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::MigrationError;

/// Default filename prefix of versioned scripts
pub const DEFAULT_SCRIPT_PREFIX: &str = "v";

/// Filename suffix of versioned scripts
pub const SCRIPT_SUFFIX: &str = ".sql";

/// Separator between version and description in a script filename
pub const VERSION_SEPARATOR: &str = "__";

// =============================================================================
// Migration Version
// =============================================================================

/// A parsed script version
#[derive(Debug, Clone)]
pub struct MigrationVersion {
    raw: String,
    parts: Vec<u64>,
}

impl MigrationVersion {
    /// Parse a version string such as `001` or `2.1`
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        let parts = raw
            .split(['.', '_'])
            .map(|part| {
                if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                    None
                } else {
                    part.parse::<u64>().ok()
                }
            })
            .collect::<Option<Vec<u64>>>()?;

        Some(Self {
            raw: raw.to_string(),
            parts,
        })
    }

    /// The baseline version recorded when the ledger is created
    pub fn baseline() -> Self {
        Self {
            raw: "000".to_string(),
            parts: vec![0],
        }
    }

    /// The version as written in the filename
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn significant_parts(&self) -> &[u64] {
        let len = self
            .parts
            .iter()
            .rposition(|part| *part != 0)
            .map_or(0, |idx| idx + 1);
        &self.parts[..len]
    }
}

impl PartialEq for MigrationVersion {
    fn eq(&self, other: &Self) -> bool {
        self.significant_parts() == other.significant_parts()
    }
}

impl Eq for MigrationVersion {}

impl Hash for MigrationVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.significant_parts().hash(state);
    }
}

impl PartialOrd for MigrationVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MigrationVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.significant_parts().cmp(other.significant_parts())
    }
}

impl std::fmt::Display for MigrationVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

// =============================================================================
// Migration Script
// =============================================================================

/// A versioned unit of schema DDL read from disk
#[derive(Debug, Clone)]
pub struct MigrationScript {
    pub version: MigrationVersion,
    pub description: String,
    pub file_name: String,
    pub path: PathBuf,
    pub sql: String,
    pub checksum: String,
}

impl MigrationScript {
    /// Load a script, returning `None` for files that are not versioned scripts
    pub fn from_file(path: &Path, prefix: &str) -> Result<Option<Self>, MigrationError> {
        let file_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => return Ok(None),
        };

        let (version, description) = match parse_file_name(&file_name, prefix)? {
            Some(parsed) => parsed,
            None => return Ok(None),
        };

        let sql = std::fs::read_to_string(path).map_err(|source| MigrationError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let checksum = checksum(&sql);

        Ok(Some(Self {
            version,
            description,
            file_name,
            path: path.to_path_buf(),
            sql,
            checksum,
        }))
    }

    /// Statements of the script in file order
    pub fn statements(&self) -> Vec<String> {
        split_statements(&self.sql)
    }
}

/// Split a script filename into version and description
///
/// Returns `Ok(None)` when the name lacks the prefix or the `.sql` suffix, and an error
/// when it has both but the rest is not `<version>__<description>`.
pub fn parse_file_name(
    file_name: &str,
    prefix: &str,
) -> Result<Option<(MigrationVersion, String)>, MigrationError> {
    let stem = match file_name
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_suffix(SCRIPT_SUFFIX))
    {
        Some(stem) => stem,
        None => return Ok(None),
    };

    let invalid = || MigrationError::InvalidFileName {
        file: file_name.to_string(),
    };

    let (version, description) = stem.split_once(VERSION_SEPARATOR).ok_or_else(invalid)?;
    let version = MigrationVersion::parse(version).ok_or_else(invalid)?;

    Ok(Some((version, description.replace('_', " "))))
}

/// Load all versioned scripts from a directory, ordered by ascending version
pub fn load_scripts(dir: &Path, prefix: &str) -> Result<Vec<MigrationScript>, MigrationError> {
    let io_err = |source| MigrationError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut scripts = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if !path.is_file() {
            continue;
        }
        if let Some(script) = MigrationScript::from_file(&path, prefix)? {
            scripts.push(script);
        }
    }

    scripts.sort_by(|a, b| {
        a.version
            .cmp(&b.version)
            .then_with(|| a.file_name.cmp(&b.file_name))
    });

    if let Some(pair) = scripts.windows(2).find(|w| w[0].version == w[1].version) {
        return Err(MigrationError::DuplicateVersion {
            version: pair[0].version.to_string(),
            first: pair[0].file_name.clone(),
            second: pair[1].file_name.clone(),
        });
    }

    Ok(scripts)
}

/// Checksum recorded in the ledger for a script's content
pub fn checksum(content: &str) -> String {
    let normalized = content.replace("\r\n", "\n");
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

// =============================================================================
// Statement Splitting
// =============================================================================

/// Split a script into individual statements on `;`
///
/// Semicolons inside quoted strings, quoted identifiers and comments do not end a
/// statement. Comments are dropped from the returned statements, and empty statements
/// are skipped. A trailing statement without `;` is kept.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            current.push(c);
            if c == '\\' && q != '`' {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            } else if c == q {
                if chars.peek() == Some(&q) {
                    // doubled quote
                    current.push(q);
                    chars.next();
                } else {
                    quote = None;
                }
            }
            continue;
        }

        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                current.push(c);
            }
            '-' if chars.peek() == Some(&'-') => skip_line(&mut chars, &mut current),
            '#' => skip_line(&mut chars, &mut current),
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for n in chars.by_ref() {
                    if prev == '*' && n == '/' {
                        break;
                    }
                    prev = n;
                }
                current.push(' ');
            }
            ';' => push_statement(&mut statements, &mut current),
            _ => current.push(c),
        }
    }
    push_statement(&mut statements, &mut current);

    statements
}

fn skip_line(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, current: &mut String) {
    for n in chars.by_ref() {
        if n == '\n' {
            current.push('\n');
            break;
        }
    }
}

fn push_statement(statements: &mut Vec<String>, current: &mut String) {
    let statement = current.trim();
    if !statement.is_empty() {
        statements.push(statement.to_string());
    }
    current.clear();
}
