//! Migration script preprocessing
//!
//! Bootstrap scripts are written for MySQL. Before they can be replayed against the
//! embedded SQLite database, every file is sanitized line by line:
//!
//! 1. comment lines and lines carrying banner text are dropped;
//! 2. lines calling or dropping stored procedures are dropped (case-insensitive);
//! 3. `DELIMITER` directives toggle a procedural block whose lines are all dropped,
//!    and an unterminated block simply ends at end of file;
//! 4. files whose name starts with an excluded prefix are skipped entirely;
//! 5. surviving lines go through the MySQL dialect rewrites, when enabled.
//!
//! A failure on one file is logged and never stops the remaining files. The sanitized
//! copies live in a scratch directory that is removed when [`SanitizedScripts`] is dropped.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use regex::Regex;
use tempfile::TempDir;
use tracing::{debug, error, warn};

use crate::config::HarnessConfig;

/// Rules driving the line filter
#[derive(Debug, Clone)]
pub struct PreprocessRules {
    /// Lines starting with one of these (after leading whitespace) are comments
    pub comment_prefixes: Vec<String>,
    /// Lines containing one of these markers are vendor banners
    pub banner_markers: Vec<String>,
    /// Lines containing one of these keywords (any case) belong to stored procedures
    pub procedure_keywords: Vec<String>,
    /// Directive toggling a procedural block (any case)
    pub block_delimiter: String,
    /// Files whose name starts with one of these are skipped
    pub excluded_prefixes: Vec<String>,
    /// Apply the MySQL to SQLite rewrites to surviving lines
    pub dialect_rewrites: bool,
}

impl Default for PreprocessRules {
    fn default() -> Self {
        Self {
            comment_prefixes: vec!["--".to_string()],
            banner_markers: vec!["Cloudera".to_string()],
            procedure_keywords: vec!["CALL".to_string(), "DROP PROCEDURE".to_string()],
            block_delimiter: "delimiter".to_string(),
            excluded_prefixes: Vec::new(),
            dialect_rewrites: true,
        }
    }
}

impl PreprocessRules {
    /// Rules with the configurable parts taken from the harness configuration
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            banner_markers: config.banner_markers.clone(),
            excluded_prefixes: config.excluded_prefixes.clone(),
            dialect_rewrites: config.dialect_rewrites,
            ..Self::default()
        }
    }
}

// =============================================================================
// Dialect Rewrites
// =============================================================================

/// Regex-based rewrites of MySQL table options and column attributes
#[derive(Debug)]
pub struct DialectRewriter {
    rules: Vec<(Regex, &'static str)>,
}

impl DialectRewriter {
    /// Rewrites turning common MySQL DDL into something SQLite accepts
    pub fn mysql() -> Result<Self> {
        let patterns: [(&str, &'static str); 6] = [
            (r"(?i)\s*\bENGINE\b\s*=\s*\w+", ""),
            (r"(?i)\s*\b(DEFAULT\s+)?(CHARSET|CHARACTER\s+SET)\b\s*=?\s*\w+", ""),
            (r"(?i)\s*\bCOLLATE\b\s*=?\s*\w+", ""),
            (r"(?i)\s*\bAUTO_INCREMENT\b\s*=\s*\d+", ""),
            (r"(?i)\s+\b(AUTO_INCREMENT|UNSIGNED)\b", ""),
            ("`", "\""),
        ];

        let rules = patterns
            .iter()
            .map(|(pattern, replacement)| {
                Regex::new(pattern)
                    .map(|re| (re, *replacement))
                    .map_err(|e| anyhow!("Invalid rewrite pattern '{}': {}", pattern, e))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { rules })
    }

    /// Apply every rewrite to a line
    pub fn rewrite(&self, line: &str) -> String {
        self.rules
            .iter()
            .fold(line.to_string(), |acc, (re, replacement)| {
                re.replace_all(&acc, *replacement).into_owned()
            })
    }
}

// =============================================================================
// Preprocessor
// =============================================================================

/// Outcome of preprocessing a directory
#[derive(Debug, Default, Clone)]
pub struct PreprocessReport {
    /// Sanitized files written, in filename order
    pub written: Vec<PathBuf>,
    /// Input files skipped because of an excluded prefix
    pub skipped: Vec<String>,
    /// Input files that could not be fully read or written
    pub failed: Vec<String>,
}

/// Sanitized scripts in a scratch directory, removed on drop
#[derive(Debug)]
pub struct SanitizedScripts {
    dir: TempDir,
    report: PreprocessReport,
}

impl SanitizedScripts {
    /// Scratch directory holding the sanitized scripts
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn report(&self) -> &PreprocessReport {
        &self.report
    }

    /// Remove the scratch directory now
    pub fn close(self) -> Result<()> {
        self.dir
            .close()
            .map_err(|e| anyhow!("Failed to remove sanitized scripts: {}", e))
    }
}

/// Line-oriented sanitizer for bootstrap scripts
pub struct Preprocessor {
    rules: PreprocessRules,
    upper_keywords: Vec<String>,
    lower_delimiter: String,
    rewriter: Option<DialectRewriter>,
}

impl Preprocessor {
    pub fn new(rules: PreprocessRules) -> Result<Self> {
        let rewriter = if rules.dialect_rewrites {
            Some(DialectRewriter::mysql()?)
        } else {
            None
        };

        Ok(Self {
            upper_keywords: rules
                .procedure_keywords
                .iter()
                .map(|k| k.to_uppercase())
                .collect(),
            lower_delimiter: rules.block_delimiter.to_lowercase(),
            rules,
            rewriter,
        })
    }

    /// Whether a script file is skipped entirely
    pub fn is_excluded(&self, file_name: &str) -> bool {
        self.rules
            .excluded_prefixes
            .iter()
            .any(|prefix| file_name.starts_with(prefix.as_str()))
    }

    fn is_dropped(&self, line: &str) -> bool {
        let trimmed = line.trim_start();
        if self
            .rules
            .comment_prefixes
            .iter()
            .any(|prefix| trimmed.starts_with(prefix.as_str()))
        {
            return true;
        }
        if self
            .rules
            .banner_markers
            .iter()
            .any(|marker| line.contains(marker.as_str()))
        {
            return true;
        }
        let upper = line.to_uppercase();
        self.upper_keywords
            .iter()
            .any(|keyword| upper.contains(keyword.as_str()))
    }

    fn is_block_toggle(&self, line: &str) -> bool {
        line.to_lowercase().contains(self.lower_delimiter.as_str())
    }

    /// Sanitize the lines of one script, preserving their order
    pub fn sanitize(&self, content: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut in_block = false;

        for line in content.lines() {
            if self.is_dropped(line) {
                continue;
            }
            if self.is_block_toggle(line) {
                in_block = !in_block;
                continue;
            }
            if in_block {
                continue;
            }
            out.push(match &self.rewriter {
                Some(rewriter) => rewriter.rewrite(line),
                None => line.to_string(),
            });
        }

        if in_block {
            warn!("Unterminated delimiter block, treating end of file as block end");
        }

        out
    }

    /// Sanitize one file into `output`
    ///
    /// Lines are written as they are produced; if writing fails midway the lines already
    /// written stay in place and the error is returned.
    pub fn process_file(&self, input: &Path, output: &Path) -> Result<usize> {
        let content = std::fs::read_to_string(input)
            .map_err(|e| anyhow!("Failed to read {}: {}", input.display(), e))?;

        let file = File::create(output)
            .map_err(|e| anyhow!("Failed to create {}: {}", output.display(), e))?;
        let mut out = BufWriter::new(file);

        let lines = self.sanitize(&content);
        for line in &lines {
            writeln!(out, "{}", line)
                .map_err(|e| anyhow!("Failed to write {}: {}", output.display(), e))?;
        }
        out.flush()
            .map_err(|e| anyhow!("Failed to flush {}: {}", output.display(), e))?;

        Ok(lines.len())
    }

    /// Sanitize every eligible file of `source` into `target`, which must exist
    pub fn process_dir_into(&self, source: &Path, target: &Path) -> Result<PreprocessReport> {
        let mut inputs = std::fs::read_dir(source)
            .map_err(|e| anyhow!("Failed to list {}: {}", source.display(), e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .collect::<Vec<_>>();
        inputs.sort();

        let mut report = PreprocessReport::default();
        for input in inputs {
            let file_name = match input.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };

            if self.is_excluded(&file_name) {
                debug!("Skipping excluded DDL file {}", file_name);
                report.skipped.push(file_name);
                continue;
            }

            let output = target.join(&file_name);
            match self.process_file(&input, &output) {
                Ok(lines) => {
                    debug!(
                        "Wrote preprocessed DDL file {} ({} lines)",
                        output.display(),
                        lines
                    );
                }
                Err(e) => {
                    error!("Failure while writing file {}: {}", file_name, e);
                    report.failed.push(file_name);
                }
            }
            if output.exists() {
                report.written.push(output);
            }
        }

        Ok(report)
    }

    /// Sanitize `source` into a fresh scratch directory
    pub fn process_dir(&self, source: &Path) -> Result<SanitizedScripts> {
        let dir = tempfile::Builder::new()
            .prefix("registry-ddl")
            .tempdir()
            .map_err(|e| anyhow!("Failed to create scratch directory: {}", e))?;

        let report = self.process_dir_into(source, dir.path())?;
        Ok(SanitizedScripts { dir, report })
    }
}
