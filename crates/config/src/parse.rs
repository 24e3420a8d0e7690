//! Configuration file parsing.
//!
//! The daemons share one configuration file of `key = value` lines with `#`
//! comments. Parsing is strict: unknown keys abort, obsolete keys abort with
//! a pointer at their replacement, deprecated keys are migrated to their
//! current spelling with a warning, and every value must satisfy its
//! declared validator before the daemons see it.
//!
//! # Format
//!
//! ```text
//! # ENDIT daemon configuration
//! dir = /grid/pool
//! sleeptime = 60
//! archiver_threshold1_usage = 500
//! archiver_threshold2_usage = 2000
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::schema::{self, ValueKind};

/// Errors that can occur while loading configuration.
#[derive(Debug, Clone)]
pub struct ConfigError {
    kind: ErrorKind,
    line: Option<usize>,
    message: String,
    path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorKind {
    Io,
    Parse,
    Validation,
}

impl ConfigError {
    fn io_error(path: &Path, source: io::Error) -> Self {
        Self {
            kind: ErrorKind::Io,
            line: None,
            message: format!("failed to read '{}': {}", path.display(), source),
            path: Some(path.to_path_buf()),
        }
    }

    pub(crate) fn parse_error(path: &Path, line: usize, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Parse,
            line: Some(line),
            message: message.into(),
            path: Some(path.to_path_buf()),
        }
    }

    pub(crate) fn validation_error(path: &Path, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Validation,
            line: None,
            message: message.into(),
            path: Some(path.to_path_buf()),
        }
    }

    /// Returns the line number where the error occurred, if available.
    #[must_use]
    pub fn line(&self) -> Option<usize> {
        self.line
    }

    /// Returns the configuration file path where the error occurred.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether this error came from value or cross-key validation, as
    /// opposed to an unreadable or syntactically broken file. The CLI maps
    /// validation failures to a distinct exit status.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        self.kind == ErrorKind::Validation
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(path) = &self.path {
            write!(f, "{}: ", path.display())?;
        }
        if let Some(line) = self.line {
            write!(f, "line {}: ", line)?;
        }
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ConfigError {}

/// Parses the configuration file at `path` into raw key/value pairs.
///
/// Deprecated keys come back under their migrated names. Defaults are not
/// applied here; [`crate::Config::load`] layers them on top.
///
/// # Errors
///
/// Returns an error if the file cannot be read, contains a syntax error, an
/// unknown or obsolete key, a duplicate key, or a value that fails its
/// validator.
pub fn parse_file(path: &Path) -> Result<BTreeMap<String, String>, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|e| ConfigError::io_error(path, e))?;
    parse(&contents, path)
}

/// Parses configuration from a string. See [`parse_file`].
pub fn parse(input: &str, path: &Path) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut values = BTreeMap::new();

    for (idx, line) in input.lines().enumerate() {
        let line_number = idx + 1;
        let trimmed = line.trim();

        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let (key, value) = trimmed.split_once('=').ok_or_else(|| {
            ConfigError::parse_error(path, line_number, "expected 'key = value' format")
        })?;

        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();

        if let Some(notice) = schema::obsolete_notice(&key) {
            return Err(ConfigError::parse_error(
                path,
                line_number,
                format!("obsolete key '{key}': {notice}"),
            ));
        }

        let key = match schema::migrated_name(&key) {
            Some(current) => {
                warn!(old = %key, new = %current, "deprecated configuration key, please rename");
                current.to_owned()
            }
            None => key,
        };

        let spec = schema::spec_for(&key).ok_or_else(|| {
            ConfigError::parse_error(path, line_number, format!("unknown key '{key}'"))
        })?;

        if let Err(problem) = validate_value(spec.kind, value) {
            return Err(ConfigError::parse_error(
                path,
                line_number,
                format!("key '{key}': {problem}"),
            ));
        }

        if values.insert(key.clone(), value.to_owned()).is_some() {
            return Err(ConfigError::parse_error(
                path,
                line_number,
                format!("duplicate key '{key}'"),
            ));
        }
    }

    Ok(values)
}

/// Applies a key's declared validator to a candidate value.
///
/// Shared between the file parser and the runtime override loader.
pub(crate) fn validate_value(kind: ValueKind, value: &str) -> Result<(), String> {
    match kind {
        ValueKind::Str => Ok(()),
        ValueKind::Int => match value.parse::<i64>() {
            Ok(n) if n >= 0 => Ok(()),
            Ok(n) => Err(format!("value {n} must not be negative")),
            Err(_) => Err(format!("'{value}' is not an integer")),
        },
        ValueKind::PosInt => match value.parse::<i64>() {
            Ok(n) if n > 0 => Ok(()),
            Ok(n) => Err(format!("value {n} must be a positive integer")),
            Err(_) => Err(format!("'{value}' is not an integer")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("create temp file");
        file.write_all(content.as_bytes()).expect("write config");
        file.flush().expect("flush");
        file
    }

    #[test]
    fn parse_empty_config() {
        let file = write_config("");
        let values = parse_file(file.path()).expect("parse succeeds");
        assert!(values.is_empty());
    }

    #[test]
    fn parse_basic_keys() {
        let file = write_config(
            "# comment\n\
             dir = /grid/pool\n\
             \n\
             sleeptime = 120\n",
        );
        let values = parse_file(file.path()).expect("parse succeeds");
        assert_eq!(values.get("dir").map(String::as_str), Some("/grid/pool"));
        assert_eq!(values.get("sleeptime").map(String::as_str), Some("120"));
    }

    #[test]
    fn keys_are_case_insensitive() {
        let file = write_config("DIR = /grid/pool\n");
        let values = parse_file(file.path()).expect("parse succeeds");
        assert!(values.contains_key("dir"));
    }

    #[test]
    fn deprecated_key_is_migrated() {
        let file = write_config("dir = /p\nminusage = 750\n");
        let values = parse_file(file.path()).expect("parse succeeds");
        assert_eq!(
            values.get("archiver_threshold1_usage").map(String::as_str),
            Some("750")
        );
        assert!(!values.contains_key("minusage"));
    }

    #[test]
    fn error_unknown_key() {
        let file = write_config("dir = /p\narchiver_treshold1_usage = 10\n");
        let err = parse_file(file.path()).expect_err("should fail");
        assert!(err.to_string().contains("unknown key"));
        assert_eq!(err.line(), Some(2));
    }

    #[test]
    fn error_obsolete_key() {
        let file = write_config("minfree = 100\n");
        let err = parse_file(file.path()).expect_err("should fail");
        assert!(err.to_string().contains("obsolete key 'minfree'"));
    }

    #[test]
    fn error_missing_equals() {
        let file = write_config("dir /grid/pool\n");
        let err = parse_file(file.path()).expect_err("should fail");
        assert!(err.to_string().contains("key = value"));
        assert_eq!(err.line(), Some(1));
    }

    #[test]
    fn error_duplicate_key() {
        let file = write_config("dir = /a\ndir = /b\n");
        let err = parse_file(file.path()).expect_err("should fail");
        assert!(err.to_string().contains("duplicate key 'dir'"));
    }

    #[test]
    fn error_non_integer_value() {
        let file = write_config("sleeptime = soon\n");
        let err = parse_file(file.path()).expect_err("should fail");
        assert!(err.to_string().contains("not an integer"));
    }

    #[test]
    fn error_nonpositive_posint() {
        let file = write_config("retriever_maxworkers = 0\n");
        let err = parse_file(file.path()).expect_err("should fail");
        assert!(err.to_string().contains("positive integer"));
    }

    #[test]
    fn negative_int_rejected() {
        let file = write_config("retriever_backlogthreshold = -3\n");
        let err = parse_file(file.path()).expect_err("should fail");
        assert!(err.to_string().contains("must not be negative"));
    }

    #[test]
    fn config_error_display_includes_location() {
        let file = write_config("dir = /p\nbogus = 1\n");
        let err = parse_file(file.path()).expect_err("should fail");
        let display = err.to_string();
        assert!(display.contains("line 2"));
        assert!(display.contains("bogus"));
    }
}
