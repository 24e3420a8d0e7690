#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `endit-config` loads the shared daemon configuration: a strict `key =
//! value` file validated against the static schema in [`schema`], plus the
//! JSON runtime override that can temporarily mask whitelisted keys while a
//! daemon is running ([`overrides`]).
//!
//! All three daemons read the same file; each consults only the keys it
//! cares about. Values are stored as validated strings and exposed through
//! typed accessors so call sites never re-parse or re-validate.
//!
//! The configuration file path comes from, in order: the `--config` flag,
//! the `ENDIT_CONFIG` environment variable, then `/etc/endit.conf`.

pub mod overrides;
pub mod parse;
pub mod schema;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

pub use parse::ConfigError;

/// Bytes per user-facing GiB unit.
pub const GIB: u64 = 1 << 30;

/// Default configuration file path when neither the flag nor `ENDIT_CONFIG`
/// is set.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/endit.conf";

/// Which daemon is consulting the configuration.
///
/// Used to scope override diff logging and to name statistics files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Component {
    /// The `out/` → tape daemon.
    Archiver,
    /// The tape → `in/` daemon.
    Retriever,
    /// The `trash/` → tape-deletion daemon.
    Deleter,
}

impl Component {
    /// Lowercase component name, as used in log lines and stats file names.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Component::Archiver => "archiver",
            Component::Retriever => "retriever",
            Component::Deleter => "deleter",
        }
    }

    /// Whether `key` is relevant to this component: either prefixed with the
    /// component's name or not claimed by any component at all.
    #[must_use]
    pub(crate) fn owns_key(self, key: &str) -> bool {
        const PREFIXES: [&str; 3] = ["archiver_", "retriever_", "deleter_"];
        let mine = match self {
            Component::Archiver => "archiver_",
            Component::Retriever => "retriever_",
            Component::Deleter => "deleter_",
        };
        key.starts_with(mine) || !PREFIXES.iter().any(|p| key.starts_with(p))
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The loaded configuration: file values plus any applied runtime override.
///
/// Lookups resolve override → file → schema default, in that order.
#[derive(Clone, Debug)]
pub struct Config {
    path: PathBuf,
    file_values: BTreeMap<String, String>,
    overlay: Option<BTreeMap<String, String>>,
    override_mtime: Option<SystemTime>,
}

impl Config {
    /// Loads and validates the configuration file at `path`.
    ///
    /// # Errors
    ///
    /// Any parse or validation failure from [`parse::parse_file`], a missing
    /// required key, or an archiver threshold ladder that is not strictly
    /// increasing.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file_values = parse::parse_file(path)?;

        for spec in schema::KEYS {
            if spec.required && !file_values.contains_key(spec.name) {
                return Err(ConfigError::validation_error(
                    path,
                    format!("required key '{}' is missing", spec.name),
                ));
            }
        }

        let config = Self {
            path: path.to_path_buf(),
            file_values,
            overlay: None,
            override_mtime: None,
        };
        config.check_threshold_order(&config.file_values)?;
        Ok(config)
    }

    /// Builds a configuration from in-memory values. Test hook; applies the
    /// same required-key and threshold validation as [`Config::load`].
    pub fn from_values(
        values: BTreeMap<String, String>,
        path: &Path,
    ) -> Result<Self, ConfigError> {
        for spec in schema::KEYS {
            if spec.required && !values.contains_key(spec.name) {
                return Err(ConfigError::validation_error(
                    path,
                    format!("required key '{}' is missing", spec.name),
                ));
            }
        }
        let config = Self {
            path: path.to_path_buf(),
            file_values: values,
            overlay: None,
            override_mtime: None,
        };
        config.check_threshold_order(&config.file_values)?;
        Ok(config)
    }

    /// Path of the configuration file this was loaded from.
    #[must_use]
    pub fn config_path(&self) -> &Path {
        &self.path
    }

    /// Resolves `key` through override, file, then schema default.
    fn raw(&self, key: &str) -> Option<&str> {
        if let Some(overlay) = &self.overlay {
            if let Some(v) = overlay.get(key) {
                return Some(v);
            }
        }
        if let Some(v) = self.file_values.get(key) {
            return Some(v);
        }
        schema::spec_for(key).and_then(|spec| spec.default)
    }

    // Values are validated at load/override time; a lookup that fails to
    // parse here can only be a schema bug, so fall back to zero rather than
    // unwinding a daemon loop.
    fn int(&self, key: &str) -> i64 {
        self.raw(key).and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    /// The staging-tree base directory (`dir`).
    #[must_use]
    pub fn base_dir(&self) -> PathBuf {
        PathBuf::from(self.raw("dir").unwrap_or_default())
    }

    /// Directory for per-daemon log files, when configured.
    #[must_use]
    pub fn logdir(&self) -> Option<PathBuf> {
        self.raw("logdir").map(PathBuf::from)
    }

    /// Directory for statistics files.
    #[must_use]
    pub fn statdir(&self) -> PathBuf {
        PathBuf::from(self.raw("statdir").unwrap_or_default())
    }

    /// Short instance description used in stats file names and the
    /// Prometheus `hsm` label.
    #[must_use]
    pub fn desc_short(&self) -> String {
        self.raw("desc_short").unwrap_or_default().to_owned()
    }

    /// Debug mode (keeps processed trash markers, extra logging).
    #[must_use]
    pub fn debug(&self) -> bool {
        self.int("debug") != 0
    }

    /// Main-loop tick interval.
    #[must_use]
    pub fn sleeptime(&self) -> Duration {
        Duration::from_secs(self.int("sleeptime").max(1) as u64)
    }

    /// Base tape-client options appended to every invocation.
    #[must_use]
    pub fn dsmc_opts(&self) -> Vec<String> {
        split_opts(self.raw("dsmcopts").unwrap_or_default())
    }

    /// Display options for invocations whose output is parsed.
    #[must_use]
    pub fn dsmc_display_opts(&self) -> Vec<String> {
        split_opts(self.raw("dsmc_displayopts").unwrap_or_default())
    }

    /// CPU-time limit (seconds) applied to tape-client children.
    #[must_use]
    pub fn dsmc_cpulimit(&self) -> u64 {
        self.int("dsmc_cpulimit") as u64
    }

    /// Path of the runtime override file; relative paths resolve against the
    /// base directory.
    #[must_use]
    pub fn override_path(&self) -> PathBuf {
        let raw = PathBuf::from(self.raw("overridefile").unwrap_or_default());
        if raw.is_absolute() {
            raw
        } else {
            self.base_dir().join(raw)
        }
    }

    /// Archiver inactivity timeout before a single session is forced.
    #[must_use]
    pub fn archiver_timeout(&self) -> Duration {
        Duration::from_secs(self.int("archiver_timeout") as u64)
    }

    /// Shorter timeout applied while retry candidates are outstanding.
    #[must_use]
    pub fn archiver_retrytimeout(&self) -> Duration {
        Duration::from_secs(self.int("archiver_retrytimeout") as u64)
    }

    /// Archiver threshold rung `i` (1..=9) in bytes, when configured.
    #[must_use]
    pub fn archiver_threshold_bytes(&self, rung: usize) -> Option<u64> {
        debug_assert!((1..=9).contains(&rung));
        let key = format!("archiver_threshold{rung}_usage");
        self.raw(&key)
            .and_then(|v| v.parse::<u64>().ok())
            .map(|gib| gib * GIB)
    }

    /// Maximum concurrent retrieve sessions.
    #[must_use]
    pub fn retriever_maxworkers(&self) -> usize {
        self.int("retriever_maxworkers").max(1) as usize
    }

    /// Cool-down before a just-used tape volume may be remounted.
    #[must_use]
    pub fn retriever_remountdelay(&self) -> Duration {
        Duration::from_secs(self.int("retriever_remountdelay") as u64)
    }

    /// How long to let a volume's request list keep filling.
    #[must_use]
    pub fn retriever_reqlistfillwait(&self) -> Duration {
        Duration::from_secs(self.int("retriever_reqlistfillwait") as u64)
    }

    /// Upper bound on the fill delay, measured from the oldest request.
    #[must_use]
    pub fn retriever_reqlistfillwaitmax(&self) -> Duration {
        Duration::from_secs(self.int("retriever_reqlistfillwaitmax") as u64)
    }

    /// Reserved retrieve buffer on the `in/` filesystem, in bytes.
    #[must_use]
    pub fn retriever_buffersize_bytes(&self) -> u64 {
        self.int("retriever_buffersize") as u64 * GIB
    }

    /// Percentage of the buffer whose consumption pauses new workers.
    #[must_use]
    pub fn retriever_backlogthreshold(&self) -> u64 {
        self.int("retriever_backlogthreshold") as u64
    }

    /// Percentage of the buffer whose consumption kills running workers.
    #[must_use]
    pub fn retriever_killthreshold(&self) -> u64 {
        self.int("retriever_killthreshold") as u64
    }

    /// Path of the tape-hint file, when configured.
    #[must_use]
    pub fn retriever_hintfile(&self) -> Option<PathBuf> {
        self.raw("retriever_hintfile").map(PathBuf::from)
    }

    /// Deleter queue-processing schedule (named interval or crontab).
    #[must_use]
    pub fn deleter_queueprocinterval(&self) -> String {
        self.raw("deleter_queueprocinterval")
            .unwrap_or_default()
            .to_owned()
    }

    /// Validates archiver threshold monotonicity over a candidate value set
    /// (which is overlaid on file values and schema defaults).
    ///
    /// Every adjacent defined pair must be strictly increasing.
    pub(crate) fn check_threshold_order(
        &self,
        candidate: &BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        let lookup = |rung: usize| -> Option<u64> {
            let key = format!("archiver_threshold{rung}_usage");
            candidate
                .get(&key)
                .map(String::as_str)
                .or_else(|| self.file_values.get(&key).map(String::as_str))
                .or_else(|| schema::spec_for(&key).and_then(|s| s.default))
                .and_then(|v| v.parse().ok())
        };
        for rung in 1..9 {
            if let (Some(lo), Some(hi)) = (lookup(rung), lookup(rung + 1)) {
                if lo >= hi {
                    return Err(ConfigError::validation_error(
                        &self.path,
                        format!(
                            "archiver_threshold{rung}_usage ({lo}) must be below \
                             archiver_threshold{}_usage ({hi})",
                            rung + 1
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Effective value of every schema key, for diffing around override
    /// apply/revert.
    pub(crate) fn effective_values(&self) -> BTreeMap<&'static str, String> {
        let mut out = BTreeMap::new();
        for spec in schema::KEYS {
            if let Some(v) = self.raw(spec.name) {
                out.insert(spec.name, v.to_owned());
            }
        }
        out
    }
}

fn split_opts(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_owned).collect()
}
