#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `endit-stats` renders each daemon's counters and gauges into a pair of
//! sibling files, `<hsm>-<component>-stats.json` and `.prom`, published into
//! the stats directory via temp-file + rename so scrapers never observe a
//! torn write.
//!
//! Rendering is deterministic: metrics live in ordered maps and the JSON
//! writer is configuration-free, so emitting the same values twice produces
//! byte-identical files. Every Prometheus sample carries the instance label
//! `hsm="<short-desc>"` and is prefixed `endit_<component>_`.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// Result type for stats operations.
pub type StatsResult<T> = Result<T, StatsError>;

/// Errors publishing statistics files.
#[derive(Debug, Error)]
pub enum StatsError {
    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The temp file could not be moved into place.
    #[error("failed to publish {target}: {source}")]
    Publish {
        /// Final path of the stats file.
        target: PathBuf,
        /// Underlying rename failure.
        #[source]
        source: std::io::Error,
    },
}

/// Statistics for one daemon instance.
#[derive(Debug)]
pub struct Stats {
    statdir: PathBuf,
    hsm: String,
    component: &'static str,
    counters: BTreeMap<&'static str, u64>,
    gauges: BTreeMap<&'static str, u64>,
}

impl Stats {
    /// Creates an empty metric set for `component` labelled `hsm`.
    #[must_use]
    pub fn new<P: Into<PathBuf>>(statdir: P, hsm: &str, component: &'static str) -> Self {
        Self {
            statdir: statdir.into(),
            hsm: hsm.to_owned(),
            component,
            counters: BTreeMap::new(),
            gauges: BTreeMap::new(),
        }
    }

    /// Adds `delta` to the named counter, creating it at zero first.
    pub fn add(&mut self, counter: &'static str, delta: u64) {
        *self.counters.entry(counter).or_insert(0) += delta;
    }

    /// Current value of a counter (zero when never touched).
    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    /// Sets the named gauge.
    pub fn set(&mut self, gauge: &'static str, value: u64) {
        self.gauges.insert(gauge, value);
    }

    /// Path of the JSON stats file.
    #[must_use]
    pub fn json_path(&self) -> PathBuf {
        self.statdir
            .join(format!("{}-{}-stats.json", self.hsm, self.component))
    }

    /// Path of the Prometheus stats file.
    #[must_use]
    pub fn prom_path(&self) -> PathBuf {
        self.statdir
            .join(format!("{}-{}-stats.prom", self.hsm, self.component))
    }

    /// Publishes both renderings, stamping the `time` gauge with the current
    /// unix time.
    ///
    /// # Errors
    ///
    /// I/O or rename failures; callers log and continue (stats are not worth
    /// a daemon).
    pub fn publish(&mut self) -> StatsResult<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.publish_at(now)
    }

    /// Publishes with an explicit timestamp. Exposed for tests.
    pub fn publish_at(&mut self, unix_time: u64) -> StatsResult<()> {
        self.set("time", unix_time);
        write_atomic(&self.statdir, &self.json_path(), self.render_json().as_bytes())?;
        write_atomic(&self.statdir, &self.prom_path(), self.render_prom().as_bytes())?;
        Ok(())
    }

    /// Renders the JSON document: one flat object, keys sorted.
    #[must_use]
    pub fn render_json(&self) -> String {
        let mut merged: BTreeMap<&str, u64> = BTreeMap::new();
        for (name, value) in self.counters.iter().chain(self.gauges.iter()) {
            merged.insert(name, *value);
        }
        let mut out = serde_json::to_string_pretty(&merged).unwrap_or_else(|_| "{}".to_owned());
        out.push('\n');
        out
    }

    /// Renders the Prometheus text-format document.
    #[must_use]
    pub fn render_prom(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.counters {
            self.sample(&mut out, name, *value, "counter");
        }
        for (name, value) in &self.gauges {
            self.sample(&mut out, name, *value, "gauge");
        }
        out
    }

    fn sample(&self, out: &mut String, name: &str, value: u64, kind: &str) {
        let metric = format!("endit_{}_{}", self.component, name);
        let _ = writeln!(out, "# TYPE {metric} {kind}");
        let _ = writeln!(out, "{metric}{{hsm=\"{}\"}} {value}", self.hsm);
    }
}

fn write_atomic(dir: &Path, target: &Path, content: &[u8]) -> StatsResult<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.flush()?;
    tmp.persist(target).map_err(|e| StatsError::Publish {
        target: target.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}
