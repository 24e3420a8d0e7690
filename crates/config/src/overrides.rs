//! Runtime configuration override.
//!
//! A JSON object at the configured override path may temporarily mask any
//! schema key flagged overridable. The daemons stat the file every main-loop
//! iteration:
//!
//! - file gone + override applied → revert to the base configuration;
//! - file present with a changed mtime → reload, tolerating atomic-write
//!   races with bounded parse retries;
//! - per-key whitelist and validator violations drop the key with a warning;
//! - a merge that breaks archiver threshold monotonicity is rejected whole.
//!
//! Diff logging is scoped to the calling component so an archiver does not
//! narrate retriever knobs.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::{schema, Component, Config};

/// Bounded retries against partially written override files.
const PARSE_ATTEMPTS: usize = 10;
const PARSE_RETRY_SLEEP: Duration = Duration::from_millis(100);

impl Config {
    /// Inspects the override file and applies, refreshes or reverts the
    /// overlay accordingly. Called once per main-loop iteration.
    ///
    /// Returns `true` when any effective value changed.
    pub fn poll_override(&mut self, component: Component) -> bool {
        let path = self.override_path();

        let mtime = match fs::metadata(&path) {
            Ok(meta) => meta.modified().ok(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return self.revert_override(component);
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "cannot stat override file");
                return false;
            }
        };

        if mtime == self.override_mtime {
            return false;
        }

        let Some(raw) = read_with_retries(&path) else {
            // Unreadable this iteration; leave the mtime untouched so the
            // next tick tries again.
            return false;
        };

        let mut overlay = BTreeMap::new();
        for (key, value) in raw {
            let Some(spec) = schema::spec_for(&key) else {
                warn!(key = %key, "override ignores unknown key");
                continue;
            };
            if !spec.can_override {
                warn!(key = %key, "key may not be overridden at runtime");
                continue;
            }
            let value = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Number(n) => n.to_string(),
                other => {
                    warn!(key = %key, value = %other, "override value must be a string or number");
                    continue;
                }
            };
            if let Err(problem) = crate::parse::validate_value(spec.kind, &value) {
                warn!(key = %key, %problem, "override value rejected");
                continue;
            }
            overlay.insert(key, value);
        }

        if let Err(e) = self.check_threshold_order(&overlay) {
            warn!(error = %e, "override rejected: threshold order violation");
            // The attempt is consumed; re-warn only when the file changes.
            self.override_mtime = mtime;
            return false;
        }

        let before = self.effective_values();
        self.overlay = Some(overlay);
        self.override_mtime = mtime;
        let changed = self.log_diffs(component, &before, "override applied");
        if !changed {
            info!(file = %path.display(), "override loaded, no relevant changes");
        }
        changed
    }

    /// Drops the overlay when the override file has disappeared.
    fn revert_override(&mut self, component: Component) -> bool {
        if self.overlay.is_none() {
            return false;
        }
        let before = self.effective_values();
        self.overlay = None;
        self.override_mtime = None;
        self.log_diffs(component, &before, "override removed, reverting")
    }

    /// Logs per-key effective diffs scoped to `component`. Returns whether
    /// anything changed at all (scoped or not).
    fn log_diffs(
        &self,
        component: Component,
        before: &BTreeMap<&'static str, String>,
        reason: &str,
    ) -> bool {
        let after = self.effective_values();
        let mut changed = false;
        for spec in schema::KEYS {
            let old = before.get(spec.name);
            let new = after.get(spec.name);
            if old == new {
                continue;
            }
            changed = true;
            if !component.owns_key(spec.name) {
                continue;
            }
            match (old, new) {
                (Some(old), Some(new)) => {
                    info!(key = spec.name, %old, %new, "{reason}: value changed");
                }
                (None, Some(new)) => {
                    info!(key = spec.name, %new, "{reason}: value set");
                }
                (Some(old), None) => {
                    info!(key = spec.name, %old, "{reason}: value cleared");
                }
                (None, None) => {}
            }
        }
        changed
    }
}

/// Reads and parses the override JSON, retrying briefly to ride out
/// non-atomic writers.
fn read_with_retries(path: &Path) -> Option<serde_json::Map<String, serde_json::Value>> {
    let mut last_error = String::new();
    for attempt in 1..=PARSE_ATTEMPTS {
        match fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(serde_json::Value::Object(map)) => return Some(map),
                Ok(_) => {
                    last_error = "top-level value is not an object".to_owned();
                }
                Err(e) => last_error = e.to_string(),
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => last_error = e.to_string(),
        }
        if attempt < PARSE_ATTEMPTS {
            thread::sleep(PARSE_RETRY_SLEEP);
        }
    }
    warn!(
        file = %path.display(),
        error = %last_error,
        "override file unreadable after {PARSE_ATTEMPTS} attempts, skipping this iteration"
    );
    None
}
