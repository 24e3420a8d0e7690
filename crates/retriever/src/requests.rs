//! Retrieval request ingestion and caching.
//!
//! The plugin drops one JSON state file per pending retrieval into
//! `request/`. Writes are not atomic, so parsing retries briefly before a
//! file is declared garbage. Parsed requests are cached keyed by identifier
//! and revalidated by mtime; a missing or unreadable mtime invalidates.
//!
//! Ingestion is also where requests die: a request whose plugin mover
//! process group is gone is unlinked, as is one whose `in/` file already has
//! the right size (the plugin just has not collected it yet).

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::thread;
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use tracing::{debug, info, warn};

use endit_core::ident::is_identifier;
use endit_core::proc::process_group_alive;
use endit_core::staging::StagingTree;

use crate::hints::HintTable;

/// Bounded retries against concurrent request-file writers.
const PARSE_ATTEMPTS: usize = 25;
const PARSE_RETRY_SLEEP: Duration = Duration::from_millis(20);

/// On-disk request state file. Unknown fields are tolerated and ignored.
#[derive(Debug, Deserialize)]
struct RequestFile {
    /// Process group of the plugin-spawned mover; liveness probe.
    parent_pid: Option<i32>,
    /// Expected size of the retrieved file.
    file_size: Option<u64>,
    /// Only `recall` requests are processed.
    action: Option<String>,
}

/// A parsed, validated request.
#[derive(Clone, Debug)]
pub struct CachedRequest {
    /// File identifier.
    pub id: String,
    /// Plugin mover process group, when reported.
    pub parent_pid: Option<i32>,
    /// Expected retrieved size, when reported.
    pub file_size: Option<u64>,
    /// Request age marker: the state file's mtime when first seen.
    pub req_ts: SystemTime,
    /// Tape volume this request maps to, when the hint table knows it.
    pub volume: Option<String>,
    /// Validity stamp compared against the file's current mtime.
    pub(crate) mtime: SystemTime,
}

/// Cache of pending requests, keyed by identifier.
#[derive(Debug, Default)]
pub struct RequestCache {
    entries: HashMap<String, CachedRequest>,
}

impl RequestCache {
    /// Empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every cached entry. Called after a hint reload so each request
    /// is re-tagged with its volume.
    pub fn invalidate_all(&mut self) {
        self.entries.clear();
    }

    /// Iterates over the cached requests.
    pub fn entries(&self) -> impl Iterator<Item = &CachedRequest> {
        self.entries.values()
    }

    /// Number of cached requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total expected bytes across cached requests.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.entries.values().filter_map(|r| r.file_size).sum()
    }

    /// Scans `request/` and brings the cache up to date.
    ///
    /// # Errors
    ///
    /// Only when the request directory itself cannot be read; per-file
    /// problems are handled inline.
    pub fn refresh(&mut self, tree: &StagingTree, hints: &HintTable) -> io::Result<()> {
        let dir = tree.request_dir();
        let mut seen: HashMap<String, ()> = HashMap::new();

        for entry in fs::read_dir(&dir)? {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let name = entry.file_name();
            let Some(id) = name.to_str().filter(|n| is_identifier(n)) else {
                continue;
            };

            let mtime = match entry.metadata().and_then(|m| m.modified()) {
                Ok(t) => t,
                // Raced unlink or unreadable mtime: treat as invalid.
                Err(_) => {
                    self.entries.remove(id);
                    continue;
                }
            };

            seen.insert(id.to_owned(), ());

            if let Some(cached) = self.entries.get(id) {
                if cached.mtime == mtime {
                    continue;
                }
                self.entries.remove(id);
            }

            let path = entry.path();
            let Some(parsed) = parse_with_retries(&path) else {
                warn!(id, "request file unparseable, discarding it");
                let _ = fs::remove_file(&path);
                continue;
            };

            if let Some(action) = parsed.action.as_deref() {
                if action != "recall" {
                    debug!(id, action, "ignoring request with foreign action");
                    seen.remove(id);
                    continue;
                }
            }

            if let Some(pid) = parsed.parent_pid {
                if !process_group_alive(pid) {
                    info!(id, pid, "request owner is gone, dropping request");
                    let _ = fs::remove_file(&path);
                    seen.remove(id);
                    continue;
                }
            }

            if already_fulfilled(tree, id, parsed.file_size) {
                info!(id, "file already staged with matching size, dropping request");
                let _ = fs::remove_file(&path);
                seen.remove(id);
                continue;
            }

            self.entries.insert(
                id.to_owned(),
                CachedRequest {
                    id: id.to_owned(),
                    parent_pid: parsed.parent_pid,
                    file_size: parsed.file_size,
                    req_ts: mtime,
                    volume: hints.volume_of(id).map(str::to_owned),
                    mtime,
                },
            );
        }

        // Entries whose files disappeared are no longer requests.
        self.entries.retain(|id, _| seen.contains_key(id));
        Ok(())
    }

    /// Re-checks one request right before it is written into a worker's
    /// list: the state file must still exist, the owner must be alive, and
    /// the file must not already be staged.
    #[must_use]
    pub fn validate_for_spawn(&self, tree: &StagingTree, id: &str) -> bool {
        let Some(cached) = self.entries.get(id) else {
            return false;
        };
        if !tree.request_dir().join(id).exists() {
            return false;
        }
        if let Some(pid) = cached.parent_pid {
            if !process_group_alive(pid) {
                return false;
            }
        }
        !already_fulfilled(tree, id, cached.file_size)
    }
}

/// Whether `in/<id>` already exists with the expected size.
fn already_fulfilled(tree: &StagingTree, id: &str, expected: Option<u64>) -> bool {
    let Some(expected) = expected else {
        return false;
    };
    matches!(StagingTree::stat_size(&tree.in_file(id)), Ok(Some(size)) if size == expected)
}

fn parse_with_retries(path: &Path) -> Option<RequestFile> {
    for attempt in 1..=PARSE_ATTEMPTS {
        match fs::read_to_string(path) {
            Ok(text) => {
                if let Ok(parsed) = serde_json::from_str::<RequestFile>(&text) {
                    return Some(parsed);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(_) => {}
        }
        if attempt < PARSE_ATTEMPTS {
            thread::sleep(PARSE_RETRY_SLEEP);
        }
    }
    None
}
