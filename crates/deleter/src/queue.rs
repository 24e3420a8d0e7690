//! Deletion queue batches.
//!
//! Accepting a deletion means moving its marker out of `trash/` into a
//! timestamped JSON batch under `trash/queue/`. The batch file is written
//! via temp + rename before any marker is unlinked, so the promise to the
//! plugin (marker gone = deletion persisted) holds even across a crash in
//! between. A failed rename is the one filesystem error worth dying for.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use endit_core::staging::StagingTree;

use crate::DeleterError;

/// Moves every pending `trash/` marker into a fresh queue batch.
///
/// Returns the number of accepted identifiers, zero when `trash/` held no
/// payload. In debug mode markers are preserved under `trash/debug/`
/// instead of being unlinked.
///
/// # Errors
///
/// [`DeleterError::QueuePersist`] when the batch file cannot be written or
/// renamed into place; the caller must treat this as fatal.
pub fn enqueue(tree: &StagingTree, debug: bool) -> Result<usize, DeleterError> {
    let markers = match tree.scan_payload(&tree.trash_dir()) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "cannot scan trash/, retrying next tick");
            return Ok(0);
        }
    };
    if markers.is_empty() {
        return Ok(0);
    }

    let ids: BTreeSet<String> = markers.into_iter().map(|e| e.id).collect();
    let batch = write_batch(tree, &ids)?;
    info!(batch = %batch.display(), files = ids.len(), "accepted deletion requests");

    for id in &ids {
        let marker = tree.trash_dir().join(id);
        let outcome = if debug {
            fs::rename(&marker, tree.trash_debug_dir().join(id))
        } else {
            fs::remove_file(&marker)
        };
        match outcome {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(id = id.as_str(), error = %e, "could not clear trash marker"),
        }
    }

    Ok(ids.len())
}

/// Writes a batch file named by a fresh unix timestamp, never clobbering an
/// existing batch.
///
/// # Errors
///
/// [`DeleterError::QueuePersist`] on any write or rename failure.
pub fn write_batch(tree: &StagingTree, ids: &BTreeSet<String>) -> Result<PathBuf, DeleterError> {
    let queue = tree.trash_queue_dir();
    let target = loop {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let candidate = queue.join(stamp.to_string());
        if !candidate.exists() {
            break candidate;
        }
        // Same-second collision with an existing batch; wait it out.
        thread::sleep(Duration::from_secs(1));
    };

    let persist = || -> io::Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&queue)?;
        serde_json::to_writer(&mut tmp, &ids)?;
        tmp.write_all(b"\n")?;
        tmp.flush()?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(())
    };
    persist().map_err(|source| DeleterError::QueuePersist {
        path: target.clone(),
        source,
    })?;
    Ok(target)
}

/// Loads every queue batch into one identifier set.
///
/// Unparseable batches are skipped with a warning and left on disk for
/// inspection; their contents are not lost, merely not processed.
pub fn load_batches(tree: &StagingTree) -> io::Result<(Vec<PathBuf>, BTreeSet<String>)> {
    let mut batch_files = Vec::new();
    let mut ids = BTreeSet::new();
    for entry in fs::read_dir(tree.trash_queue_dir())? {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let path = entry.path();
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let parsed: Result<BTreeSet<String>, _> = fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|text| serde_json::from_str(&text).map_err(|e| e.to_string()));
        match parsed {
            Ok(batch) => {
                ids.extend(batch);
                batch_files.push(path);
            }
            Err(error) => {
                warn!(batch = %path.display(), %error, "skipping unreadable queue batch");
            }
        }
    }
    Ok((batch_files, ids))
}

/// Unlinks processed batch files.
pub fn remove_batches(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(batch = %path.display(), error = %e, "could not remove queue batch");
            }
        }
    }
}
