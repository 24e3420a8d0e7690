//! Carving the pending backlog into per-session request lists.
//!
//! Files are packed oldest-mtime-first so one tape session carries the files
//! that arrived together (temporal affinity). Each chunk accumulates until
//! its running size crosses the spawn size; the crossing file is included.

use endit_core::staging::StagedEntry;

/// Sorts entries oldest-mtime-first, identifiers as tiebreak so ordering is
/// total.
pub fn sort_oldest_first(entries: &mut [StagedEntry]) {
    entries.sort_by(|a, b| a.mtime.cmp(&b.mtime).then_with(|| a.id.cmp(&b.id)));
}

/// Removes and returns the next chunk from the front of `pending`.
///
/// `pending` must already be sorted oldest-first. Returns an empty vector
/// when nothing is pending.
pub fn carve(pending: &mut Vec<StagedEntry>, spawn_size: u64) -> Vec<StagedEntry> {
    let mut cumulative: u64 = 0;
    let mut take = 0;
    for entry in pending.iter() {
        cumulative = cumulative.saturating_add(entry.size);
        take += 1;
        if cumulative > spawn_size {
            break;
        }
    }
    let rest = pending.split_off(take);
    std::mem::replace(pending, rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    fn entry(id: &str, size: u64, age_secs: u64) -> StagedEntry {
        StagedEntry {
            id: id.to_owned(),
            size,
            mtime: SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000 - age_secs),
        }
    }

    #[test]
    fn oldest_files_are_packed_first() {
        let mut pending = vec![
            entry("CC", 100, 10),
            entry("AA", 100, 300),
            entry("BB", 100, 200),
        ];
        sort_oldest_first(&mut pending);
        let chunk = carve(&mut pending, 150);
        let ids: Vec<&str> = chunk.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["AA", "BB"]);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "CC");
    }

    #[test]
    fn crossing_file_is_included() {
        let mut pending = vec![entry("AA", 100, 3), entry("BB", 100, 2), entry("CC", 100, 1)];
        // 100 <= 150, 200 > 150: the second file crosses and is included.
        let chunk = carve(&mut pending, 150);
        assert_eq!(chunk.len(), 2);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn single_worker_takes_everything() {
        // Scenario S1: spawn size exceeds the whole backlog, so one chunk
        // drains it.
        let mut pending = vec![entry("AA", 10 << 20, 1)];
        let chunk = carve(&mut pending, (10 << 20) + 4096);
        assert_eq!(chunk.len(), 1);
        assert!(pending.is_empty());
    }

    #[test]
    fn two_chunks_are_disjoint_and_balanced() {
        // Scenario S2 in miniature: 6 files, two chunks of half the total.
        let mut pending: Vec<StagedEntry> = (0..6)
            .map(|i| entry(&format!("F{i}"), 1000, 100 - i))
            .collect();
        sort_oldest_first(&mut pending);
        let total: u64 = pending.iter().map(|e| e.size).sum();
        let spawn = total / 2 + 4096;

        let first = carve(&mut pending, spawn);
        let second = carve(&mut pending, spawn);
        assert!(pending.is_empty());
        let first_ids: Vec<&str> = first.iter().map(|e| e.id.as_str()).collect();
        let second_ids: Vec<&str> = second.iter().map(|e| e.id.as_str()).collect();
        for id in &first_ids {
            assert!(!second_ids.contains(id), "{id} handed out twice");
        }
        // Oldest files went into the first chunk.
        assert!(first_ids.contains(&"F0"));
        assert!(second_ids.contains(&"F5"));
    }

    #[test]
    fn empty_backlog_yields_empty_chunk() {
        let mut pending = Vec::new();
        assert!(carve(&mut pending, 4096).is_empty());
    }
}
