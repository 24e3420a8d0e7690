//! Tape-hint file handling.
//!
//! An out-of-band generator queries the tape server for the tape↔file
//! mapping and writes it as one JSON object keyed by identifier:
//!
//! ```json
//! {"00AA": {"volid": "VOL001", "order": "00000001", "size": 4096}}
//! ```
//!
//! The file's mtime is watched; a change triggers a reload and the caller
//! invalidates its request cache so every request is re-tagged. Volume names
//! feed into request-list file names, so anything outside `[a-zA-Z0-9.-]`
//! is replaced with `_`.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use tracing::{info, warn};

/// One hint entry as written by the generator. Unknown fields tolerated.
#[derive(Debug, Deserialize)]
struct RawHint {
    volid: Option<String>,
    #[allow(dead_code)]
    order: Option<String>,
    #[allow(dead_code)]
    size: Option<u64>,
}

/// Identifier → tape volume mapping with reload bookkeeping.
#[derive(Debug)]
pub struct HintTable {
    path: Option<PathBuf>,
    volumes: HashMap<String, String>,
    mtime: Option<SystemTime>,
}

impl HintTable {
    /// Creates the table; `None` disables hints entirely (every request then
    /// lands on the synthetic `default` volume).
    #[must_use]
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            volumes: HashMap::new(),
            mtime: None,
        }
    }

    /// Checks the hint file's mtime and reloads on change.
    ///
    /// Returns `true` when the table was replaced (the caller must
    /// invalidate its request cache). A parse failure skips the reload and
    /// keeps the previous table.
    pub fn poll(&mut self) -> bool {
        let Some(path) = self.path.clone() else {
            return false;
        };

        let mtime = match fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => return false,
        };
        if Some(mtime) == self.mtime {
            return false;
        }

        let parsed: Result<HashMap<String, RawHint>, _> = fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|text| serde_json::from_str(&text).map_err(|e| e.to_string()));

        // The attempt is consumed either way; a broken file is reported once
        // per version.
        self.mtime = Some(mtime);

        match parsed {
            Ok(raw) => {
                self.volumes = raw
                    .into_iter()
                    .filter_map(|(id, hint)| {
                        hint.volid.map(|v| (id, sanitize_volume(&v)))
                    })
                    .collect();
                info!(
                    file = %path.display(),
                    entries = self.volumes.len(),
                    "tape hint file reloaded"
                );
                true
            }
            Err(error) => {
                warn!(file = %path.display(), %error, "hint file unreadable, keeping previous table");
                false
            }
        }
    }

    /// The volume for `id`, when known.
    #[must_use]
    pub fn volume_of(&self, id: &str) -> Option<&str> {
        self.volumes.get(id).map(String::as_str)
    }

    /// Number of mapped identifiers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    /// Hint file mtime as unix seconds, for the stats gauge. Zero when no
    /// file has been loaded.
    #[must_use]
    pub fn mtime_unix(&self) -> u64 {
        self.mtime
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Replaces anything outside `[a-zA-Z0-9.-]` with `_`.
#[must_use]
pub fn sanitize_volume(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn sanitize_replaces_foreign_characters() {
        assert_eq!(sanitize_volume("VOL001"), "VOL001");
        assert_eq!(sanitize_volume("A/B:C"), "A_B_C");
        assert_eq!(sanitize_volume("tape.0-1"), "tape.0-1");
        assert_eq!(sanitize_volume("här"), "h_r");
    }

    #[test]
    fn loads_and_maps_volumes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("hints.json");
        fs::write(
            &path,
            r#"{"00AA": {"volid": "VOL001", "order": "1"}, "00BB": {"volid": "VOL 2"}}"#,
        )
        .unwrap();

        let mut hints = HintTable::new(Some(path));
        assert!(hints.poll());
        assert_eq!(hints.volume_of("00AA"), Some("VOL001"));
        assert_eq!(hints.volume_of("00BB"), Some("VOL_2"));
        assert_eq!(hints.volume_of("00CC"), None);
        assert_eq!(hints.len(), 2);
    }

    #[test]
    fn unchanged_mtime_skips_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("hints.json");
        fs::write(&path, r#"{"00AA": {"volid": "V1"}}"#).unwrap();

        let mut hints = HintTable::new(Some(path));
        assert!(hints.poll());
        assert!(!hints.poll());
    }

    #[test]
    fn parse_failure_keeps_previous_table() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("hints.json");
        fs::write(&path, r#"{"00AA": {"volid": "V1"}}"#).unwrap();

        let mut hints = HintTable::new(Some(path.clone()));
        assert!(hints.poll());

        // Corrupt the file with a bumped mtime.
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"garbage").unwrap();
        drop(file);
        bump_mtime(&path);

        assert!(!hints.poll());
        assert_eq!(hints.volume_of("00AA"), Some("V1"));
    }

    #[test]
    fn missing_file_is_quietly_empty() {
        let mut hints = HintTable::new(Some(PathBuf::from("/nonexistent/hints.json")));
        assert!(!hints.poll());
        assert!(hints.is_empty());
        assert!(HintTable::new(None).volume_of("00AA").is_none());
    }

    fn bump_mtime(path: &std::path::Path) {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;
        let c = CString::new(path.as_os_str().as_bytes()).unwrap();
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
            + 5;
        let times = [
            libc::timespec {
                tv_sec: secs,
                tv_nsec: 0,
            },
            libc::timespec {
                tv_sec: secs,
                tv_nsec: 0,
            },
        ];
        // SAFETY: valid path and times array.
        let rc = unsafe { libc::utimensat(libc::AT_FDCWD, c.as_ptr(), times.as_ptr(), 0) };
        assert_eq!(rc, 0);
    }
}
