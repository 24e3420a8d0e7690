//! Staging-tree layout, startup sanity pass, and payload scans.
//!
//! The tree under the configured base directory is the entire contract with
//! the dCache plugin:
//!
//! - `out/` hard links awaiting archive (the tape client unlinks on success)
//! - `in/` retrieve destination (the plugin renames files away)
//! - `request/` per-request JSON state files
//! - `requestlists/` transient file lists handed to the tape client
//! - `trash/` deletion markers, with `queue/` batches and optional `debug/`
//!
//! Scans never trust a previous tick: an `out/` entry observed once may be
//! unlinked by the tape client before the next stat. All scan helpers treat
//! `ENOENT` as "skip", per the transient-I/O rule.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::ident::is_identifier;

/// One payload file observed by a directory scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagedEntry {
    /// Hex file identifier (the file name).
    pub id: String,
    /// Size in bytes at scan time.
    pub size: u64,
    /// Modification time at scan time.
    pub mtime: SystemTime,
}

/// Handle to the staging tree rooted at the configured base directory.
#[derive(Clone, Debug)]
pub struct StagingTree {
    base: PathBuf,
}

impl StagingTree {
    /// Creates a handle rooted at `base`. No filesystem access happens here;
    /// call [`StagingTree::prepare`] before entering a daemon loop.
    #[must_use]
    pub fn new<P: Into<PathBuf>>(base: P) -> Self {
        Self { base: base.into() }
    }

    /// Returns the base directory.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// `out/`: hard links awaiting archive.
    #[must_use]
    pub fn out_dir(&self) -> PathBuf {
        self.base.join("out")
    }

    /// `in/`: retrieve destination.
    #[must_use]
    pub fn in_dir(&self) -> PathBuf {
        self.base.join("in")
    }

    /// `request/`: per-request state files.
    #[must_use]
    pub fn request_dir(&self) -> PathBuf {
        self.base.join("request")
    }

    /// `requestlists/`: transient tape-client file lists.
    #[must_use]
    pub fn requestlist_dir(&self) -> PathBuf {
        self.base.join("requestlists")
    }

    /// `trash/`: pending deletion markers.
    #[must_use]
    pub fn trash_dir(&self) -> PathBuf {
        self.base.join("trash")
    }

    /// `trash/queue/`: accepted deletion batches.
    #[must_use]
    pub fn trash_queue_dir(&self) -> PathBuf {
        self.trash_dir().join("queue")
    }

    /// `trash/debug/`: processed markers kept when debug mode is on.
    #[must_use]
    pub fn trash_debug_dir(&self) -> PathBuf {
        self.trash_dir().join("debug")
    }

    /// Absolute path of the `out/` entry for `id`.
    #[must_use]
    pub fn out_file(&self, id: &str) -> PathBuf {
        self.out_dir().join(id)
    }

    /// Absolute path of the `in/` entry for `id`.
    #[must_use]
    pub fn in_file(&self, id: &str) -> PathBuf {
        self.in_dir().join(id)
    }

    /// Startup sanity pass.
    ///
    /// Verifies the base directory exists, creates any missing staging
    /// subdirectory, and probes each for writability by creating and removing
    /// a scratch file. Daemons abort on failure rather than limp along with a
    /// half-usable tree.
    ///
    /// # Errors
    ///
    /// [`CoreError::MissingBase`] when the base directory is absent,
    /// [`CoreError::Unwritable`] when a subdirectory fails the probe.
    pub fn prepare(&self, with_debug: bool) -> CoreResult<()> {
        if !self.base.is_dir() {
            return Err(CoreError::MissingBase(self.base.clone()));
        }

        let mut dirs = vec![
            self.out_dir(),
            self.in_dir(),
            self.request_dir(),
            self.requestlist_dir(),
            self.trash_dir(),
            self.trash_queue_dir(),
        ];
        if with_debug {
            dirs.push(self.trash_debug_dir());
        }

        for dir in dirs {
            fs::create_dir_all(&dir)?;
            probe_writable(&dir)?;
            debug!(dir = %dir.display(), "staging directory ready");
        }
        Ok(())
    }

    /// Removes leftovers from previous runs.
    ///
    /// Regular files in `in/` and `requestlists/` whose mtime is older than
    /// `max_age` are unlinked. Runs once before a daemon enters its loop.
    ///
    /// Returns the number of files removed.
    pub fn clean_stale(&self, max_age: Duration) -> CoreResult<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;
        for dir in [self.in_dir(), self.requestlist_dir()] {
            for entry in fs::read_dir(&dir)? {
                let entry = match entry {
                    Ok(e) => e,
                    Err(_) => continue,
                };
                let meta = match entry.metadata() {
                    Ok(m) if m.is_file() => m,
                    _ => continue,
                };
                let mtime = match meta.modified() {
                    Ok(t) => t,
                    Err(_) => continue,
                };
                if mtime < cutoff {
                    match fs::remove_file(entry.path()) {
                        Ok(()) => {
                            info!(file = %entry.path().display(), "removed stale file");
                            removed += 1;
                        }
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => {
                            warn!(file = %entry.path().display(), error = %e,
                                "could not remove stale file");
                        }
                    }
                }
            }
        }
        Ok(removed)
    }

    /// Scans `dir` for payload files.
    ///
    /// Only identifier-pattern names are considered; everything else is
    /// ignored. Entries that vanish between listing and stat are skipped.
    pub fn scan_payload(&self, dir: &Path) -> io::Result<Vec<StagedEntry>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !is_identifier(name) {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(m) if m.is_file() => m,
                // Raced unlink or odd file type: not ours to report.
                _ => continue,
            };
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push(StagedEntry {
                id: name.to_owned(),
                size: meta.len(),
                mtime,
            });
        }
        Ok(found)
    }

    /// Stats a single file, treating a missing file as `None`.
    pub fn stat_size(path: &Path) -> io::Result<Option<u64>> {
        match fs::metadata(path) {
            Ok(m) => Ok(Some(m.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn probe_writable(dir: &Path) -> CoreResult<()> {
    let probe = dir.join(format!(".endit-{}.probe", std::process::id()));
    let outcome = fs::write(&probe, b"probe").and_then(|()| fs::remove_file(&probe));
    outcome.map_err(|source| CoreError::Unwritable {
        dir: dir.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn tree() -> (tempfile::TempDir, StagingTree) {
        let tmp = tempfile::tempdir().expect("create temp dir");
        let tree = StagingTree::new(tmp.path());
        (tmp, tree)
    }

    #[test]
    fn prepare_creates_all_subdirectories() {
        let (_tmp, tree) = tree();
        tree.prepare(false).expect("prepare succeeds");
        for dir in [
            tree.out_dir(),
            tree.in_dir(),
            tree.request_dir(),
            tree.requestlist_dir(),
            tree.trash_dir(),
            tree.trash_queue_dir(),
        ] {
            assert!(dir.is_dir(), "{} missing", dir.display());
        }
        assert!(!tree.trash_debug_dir().exists());
    }

    #[test]
    fn prepare_with_debug_adds_debug_dir() {
        let (_tmp, tree) = tree();
        tree.prepare(true).expect("prepare succeeds");
        assert!(tree.trash_debug_dir().is_dir());
    }

    #[test]
    fn prepare_requires_base() {
        let tree = StagingTree::new("/nonexistent/endit-base");
        assert!(matches!(
            tree.prepare(false),
            Err(CoreError::MissingBase(_))
        ));
    }

    #[test]
    fn scan_ignores_non_identifier_names() {
        let (_tmp, tree) = tree();
        tree.prepare(false).expect("prepare succeeds");
        let out = tree.out_dir();
        fs::write(out.join("00ABCD"), b"payload").unwrap();
        fs::write(out.join("not-payload.txt"), b"junk").unwrap();
        fs::write(out.join("00ABCD.err"), b"junk").unwrap();

        let entries = tree.scan_payload(&out).expect("scan succeeds");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "00ABCD");
        assert_eq!(entries[0].size, 7);
    }

    #[test]
    fn clean_stale_removes_only_old_files() {
        let (_tmp, tree) = tree();
        tree.prepare(false).expect("prepare succeeds");

        let old = tree.in_dir().join("AA11");
        let mut f = File::create(&old).unwrap();
        f.write_all(b"old").unwrap();
        drop(f);
        // Backdate well past the cutoff.
        let old_time = SystemTime::now() - Duration::from_secs(120);
        let ft = old_time
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        set_mtime(&old, ft);

        let fresh = tree.in_dir().join("BB22");
        fs::write(&fresh, b"fresh").unwrap();

        let removed = tree
            .clean_stale(Duration::from_secs(60))
            .expect("cleanup succeeds");
        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
    }

    #[cfg(unix)]
    fn set_mtime(path: &Path, secs: i64) {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;
        let c = CString::new(path.as_os_str().as_bytes()).unwrap();
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
        let rc = unsafe {
            libc::utimensat(libc::AT_FDCWD, c.as_ptr(), times.as_ptr(), 0)
        };
        assert_eq!(rc, 0);
    }
}
