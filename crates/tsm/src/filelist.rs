//! Transient request lists handed to the tape client.
//!
//! Each worker gets a fresh newline-separated list of absolute staging paths
//! in `requestlists/`, created with an unpredictable suffix so concurrent
//! workers never collide. The list is unlinked automatically when the owning
//! worker is dropped.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::TempPath;

/// One request list, alive exactly as long as the value.
#[derive(Debug)]
pub struct FileList {
    path: TempPath,
    entries: usize,
}

impl FileList {
    /// Writes `paths` into a fresh list in `dir`, named `<prefix>.XXXXXX`.
    ///
    /// # Errors
    ///
    /// Any I/O failure creating or writing the list.
    pub fn create<I>(dir: &Path, prefix: &str, paths: I) -> io::Result<Self>
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut file = tempfile::Builder::new()
            .prefix(&format!("{prefix}."))
            .tempfile_in(dir)?;

        let mut entries = 0;
        for path in paths {
            file.write_all(path.as_os_str().as_encoded_bytes())?;
            file.write_all(b"\n")?;
            entries += 1;
        }
        file.flush()?;

        Ok(Self {
            path: file.into_temp_path(),
            entries,
        })
    }

    /// Path of the list file, for `-filelist=`.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of entries written.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
    }

    /// Whether the list ended up empty (caller should discard it instead of
    /// spawning a worker).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn writes_one_absolute_path_per_line() {
        let tmp = tempfile::tempdir().unwrap();
        let list = FileList::create(
            tmp.path(),
            "VOL001",
            vec![
                PathBuf::from("/base/out/00AA"),
                PathBuf::from("/base/out/00BB"),
            ],
        )
        .expect("list created");

        assert_eq!(list.len(), 2);
        let name = list.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("VOL001."), "unexpected name {name}");
        let content = fs::read_to_string(list.path()).unwrap();
        assert_eq!(content, "/base/out/00AA\n/base/out/00BB\n");
    }

    #[test]
    fn list_is_unlinked_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let list = FileList::create(tmp.path(), "t", vec![PathBuf::from("/x")]).unwrap();
        let path = list.path().to_path_buf();
        assert!(path.exists());
        drop(list);
        assert!(!path.exists());
    }

    #[test]
    fn empty_list_reports_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let list = FileList::create(tmp.path(), "t", Vec::new()).unwrap();
        assert!(list.is_empty());
    }
}
