//! Crash-safe file replacement.

use std::io::Write;
use std::path::Path;

use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::{NmtError, Result};

/// Replaces `path` with `contents` by writing a uniquely named temp file next to it and
/// persisting it over the target. Readers never observe a partially written file, and
/// concurrent writers to the same target never share a temp file.
pub fn write_atomic<P: AsRef<Path>>(path: P, contents: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut file = NamedTempFile::new_in(dir).map_err(|err| NmtError::io_at(err, dir))?;
    file.write_all(contents)
        .and_then(|()| file.as_file().sync_all())
        .map_err(|err| NmtError::io_at(err, path))?;
    file.persist(path)
        .map_err(|err| NmtError::io_at(err.error, path))?;
    Ok(())
}

/// Serialises `value` as pretty JSON and stores it with [`write_atomic`].
pub fn write_json_atomic<P: AsRef<Path>, T: Serialize>(path: P, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::thread;
    use tempfile::tempdir;

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn replaces_existing_content_without_leaving_temp_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        fs::write(&path, "old").expect("seed");
        write_atomic(&path, b"new").expect("write");
        assert_eq!(fs::read_to_string(&path).expect("read"), "new");
        assert_eq!(entries(dir.path()), vec!["state.json"]);
    }

    #[test]
    fn concurrent_writers_leave_one_complete_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        let payloads: Vec<String> = (0..8).map(|i| format!("{i}").repeat(4096)).collect();

        let handles: Vec<_> = payloads
            .iter()
            .cloned()
            .map(|payload| {
                let path = path.clone();
                thread::spawn(move || {
                    for _ in 0..16 {
                        write_atomic(&path, payload.as_bytes()).expect("write");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread");
        }

        let stored = fs::read_to_string(&path).expect("read");
        assert!(payloads.contains(&stored), "file holds one writer's full payload");
        assert_eq!(entries(dir.path()), vec!["state.json"]);
    }

    #[test]
    fn missing_parent_directory_is_reported_with_its_path() {
        let dir = tempdir().expect("tempdir");
        let missing = dir.path().join("absent");
        let err = write_atomic(missing.join("state.json"), b"x").expect_err("no parent");
        match err {
            NmtError::Io { path, .. } => assert_eq!(path.as_deref(), Some(missing.as_path())),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
