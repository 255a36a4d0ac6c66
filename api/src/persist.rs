//! Whole-file JSON snapshots written via temp file + rename, so a crash
//! mid-write leaves the previous snapshot intact.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot {path} is not valid JSON: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> SnapshotError {
    SnapshotError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Load a snapshot. A missing file is `Ok(None)`.
pub fn read_snapshot<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, SnapshotError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_err(path, err)),
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|source| SnapshotError::Decode {
            path: path.display().to_string(),
            source,
        })
}

/// Serialize a snapshot body. Cheap enough to do while holding a lock.
pub fn encode_snapshot<T: Serialize>(path: &Path, value: &T) -> Result<Vec<u8>, SnapshotError> {
    serde_json::to_vec_pretty(value).map_err(|source| SnapshotError::Decode {
        path: path.display().to_string(),
        source,
    })
}

pub fn write_snapshot<T: Serialize>(path: &Path, value: &T) -> Result<(), SnapshotError> {
    let body = encode_snapshot(path, value)?;
    write_bytes(path, &body)
}

fn write_bytes(path: &Path, body: &[u8]) -> Result<(), SnapshotError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| io_err(path, err))?;
    }
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp).map_err(|err| io_err(&tmp, err))?;
        file.write_all(body).map_err(|err| io_err(&tmp, err))?;
        file.sync_all().map_err(|err| io_err(&tmp, err))?;
    }
    fs::rename(&tmp, path).map_err(|err| io_err(path, err))
}

/// Write an encoded snapshot on the blocking pool so the fsync never stalls
/// a runtime worker.
pub async fn write_encoded(path: PathBuf, body: Vec<u8>) -> Result<(), SnapshotError> {
    let display = path.display().to_string();
    tokio::task::spawn_blocking(move || write_bytes(&path, &body))
        .await
        .map_err(|err| SnapshotError::Io {
            path: display,
            source: std::io::Error::other(err),
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let loaded: Option<BTreeMap<String, u64>> =
            read_snapshot(&dir.path().join("absent.json")).expect("read should succeed");
        assert!(loaded.is_none());
    }

    #[test]
    fn write_replaces_previous_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("nested").join("state.json");
        let mut value = BTreeMap::new();
        value.insert("a".to_string(), 1u64);
        write_snapshot(&path, &value).expect("first write should succeed");
        value.insert("b".to_string(), 2u64);
        write_snapshot(&path, &value).expect("second write should succeed");

        let loaded: BTreeMap<String, u64> = read_snapshot(&path)
            .expect("read should succeed")
            .expect("snapshot should exist");
        assert_eq!(loaded, value);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn encoded_write_lands_off_the_runtime() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("state.json");
        let mut value = BTreeMap::new();
        value.insert("turns".to_string(), 3u64);
        let body = encode_snapshot(&path, &value).expect("encode should succeed");
        write_encoded(path.clone(), body).await.expect("write should succeed");

        let loaded: BTreeMap<String, u64> = read_snapshot(&path)
            .expect("read should succeed")
            .expect("snapshot should exist");
        assert_eq!(loaded, value);
    }

    #[test]
    fn corrupt_snapshot_is_a_decode_error() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("state.json");
        fs::write(&path, "{oops").expect("write should succeed");
        let err = read_snapshot::<BTreeMap<String, u64>>(&path).expect_err("decode should fail");
        assert!(matches!(err, SnapshotError::Decode { .. }));
    }
}
