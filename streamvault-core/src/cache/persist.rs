//! File-based persistent blob tier
//!
//! Stores completed chunk bytes as individual files in a directory
//! structure organized by object group and object id. The file path
//! encodes the full record tuple so the cache can be restored from a cold
//! start without a separate metadata index.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;

use super::chunk::{ChunkRecord, ObjectRef};
use super::{BlobStore, CacheError};

/// Filesystem-backed blob store.
///
/// Blob for range `[start, start + length)` of object `group/object` lives
/// at `<root>/<group>/<object>/<start>_<length>.chunk`.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Creates a blob store rooted at `root`. The directory is created
    /// lazily on first write.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn blob_path(&self, record: &ChunkRecord) -> PathBuf {
        self.root
            .join(record.object.group.to_string())
            .join(record.object.object.to_string())
            .join(format!("{}_{}.chunk", record.start, record.length))
    }

    fn parse_blob_name(name: &str) -> Option<(u64, u64)> {
        let stem = name.strip_suffix(".chunk")?;
        let (start, length) = stem.split_once('_')?;
        let start = start.parse().ok()?;
        let length: u64 = length.parse().ok()?;
        if length == 0 {
            return None;
        }
        Some((start, length))
    }

    async fn scan_object_dir(
        &self,
        object: ObjectRef,
        dir: PathBuf,
        records: &mut Vec<ChunkRecord>,
    ) -> Result<(), CacheError> {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some((start, length)) = name.to_str().and_then(Self::parse_blob_name) else {
                tracing::warn!(
                    "Skipping unrecognized cache file {}",
                    entry.path().display()
                );
                continue;
            };
            let metadata = entry.metadata().await?;
            if metadata.len() != length {
                tracing::warn!(
                    "Skipping truncated cache blob {} ({} of {} bytes)",
                    entry.path().display(),
                    metadata.len(),
                    length
                );
                continue;
            }
            records.push(ChunkRecord::new(object, start, length));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn store(&self, record: &ChunkRecord, bytes: Bytes) -> Result<(), CacheError> {
        let path = self.blob_path(record);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, &bytes).await?;
        tracing::debug!(
            "Persisted chunk {} ({} bytes) to {}",
            record.id,
            bytes.len(),
            path.display()
        );
        Ok(())
    }

    async fn load(&self, record: &ChunkRecord) -> Result<Option<Bytes>, CacheError> {
        match fs::read(self.blob_path(record)).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn remove(&self, record: &ChunkRecord) -> Result<bool, CacheError> {
        match fs::remove_file(self.blob_path(record)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn scan(&self) -> Result<Vec<ChunkRecord>, CacheError> {
        let mut records = Vec::new();
        let mut groups = match fs::read_dir(&self.root).await {
            Ok(groups) => groups,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(err) => return Err(err.into()),
        };
        while let Some(group_entry) = groups.next_entry().await? {
            let Some(group) = group_entry.file_name().to_str().and_then(|s| s.parse().ok())
            else {
                tracing::warn!(
                    "Skipping unrecognized cache directory {}",
                    group_entry.path().display()
                );
                continue;
            };
            let mut objects = fs::read_dir(group_entry.path()).await?;
            while let Some(object_entry) = objects.next_entry().await? {
                let Some(object) = object_entry
                    .file_name()
                    .to_str()
                    .and_then(|s| s.parse().ok())
                else {
                    tracing::warn!(
                        "Skipping unrecognized cache directory {}",
                        object_entry.path().display()
                    );
                    continue;
                };
                self.scan_object_dir(
                    ObjectRef::new(group, object),
                    object_entry.path(),
                    &mut records,
                )
                .await?;
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn test_store() -> (TempDir, FsBlobStore) {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path().to_path_buf());
        (dir, store)
    }

    #[tokio::test]
    async fn test_store_load_remove_roundtrip() {
        let (_dir, store) = test_store();
        let record = ChunkRecord::new(ObjectRef::new(7, 9), 1024, 4);

        store
            .store(&record, Bytes::from_static(b"abcd"))
            .await
            .unwrap();
        assert_eq!(
            store.load(&record).await.unwrap().unwrap().as_ref(),
            b"abcd"
        );

        assert!(store.remove(&record).await.unwrap());
        assert!(store.load(&record).await.unwrap().is_none());
        assert!(!store.remove(&record).await.unwrap());
    }

    #[tokio::test]
    async fn test_load_missing_is_none_not_error() {
        let (_dir, store) = test_store();
        let record = ChunkRecord::new(ObjectRef::new(1, 1), 0, 10);
        assert!(store.load(&record).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scan_rebuilds_records() {
        let (_dir, store) = test_store();
        // Negative group ids are valid object groups.
        let a = ChunkRecord::new(ObjectRef::new(-1001, 42), 0, 5);
        let b = ChunkRecord::new(ObjectRef::new(-1001, 42), 5, 3);
        let c = ChunkRecord::new(ObjectRef::new(8, 3), 100, 2);

        store.store(&a, Bytes::from_static(b"aaaaa")).await.unwrap();
        store.store(&b, Bytes::from_static(b"bbb")).await.unwrap();
        store.store(&c, Bytes::from_static(b"cc")).await.unwrap();

        let mut scanned = store.scan().await.unwrap();
        scanned.sort_by(|x, y| {
            (x.object.group, x.object.object, x.start).cmp(&(
                y.object.group,
                y.object.object,
                y.start,
            ))
        });
        assert_eq!(scanned, vec![a, b, c]);
    }

    #[tokio::test]
    async fn test_scan_skips_corrupt_entries() {
        let (dir, store) = test_store();
        let record = ChunkRecord::new(ObjectRef::new(3, 4), 0, 8);
        store
            .store(&record, Bytes::from_static(b"12345678"))
            .await
            .unwrap();

        // Truncated blob and an unparseable name next to a valid one.
        let object_dir = dir.path().join("3").join("4");
        std::fs::write(object_dir.join("8_8.chunk"), b"short").unwrap();
        std::fs::write(object_dir.join("notes.txt"), b"junk").unwrap();

        let scanned = store.scan().await.unwrap();
        assert_eq!(scanned, vec![record]);
    }

    #[tokio::test]
    async fn test_scan_empty_root() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path().join("missing"));
        assert!(store.scan().await.unwrap().is_empty());
    }
}
