//! Checkpoint file for preprocessed chunks.
//!
//! Preprocessing is the expensive, OCR-bound half of the pipeline. Saving its
//! output lets `coursedex index` rerun embedding with different settings
//! without redoing it.

use std::{
    io::Write,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    chunking::Chunk,
    error::{Error, Result},
};

/// Version written into every checkpoint.
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Serialize)]
struct CheckpointRef<'a> {
    version: u32,
    chunks: &'a [Chunk],
}

#[derive(Deserialize)]
struct Checkpoint {
    version: u32,
    chunks: Vec<Chunk>,
}

/// Reads and writes the ordered chunk list at a fixed path.
///
/// # Examples
///
/// ```
/// # let tmp = tempfile::tempdir().unwrap();
/// use coursedex::{chunk_store::ChunkStore, chunking::Chunk};
///
/// let store = ChunkStore::new(tmp.path().join("chunks.json"));
/// assert!(store.load().unwrap().is_none());
///
/// let chunks = vec![Chunk::new("Chapter 7", "recommender systems")];
/// store.save(&chunks).unwrap();
/// assert_eq!(store.load().unwrap(), Some(chunks));
/// ```
#[derive(Debug, Clone)]
pub struct ChunkStore {
    path: PathBuf,
}

impl ChunkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Replace the checkpoint with `chunks`.
    ///
    /// The data is written to a sibling temp file and renamed into place, so
    /// readers see either the old checkpoint or the new one.
    pub fn save(&self, chunks: &[Chunk]) -> Result<()> {
        let tmp = self.tmp_path();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let bytes = serde_json::to_vec(&CheckpointRef {
            version: CHECKPOINT_VERSION,
            chunks,
        })?;

        let write = || -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            std::fs::rename(&tmp, &self.path)
        };

        write().map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            Error::Storage(format!(
                "cannot write chunk checkpoint {}: {e}",
                self.path.display()
            ))
        })?;

        tracing::info!(
            chunks = chunks.len(),
            path = %self.path.display(),
            "saved chunk checkpoint"
        );
        Ok(())
    }

    /// Read the checkpoint back.
    ///
    /// Returns `Ok(None)` when no checkpoint has been written yet and
    /// [`Error::Storage`] when the file exists but cannot be decoded.
    pub fn load(&self) -> Result<Option<Vec<Chunk>>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(e) => {
                return Err(Error::Storage(format!(
                    "cannot read chunk checkpoint {}: {e}",
                    self.path.display()
                )));
            }
        };

        let checkpoint: Checkpoint =
            serde_json::from_slice(&bytes).map_err(|e| {
                Error::Storage(format!(
                    "corrupt chunk checkpoint {}: {e}",
                    self.path.display()
                ))
            })?;

        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(Error::Storage(format!(
                "chunk checkpoint {} has unsupported version {}",
                self.path.display(),
                checkpoint.version
            )));
        }

        Ok(Some(checkpoint.chunks))
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, ChunkStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(tmp.path().join("chunks.json"));
        (tmp, store)
    }

    #[test]
    fn missing_checkpoint_is_none() {
        let (_tmp, store) = test_store();
        assert!(!store.exists());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn roundtrip_preserves_order_and_text() {
        let (_tmp, store) = test_store();
        let chunks = vec![
            Chunk::new(
                "Chapter 7",
                "Recommender systems: “collaborative” filtering",
            ),
            Chunk::new("", "empty label survives"),
            Chunk::new(
                "Section 8.1",
                "日本語 🎉 naïve — \"quoted\" \\ backslash",
            ),
            Chunk::new("Chapter 7", "repeated label after another section"),
        ];

        store.save(&chunks).unwrap();
        assert_eq!(store.load().unwrap().unwrap(), chunks);
    }

    #[test]
    fn empty_list_roundtrips() {
        let (_tmp, store) = test_store();
        store.save(&[]).unwrap();
        assert_eq!(store.load().unwrap(), Some(vec![]));
    }

    #[test]
    fn save_overwrites_previous_checkpoint() {
        let (_tmp, store) = test_store();
        store.save(&[Chunk::new("Chapter 1", "old")]).unwrap();
        store.save(&[Chunk::new("Chapter 2", "new")]).unwrap();

        assert_eq!(
            store.load().unwrap().unwrap(),
            vec![Chunk::new("Chapter 2", "new")]
        );
        assert!(!store.tmp_path().exists());
    }

    #[test]
    fn corrupt_checkpoint_is_storage_error() {
        let (_tmp, store) = test_store();
        std::fs::write(store.path(), b"{ not json").unwrap();
        assert!(matches!(store.load(), Err(Error::Storage(_))));
    }

    #[test]
    fn unknown_version_is_storage_error() {
        let (_tmp, store) = test_store();
        std::fs::write(store.path(), br#"{"version":99,"chunks":[]}"#).unwrap();
        assert!(matches!(store.load(), Err(Error::Storage(_))));
    }

    #[test]
    fn save_creates_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let store =
            ChunkStore::new(tmp.path().join("db/chunks/processed.json"));
        store.save(&[Chunk::new("Chapter 1", "x")]).unwrap();
        assert!(store.exists());
    }
}
