//! Batch pipeline: normalize → segment → chunk → checkpoint → embed → index.
//!
//! Every run holds the data directory's [`WriterLock`] for its whole
//! duration. Configuration problems are reported before the checkpoint or
//! index is touched.

use std::path::{Path, PathBuf};

use crate::{
    chunk_store::ChunkStore,
    chunking::{Chunk, ChunkedDocument, ChunkingConfig, chunk_document},
    data_dir::{DataDir, WriterLock},
    embedding::{EmbedOptions, Embedder},
    error::{Error, Result},
    indexer::build_index,
};

/// Outcome of a preprocessing run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreprocessReport {
    pub chunks: Vec<Chunk>,
    pub sections: usize,
    pub checkpoint: PathBuf,
}

/// Outcome of an indexing run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexReport {
    pub entries: usize,
    pub dimension: usize,
    pub model: String,
    pub index_dir: PathBuf,
    /// Whether the checkpoint had to be rebuilt from the source first.
    pub reprocessed: bool,
}

pub struct Pipeline<'a> {
    data_dir: &'a DataDir,
    chunking: ChunkingConfig,
}

impl<'a> Pipeline<'a> {
    pub fn new(data_dir: &'a DataDir, chunking: ChunkingConfig) -> Self {
        Self { data_dir, chunking }
    }

    pub fn chunk_store(&self) -> ChunkStore {
        ChunkStore::new(self.data_dir.chunks_file())
    }

    /// Chunk the OCR text at `source` and replace the checkpoint.
    pub fn preprocess(&self, source: &Path) -> Result<PreprocessReport> {
        self.chunking.step()?;
        let lock = self.data_dir.lock()?;
        self.preprocess_locked(&lock, source)
    }

    /// Embed the checkpointed chunks and replace the index.
    ///
    /// A missing or unreadable checkpoint is rebuilt from `source` when one
    /// is given; otherwise the error is returned.
    pub fn index(
        &self,
        source: Option<&Path>,
        embedder: &dyn Embedder,
        options: &EmbedOptions,
    ) -> Result<IndexReport> {
        let lock = self.data_dir.lock()?;
        let store = self.chunk_store();

        let (chunks, reprocessed) = match (store.load(), source) {
            (Ok(Some(chunks)), _) => (chunks, false),
            (Ok(None), Some(source)) => {
                tracing::warn!(
                    checkpoint = %store.path().display(),
                    "no chunk checkpoint, preprocessing source again"
                );
                (self.preprocess_locked(&lock, source)?.chunks, true)
            }
            (Err(e), Some(source)) => {
                tracing::warn!(
                    error = %e,
                    "chunk checkpoint unreadable, preprocessing source again"
                );
                (self.preprocess_locked(&lock, source)?.chunks, true)
            }
            (Ok(None), None) => {
                return Err(Error::NotFound {
                    kind: "chunk checkpoint",
                    name: format!(
                        "{} (run `coursedex preprocess` or pass --source)",
                        store.path().display()
                    ),
                });
            }
            (Err(e), None) => return Err(e),
        };

        self.index_locked(&lock, chunks, embedder, options, reprocessed)
    }

    /// Preprocess `source` and index the result in one run.
    pub fn build(
        &self,
        source: &Path,
        embedder: &dyn Embedder,
        options: &EmbedOptions,
    ) -> Result<(PreprocessReport, IndexReport)> {
        self.chunking.step()?;
        let lock = self.data_dir.lock()?;
        let preprocessed = self.preprocess_locked(&lock, source)?;
        let indexed = self.index_locked(
            &lock,
            preprocessed.chunks.clone(),
            embedder,
            options,
            false,
        )?;
        Ok((preprocessed, indexed))
    }

    fn preprocess_locked(
        &self,
        _lock: &WriterLock,
        source: &Path,
    ) -> Result<PreprocessReport> {
        let raw = std::fs::read_to_string(source).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound {
                    kind: "source file",
                    name: source.display().to_string(),
                }
            } else {
                Error::Io(e)
            }
        })?;
        tracing::info!(
            source = %source.display(),
            bytes = raw.len(),
            "read source text"
        );

        let ChunkedDocument { sections, chunks } =
            chunk_document(&raw, &self.chunking)?;

        let store = self.chunk_store();
        store.save(&chunks)?;
        tracing::info!(
            chunks = chunks.len(),
            sections,
            checkpoint = %store.path().display(),
            "saved chunk checkpoint"
        );

        Ok(PreprocessReport {
            chunks,
            sections,
            checkpoint: store.path().to_path_buf(),
        })
    }

    fn index_locked(
        &self,
        _lock: &WriterLock,
        chunks: Vec<Chunk>,
        embedder: &dyn Embedder,
        options: &EmbedOptions,
        reprocessed: bool,
    ) -> Result<IndexReport> {
        let index = build_index(chunks, embedder, options)?;
        let index_dir = self.data_dir.index_dir();
        index.save(&index_dir)?;

        Ok(IndexReport {
            entries: index.len(),
            dimension: index.dimension(),
            model: index.model().to_string(),
            index_dir,
            reprocessed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{embedding::HashEmbedder, vector_index::VectorIndex};

    fn setup() -> (tempfile::TempDir, DataDir, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir =
            DataDir::resolve(Some(&tmp.path().join("data")), None).unwrap();
        let source = tmp.path().join("module.txt");
        std::fs::write(
            &source,
            "Chapter 7 recommender systems rank items\n\n\
             Chapter 8 computer vision reads pixels",
        )
        .unwrap();
        (tmp, data_dir, source)
    }

    fn small() -> ChunkingConfig {
        ChunkingConfig {
            window: 4,
            overlap: 1,
        }
    }

    #[test]
    fn preprocess_writes_checkpoint() {
        let (_tmp, data_dir, source) = setup();
        let pipeline = Pipeline::new(&data_dir, small());

        let report = pipeline.preprocess(&source).unwrap();
        assert_eq!(report.sections, 2);
        assert_eq!(
            report.chunks[0],
            Chunk::new("Chapter 7", "Chapter 7 recommender systems")
        );
        assert_eq!(
            pipeline.chunk_store().load().unwrap(),
            Some(report.chunks.clone())
        );
        assert!(!data_dir.lock_file().exists());
    }

    #[test]
    fn bad_chunking_config_leaves_checkpoint_alone() {
        let (_tmp, data_dir, source) = setup();
        Pipeline::new(&data_dir, small()).preprocess(&source).unwrap();
        let before = std::fs::read(data_dir.chunks_file()).unwrap();

        let bad = ChunkingConfig {
            window: 3,
            overlap: 3,
        };
        let err =
            Pipeline::new(&data_dir, bad).preprocess(&source).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(std::fs::read(data_dir.chunks_file()).unwrap(), before);
    }

    #[test]
    fn missing_source_is_not_found() {
        let (tmp, data_dir, _source) = setup();
        let err = Pipeline::new(&data_dir, small())
            .preprocess(&tmp.path().join("nope.txt"))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn index_from_checkpoint() {
        let (_tmp, data_dir, source) = setup();
        let pipeline = Pipeline::new(&data_dir, small());
        let chunks = pipeline.preprocess(&source).unwrap().chunks;

        let report = pipeline
            .index(None, &HashEmbedder::new(16), &EmbedOptions::default())
            .unwrap();
        assert_eq!(report.entries, chunks.len());
        assert!(!report.reprocessed);

        let index = VectorIndex::load(&data_dir.index_dir()).unwrap();
        assert_eq!(index.len(), chunks.len());
    }

    #[test]
    fn index_without_checkpoint_needs_source() {
        let (_tmp, data_dir, source) = setup();
        let pipeline = Pipeline::new(&data_dir, small());
        let embedder = HashEmbedder::new(16);

        let err = pipeline
            .index(None, &embedder, &EmbedOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        let report = pipeline
            .index(Some(&source), &embedder, &EmbedOptions::default())
            .unwrap();
        assert!(report.reprocessed);
        assert!(data_dir.chunks_file().is_file());
    }

    #[test]
    fn corrupt_checkpoint_falls_back_to_source() {
        let (_tmp, data_dir, source) = setup();
        std::fs::write(data_dir.chunks_file(), b"not json").unwrap();
        let pipeline = Pipeline::new(&data_dir, small());
        let embedder = HashEmbedder::new(16);

        let err = pipeline
            .index(None, &embedder, &EmbedOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));

        let report = pipeline
            .index(Some(&source), &embedder, &EmbedOptions::default())
            .unwrap();
        assert!(report.reprocessed);
    }

    #[test]
    fn build_runs_both_stages() {
        let (_tmp, data_dir, source) = setup();
        let (pre, idx) = Pipeline::new(&data_dir, small())
            .build(&source, &HashEmbedder::new(16), &EmbedOptions::default())
            .unwrap();
        assert_eq!(pre.chunks.len(), idx.entries);
        assert_eq!(idx.model, "hash-16");
    }

    #[test]
    fn concurrent_run_is_refused() {
        let (_tmp, data_dir, source) = setup();
        let _held = data_dir.lock().unwrap();
        let err = Pipeline::new(&data_dir, small())
            .preprocess(&source)
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }
}
