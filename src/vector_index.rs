//! Exact nearest-neighbour index over chunk embeddings.
//!
//! The index is a flat matrix: every search measures the Euclidean distance
//! to every stored vector. Course modules produce a few thousand chunks at
//! most, where an exhaustive scan is both exact and fast enough.

use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};

use crate::{
    chunking::Chunk,
    error::{Error, Result},
    index_db::{FORMAT_VERSION, INDEX_FILE, IndexDb, Manifest},
};

/// A search result: the matched entry's id and its distance to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub id: u64,
    pub distance: f32,
}

/// In-memory vector index plus the id → chunk side table.
///
/// Ids are assigned densely from zero in insertion order.
///
/// # Examples
///
/// ```
/// use coursedex::{chunking::Chunk, vector_index::VectorIndex};
///
/// let mut index = VectorIndex::new("demo", 2);
/// index.add(&[0.0, 0.0], Chunk::new("Chapter 1", "origin")).unwrap();
/// index.add(&[3.0, 4.0], Chunk::new("Chapter 2", "far away")).unwrap();
///
/// let hits = index.search(&[2.9, 4.1], 1).unwrap();
/// assert_eq!(hits[0].id, 1);
/// assert_eq!(index.get(hits[0].id).unwrap().text, "far away");
/// ```
#[derive(Debug, Clone)]
pub struct VectorIndex {
    model: String,
    dimension: usize,
    /// Row-major `[len, dimension]` matrix.
    vectors: Vec<f32>,
    chunks: Vec<Chunk>,
}

impl VectorIndex {
    pub fn new(model: impl Into<String>, dimension: usize) -> Self {
        Self {
            model: model.into(),
            dimension,
            vectors: Vec::new(),
            chunks: Vec::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Insert a vector with its chunk and return the assigned id.
    pub fn add(&mut self, vector: &[f32], chunk: Chunk) -> Result<u64> {
        self.check_dimension(vector)?;
        let id = self.chunks.len() as u64;
        self.vectors.extend_from_slice(vector);
        self.chunks.push(chunk);
        Ok(id)
    }

    pub fn get(&self, id: u64) -> Option<&Chunk> {
        self.chunks.get(usize::try_from(id).ok()?)
    }

    pub fn vector(&self, id: u64) -> Option<&[f32]> {
        let start = usize::try_from(id).ok()?.checked_mul(self.dimension)?;
        self.vectors.get(start..start + self.dimension)
    }

    /// Iterate over `(id, chunk)` in id order.
    pub fn chunks(&self) -> impl Iterator<Item = (u64, &Chunk)> {
        self.chunks.iter().enumerate().map(|(i, c)| (i as u64, c))
    }

    /// The `k` entries closest to `query`, nearest first.
    ///
    /// Equal distances are ordered by id, so earlier insertions win ties.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Hit>> {
        self.check_dimension(query)?;
        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let distances = self.distances(query)?;
        let mut hits: Vec<Hit> = distances
            .into_iter()
            .enumerate()
            .map(|(i, distance)| Hit {
                id: i as u64,
                distance,
            })
            .collect();
        hits.sort_by(|a, b| {
            a.distance.total_cmp(&b.distance).then(a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Maximal marginal relevance search.
    ///
    /// Takes the `fetch_k` nearest entries and greedily picks `k` of them,
    /// trading cosine similarity to the query (weight `lambda`) against
    /// similarity to entries already picked (weight `1 - lambda`). With
    /// `lambda = 1` this is plain nearest-neighbour order.
    pub fn search_mmr(
        &self,
        query: &[f32],
        k: usize,
        fetch_k: usize,
        lambda: f32,
    ) -> Result<Vec<Hit>> {
        let candidates = self.search(query, fetch_k.max(k))?;
        if candidates.len() <= 1 || k == 0 {
            return Ok(candidates.into_iter().take(k).collect());
        }

        let lambda = lambda.clamp(0.0, 1.0);
        let mut rows = Vec::with_capacity(candidates.len() * self.dimension);
        for hit in &candidates {
            rows.extend_from_slice(self.vector(hit.id).unwrap_or_default());
        }
        let (query_sim, pairwise) =
            cosine_similarities(query, rows, candidates.len())?;

        let mut selected: Vec<usize> = Vec::with_capacity(k);
        let mut remaining: Vec<usize> = (0..candidates.len()).collect();
        while selected.len() < k && !remaining.is_empty() {
            let mut best = 0;
            let mut best_score = f32::NEG_INFINITY;
            for (pos, &cand) in remaining.iter().enumerate() {
                let redundancy = selected
                    .iter()
                    .map(|&s| pairwise[cand][s])
                    .fold(f32::NEG_INFINITY, f32::max);
                let redundancy =
                    if selected.is_empty() { 0.0 } else { redundancy };
                let score =
                    lambda * query_sim[cand] - (1.0 - lambda) * redundancy;
                if score > best_score {
                    best = pos;
                    best_score = score;
                }
            }
            selected.push(remaining.remove(best));
        }

        Ok(selected.into_iter().map(|i| candidates[i]).collect())
    }

    /// Persist to `dir`, replacing whatever index is there.
    ///
    /// The new index is written to a sibling staging directory first and
    /// swapped in by rename, so a failed save leaves the old index readable.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let staging = sibling(dir, "tmp");
        let retired = sibling(dir, "old");

        let stage = || -> Result<()> {
            remove_dir_if_exists(&staging)?;
            std::fs::create_dir_all(&staging)?;
            let db = IndexDb::create(&staging.join(INDEX_FILE))?;
            let manifest = Manifest {
                format_version: FORMAT_VERSION,
                model: self.model.clone(),
                dimension: self.dimension,
                count: self.len(),
            };
            db.write_all(
                &manifest,
                self.chunks.iter().enumerate().map(|(i, chunk)| {
                    let start = i * self.dimension;
                    (
                        i as u64,
                        &self.vectors[start..start + self.dimension],
                        chunk,
                    )
                }),
            )
        };
        stage().map_err(|e| {
            let _ = std::fs::remove_dir_all(&staging);
            Error::Storage(format!(
                "cannot write index {}: {e}",
                staging.display()
            ))
        })?;

        let swap = || -> Result<()> {
            remove_dir_if_exists(&retired)?;
            if dir.exists() {
                std::fs::rename(dir, &retired)?;
            }
            std::fs::rename(&staging, dir)?;
            remove_dir_if_exists(&retired)
        };
        swap().map_err(|e| {
            Error::Storage(format!(
                "cannot move new index into {}: {e}",
                dir.display()
            ))
        })?;

        tracing::info!(
            entries = self.len(),
            dimension = self.dimension,
            path = %dir.display(),
            "saved index"
        );
        Ok(())
    }

    /// Load an index saved by [`VectorIndex::save`].
    ///
    /// Fails with [`Error::IndexMissing`] if `dir` holds no index and with
    /// [`Error::Storage`] if the stored tables disagree with the manifest.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(INDEX_FILE);
        if !path.is_file() {
            return Err(Error::IndexMissing(dir.to_path_buf()));
        }

        let db = IndexDb::open(&path)?;
        let manifest = db.manifest()?;
        let entries = db.entries()?;

        if entries.len() != manifest.count {
            return Err(Error::Storage(format!(
                "index manifest lists {} entries but {} are stored",
                manifest.count,
                entries.len()
            )));
        }

        let mut index = Self::new(manifest.model, manifest.dimension);
        index.vectors.reserve(entries.len() * manifest.dimension);
        for (expected_id, entry) in entries.into_iter().enumerate() {
            if entry.id != expected_id as u64 {
                return Err(Error::Storage(format!(
                    "index ids are not contiguous: expected {expected_id}, \
                     found {}",
                    entry.id
                )));
            }
            index.add(&entry.vector, entry.chunk).map_err(|_| {
                Error::Storage(format!(
                    "vector {} does not match the index dimension",
                    entry.id
                ))
            })?;
        }

        tracing::debug!(
            entries = index.len(),
            path = %dir.display(),
            "loaded index"
        );
        Ok(index)
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(Error::Config(format!(
                "vector has dimension {}, index expects {}",
                vector.len(),
                self.dimension
            )));
        }
        Ok(())
    }

    /// Euclidean distance from `query` to every stored vector.
    fn distances(&self, query: &[f32]) -> Result<Vec<f32>> {
        let matrix = Tensor::from_slice(
            &self.vectors,
            (self.len(), self.dimension),
            &Device::Cpu,
        )
        .map_err(map_candle_err)?;
        let query = Tensor::from_slice(query, (1, self.dimension), &Device::Cpu)
            .map_err(map_candle_err)?;

        matrix
            .broadcast_sub(&query)
            .and_then(|diff| diff.sqr())
            .and_then(|sq| sq.sum(1))
            .and_then(|sum| sum.sqrt())
            .and_then(|d| d.to_vec1::<f32>())
            .map_err(map_candle_err)
    }
}

/// Cosine similarity of each row to the query, and of each row to each row.
fn cosine_similarities(
    query: &[f32],
    rows: Vec<f32>,
    count: usize,
) -> Result<(Vec<f32>, Vec<Vec<f32>>)> {
    let dimension = query.len();
    let normalize = |t: Tensor| -> candle_core::Result<Tensor> {
        let norms = t.sqr()?.sum_keepdim(1)?.sqrt()?.affine(1.0, 1e-12)?;
        t.broadcast_div(&norms)
    };

    let compute = || -> candle_core::Result<(Vec<f32>, Vec<Vec<f32>>)> {
        let rows = Tensor::from_vec(rows, (count, dimension), &Device::Cpu)?;
        let rows = normalize(rows)?;
        let query = Tensor::from_slice(query, (1, dimension), &Device::Cpu)?;
        let query = normalize(query)?;
        let query_sim =
            rows.matmul(&query.t()?)?.squeeze(1)?.to_vec1::<f32>()?;
        let pairwise = rows.matmul(&rows.t()?)?.to_vec2::<f32>()?;
        Ok((query_sim, pairwise))
    };

    compute().map_err(map_candle_err)
}

fn map_candle_err(e: candle_core::Error) -> Error {
    Error::Config(format!("tensor computation error: {e}"))
}

fn sibling(dir: &Path, suffix: &str) -> PathBuf {
    let mut name = dir
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "index".into());
    name.push(".");
    name.push(suffix);
    dir.with_file_name(name)
}

fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
