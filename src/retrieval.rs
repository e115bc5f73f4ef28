use std::sync::Arc;

use serde::Serialize;

use crate::{
    chunking::Chunk,
    config::{RetrievalConfig, RetrievalMode},
    embedding::{Embedder, RetryPolicy, embed_query},
    error::{Error, Result},
    vector_index::{Hit, VectorIndex},
};

/// A chunk returned for a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Retrieved {
    pub id: u64,
    pub distance: f32,
    #[serde(flatten)]
    pub chunk: Chunk,
}

/// Read-only query handle over a loaded index.
///
/// Cheap to clone; the index and embedder are shared.
#[derive(Clone)]
pub struct Retriever {
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    retry: RetryPolicy,
}

impl Retriever {
    /// Pair an index with the embedder used to embed queries.
    ///
    /// Fails if the index was built with a different embedding model or
    /// vector dimension than the embedder produces.
    pub fn new(
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        if index.model() != embedder.model_id() {
            return Err(Error::Config(format!(
                "index was built with embedding model `{}` but `{}` is \
                 configured; rebuild the index or set embedding_model",
                index.model(),
                embedder.model_id()
            )));
        }
        if let Some(dimension) = embedder.dimension()
            && dimension != index.dimension()
        {
            return Err(Error::Config(format!(
                "index holds {}-dimensional vectors but the embedder \
                 produces {dimension}; rebuild the index or set \
                 embedding_dimensions",
                index.dimension()
            )));
        }
        Ok(Self {
            index,
            embedder,
            retry,
        })
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    /// The `k` chunks nearest to `query`.
    pub fn similarity(&self, query: &str, k: usize) -> Result<Vec<Retrieved>> {
        let vector = self.embed(query)?;
        let hits = self.index.search(&vector, k)?;
        Ok(self.resolve(hits))
    }

    /// `k` relevant but mutually diverse chunks for `query`.
    pub fn mmr(
        &self,
        query: &str,
        k: usize,
        fetch_k: usize,
        lambda: f32,
    ) -> Result<Vec<Retrieved>> {
        let vector = self.embed(query)?;
        let hits = self.index.search_mmr(&vector, k, fetch_k, lambda)?;
        Ok(self.resolve(hits))
    }

    /// Retrieve with the configured strategy.
    pub fn retrieve(
        &self,
        query: &str,
        config: &RetrievalConfig,
    ) -> Result<Vec<Retrieved>> {
        match config.mode {
            RetrievalMode::Mmr => {
                self.mmr(query, config.k, config.fetch_k, config.lambda)
            }
            RetrievalMode::Similarity => self.similarity(query, config.k),
        }
    }

    fn embed(&self, query: &str) -> Result<Vec<f32>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::EmptyInput("query is blank".into()));
        }
        embed_query(self.embedder.as_ref(), query, &self.retry)
    }

    fn resolve(&self, hits: Vec<Hit>) -> Vec<Retrieved> {
        hits.into_iter()
            .filter_map(|hit| {
                self.index.get(hit.id).map(|chunk| Retrieved {
                    id: hit.id,
                    distance: hit.distance,
                    chunk: chunk.clone(),
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for Retriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retriever")
            .field("model", &self.index.model())
            .field("entries", &self.index.len())
            .finish_non_exhaustive()
    }
}
