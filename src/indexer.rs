use crate::{
    chunking::Chunk,
    config::{Config, EmbeddingConfig, EmbeddingProvider},
    embedding::{EmbedOptions, Embedder, HashEmbedder, embed_all},
    error::{Error, Result},
    llm::LanguageModel,
    model_manager::LocalEmbedder,
    openai::{OpenAiChat, OpenAiEmbedder},
    vector_index::VectorIndex,
};

/// Bulk embedding settings for `config`.
pub fn embed_options(config: &EmbeddingConfig, progress: bool) -> EmbedOptions {
    EmbedOptions {
        batch_size: config.batch_size,
        parallelism: config.parallelism,
        retry: config.retry,
        progress,
    }
}

/// Build the embedder selected by the configuration.
pub fn build_embedder(config: &Config) -> Result<Box<dyn Embedder>> {
    let embedding = &config.embedding;
    Ok(match embedding.provider {
        EmbeddingProvider::OpenAi => {
            Box::new(OpenAiEmbedder::new(&config.api, embedding)?)
        }
        EmbeddingProvider::Local => {
            Box::new(LocalEmbedder::new(embedding.model.clone()))
        }
        EmbeddingProvider::Hash => Box::new(HashEmbedder::new(
            embedding
                .dimensions
                .unwrap_or(crate::config::DEFAULT_HASH_DIMENSION),
        )),
    })
}

/// Build the chat model used to answer questions.
pub fn build_language_model(config: &Config) -> Result<Box<dyn LanguageModel>> {
    Ok(Box::new(OpenAiChat::new(
        &config.api,
        &config.chat.model,
        config.chat.temperature,
    )?))
}

/// Embed every chunk and collect the results into a fresh index.
///
/// The entry with id `i` is always `chunks[i]`. Nothing is returned unless
/// every chunk was embedded.
pub fn build_index(
    chunks: Vec<Chunk>,
    embedder: &dyn Embedder,
    options: &EmbedOptions,
) -> Result<VectorIndex> {
    if chunks.is_empty() {
        return Err(Error::EmptyInput("no chunks to index".into()));
    }

    tracing::info!(
        chunks = chunks.len(),
        model = embedder.model_id(),
        batch_size = options.batch_size,
        "embedding chunks"
    );
    let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
    let vectors = embed_all(embedder, &texts, options)?;

    let dimension = vectors.first().map_or(0, Vec::len);
    let mut index = VectorIndex::new(embedder.model_id(), dimension);
    for (vector, chunk) in vectors.iter().zip(chunks) {
        index.add(vector, chunk)?;
    }

    tracing::info!(entries = index.len(), dimension, "index built");
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::RetryPolicy;

    fn options() -> EmbedOptions {
        EmbedOptions {
            batch_size: 2,
            parallelism: 2,
            retry: RetryPolicy::none(),
            progress: false,
        }
    }

    #[test]
    fn every_chunk_gets_one_entry() {
        let chunks: Vec<Chunk> = (0..5)
            .map(|i| Chunk::new("Chapter 1", format!("chunk number {i}")))
            .collect();
        let index =
            build_index(chunks.clone(), &HashEmbedder::new(32), &options())
                .unwrap();

        assert_eq!(index.len(), 5);
        assert_eq!(index.dimension(), 32);
        assert_eq!(index.model(), "hash-32");
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(index.get(i as u64), Some(chunk));
        }
    }

    #[test]
    fn exact_text_is_its_own_nearest_neighbour() {
        let chunks = vec![
            Chunk::new("Chapter 7", "collaborative filtering recommends items"),
            Chunk::new("Chapter 8", "bias audits measure fairness of models"),
            Chunk::new("Chapter 8", "privacy law governs personal data"),
        ];
        let embedder = HashEmbedder::new(64);
        let index = build_index(chunks, &embedder, &options()).unwrap();

        let query = embedder
            .embed("bias audits measure fairness of models")
            .unwrap();
        let hits = index.search(&query, 1).unwrap();
        assert_eq!(hits[0].id, 1);
        assert!(hits[0].distance < 1e-5);
    }

    #[test]
    fn empty_chunk_list_is_rejected() {
        let err = build_index(Vec::new(), &HashEmbedder::new(8), &options())
            .unwrap_err();
        assert!(matches!(err, Error::EmptyInput(_)));
    }
}
