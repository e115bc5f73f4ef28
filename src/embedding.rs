use std::{sync::Mutex, time::Duration};

use kdam::BarExt;
use rayon::prelude::*;

use crate::error::{Error, Result};

/// Produces one fixed-dimension vector per input text.
///
/// Implementations are shared between threads while a batch run embeds
/// several requests in parallel, and between MCP handlers at query time.
pub trait Embedder: Send + Sync {
    /// Identifier of the model behind this embedder, stored in the index
    /// manifest so a query-time embedder can be checked against it.
    fn model_id(&self) -> &str;

    /// Vector dimension, if known before the first call.
    fn dimension(&self) -> Option<usize>;

    /// Embed a batch of texts, returning vectors in input order.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text.
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text])?.into_iter().next().ok_or_else(|| {
            Error::upstream("embeddings", false, "empty embedding response")
        })
    }
}

/// How often, and how patiently, a failed batch is retried.
///
/// Only transient upstream errors are retried. A batch that still fails
/// after `max_attempts` aborts the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// A policy that gives up on the first failure.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let capped = attempt.saturating_sub(1).min(5);
        self.base_delay * (1u32 << capped)
    }
}

/// Settings for a bulk embedding run.
#[derive(Debug, Clone)]
pub struct EmbedOptions {
    /// Texts per request.
    pub batch_size: usize,
    /// Maximum number of requests in flight.
    pub parallelism: usize,
    pub retry: RetryPolicy,
    /// Draw a progress bar on stderr.
    pub progress: bool,
}

impl Default for EmbedOptions {
    fn default() -> Self {
        Self {
            batch_size: 64,
            parallelism: 4,
            retry: RetryPolicy::default(),
            progress: false,
        }
    }
}

/// Embed every text, returning vectors in input order.
///
/// Batches may be sent concurrently, but the output order always matches
/// `texts`, so ids assigned from it are reproducible. Any batch that fails
/// permanently (or exhausts its retries) fails the whole call; no text is
/// ever skipped. All vectors must share one dimension.
pub fn embed_all(
    embedder: &dyn Embedder,
    texts: &[&str],
    options: &EmbedOptions,
) -> Result<Vec<Vec<f32>>> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }

    let batches: Vec<&[&str]> =
        texts.chunks(options.batch_size.max(1)).collect();
    let progress = options.progress.then(|| {
        Mutex::new(kdam::tqdm!(
            total = texts.len(),
            desc = "Embedding",
            unit = " chunks"
        ))
    });

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.parallelism.max(1))
        .build()
        .map_err(|e| {
            Error::Config(format!("cannot start embedding workers: {e}"))
        })?;

    let per_batch: Vec<Vec<Vec<f32>>> = pool.install(|| {
        batches
            .par_iter()
            .enumerate()
            .map(|(batch_idx, batch)| {
                let vectors = embed_with_retry(
                    embedder,
                    batch,
                    &options.retry,
                    batch_idx,
                )?;
                if vectors.len() != batch.len() {
                    return Err(Error::upstream(
                        "embeddings",
                        false,
                        format!(
                            "received {} vectors for {} texts",
                            vectors.len(),
                            batch.len()
                        ),
                    ));
                }
                if let Some(bar) = &progress
                    && let Ok(mut bar) = bar.lock()
                {
                    let _ = bar.update(batch.len());
                }
                tracing::debug!(
                    batch = batch_idx,
                    size = batch.len(),
                    "embedded batch"
                );
                Ok(vectors)
            })
            .collect::<Result<Vec<_>>>()
    })?;

    if let Some(bar) = progress
        && let Ok(mut bar) = bar.into_inner()
    {
        let _ = bar.refresh();
        eprintln!();
    }

    let vectors: Vec<Vec<f32>> = per_batch.into_iter().flatten().collect();
    check_dimensions(&vectors, embedder.dimension())?;
    Ok(vectors)
}

/// Embed a single query, retrying transient failures like a batch would be.
pub fn embed_query(
    embedder: &dyn Embedder,
    text: &str,
    retry: &RetryPolicy,
) -> Result<Vec<f32>> {
    embed_with_retry(embedder, &[text], retry, 0)?
        .into_iter()
        .next()
        .ok_or_else(|| {
            Error::upstream("embeddings", false, "empty embedding response")
        })
}

fn embed_with_retry(
    embedder: &dyn Embedder,
    batch: &[&str],
    policy: &RetryPolicy,
    batch_idx: usize,
) -> Result<Vec<Vec<f32>>> {
    let mut attempt = 1;
    loop {
        match embedder.embed_batch(batch) {
            Ok(vectors) => return Ok(vectors),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    batch = batch_idx,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "embedding batch failed, retrying"
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn check_dimensions(
    vectors: &[Vec<f32>],
    expected: Option<usize>,
) -> Result<()> {
    let Some(first) = vectors.first() else {
        return Ok(());
    };
    let dimension = expected.unwrap_or(first.len());
    if dimension == 0 {
        return Err(Error::upstream(
            "embeddings",
            false,
            "received empty vectors",
        ));
    }
    if let Some((idx, v)) =
        vectors.iter().enumerate().find(|(_, v)| v.len() != dimension)
    {
        return Err(Error::upstream(
            "embeddings",
            false,
            format!(
                "vector {idx} has dimension {}, expected {dimension}",
                v.len()
            ),
        ));
    }
    Ok(())
}

/// Offline embedder based on signed feature hashing of lowercase words.
///
/// Tokens are hashed with BLAKE3, so identical texts map to identical unit
/// vectors on every platform and toolchain. Useful for smoke tests and dry
/// runs; it has no notion of meaning beyond shared words.
///
/// # Examples
///
/// ```
/// use coursedex::embedding::{Embedder, HashEmbedder};
///
/// let embedder = HashEmbedder::new(64);
/// let a = embedder.embed("Computer vision").unwrap();
/// let b = embedder.embed("computer VISION").unwrap();
/// assert_eq!(a, b);
/// assert_eq!(a.len(), 64);
/// ```
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
    model_id: String,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            dimension,
            model_id: format!("hash-{dimension}"),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = blake3::hash(token.to_lowercase().as_bytes());
            let mut prefix = [0u8; 8];
            prefix.copy_from_slice(&digest.as_bytes()[..8]);
            let h = u64::from_le_bytes(prefix);
            let slot = (h % self.dimension as u64) as usize;
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            vector[slot] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

impl Embedder for HashEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.dimension)
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}
