use std::sync::Mutex;

use candle_core::{DType, Device, Tensor};
use pylate_rs::ColBERT;

use crate::{
    embedding::Embedder,
    error::{Error, Result},
};

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

/// Embeds chunks with a ColBERT model running in-process.
///
/// Token embeddings are mean-pooled into one vector per text and
/// L2-normalized, so they fit the same flat index as API embeddings. The
/// model is downloaded (or read from a local path) on first use.
pub struct LocalEmbedder {
    model: Mutex<Option<ColBERT>>,
    model_id: String,
}

impl LocalEmbedder {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model: Mutex::new(None),
            model_id: model_id.into(),
        }
    }

    fn encode(&self, texts: &[String]) -> Result<Tensor> {
        let mut guard = self
            .model
            .lock()
            .map_err(|_| Error::Config("local model lock poisoned".into()))?;

        if guard.is_none() {
            tracing::info!(
                model = %self.model_id,
                "loading local embedding model"
            );
            let colbert: ColBERT = ColBERT::from(&self.model_id)
                .with_device(default_device())
                .try_into()
                .map_err(|e| model_error(&self.model_id, e))?;
            *guard = Some(colbert);
        }

        let Some(model) = guard.as_mut() else {
            return Err(Error::Config("local model failed to load".into()));
        };
        model
            .encode(texts, false)
            .map_err(|e| model_error(&self.model_id, e))
    }
}

impl Embedder for LocalEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> Option<usize> {
        None
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let owned: Vec<String> = texts.iter().map(|t| t.to_string()).collect();
        let tokens = self.encode(&owned)?;
        mean_pool(&tokens)
    }
}

impl std::fmt::Debug for LocalEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEmbedder")
            .field("model_id", &self.model_id)
            .finish_non_exhaustive()
    }
}

fn model_error(model_id: &str, e: impl std::fmt::Display) -> Error {
    Error::Config(format!("local model {model_id}: {e}"))
}

/// Average `[batch, tokens, dim]` token embeddings into unit-length
/// `[batch, dim]` vectors.
fn mean_pool(tokens: &Tensor) -> Result<Vec<Vec<f32>>> {
    let pooled = tokens
        .to_dtype(DType::F32)
        .and_then(|t| t.mean(1))
        .map_err(map_candle_err)?;
    let norms = pooled
        .sqr()
        .and_then(|t| t.sum_keepdim(1))
        .and_then(|t| t.sqrt())
        .and_then(|t| t.affine(1.0, 1e-12))
        .map_err(map_candle_err)?;
    pooled
        .broadcast_div(&norms)
        .and_then(|t| t.to_vec2::<f32>())
        .map_err(map_candle_err)
}

fn map_candle_err(e: candle_core::Error) -> Error {
    Error::Config(format!("tensor error: {e}"))
}
