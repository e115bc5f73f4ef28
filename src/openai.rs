//! Blocking clients for OpenAI-compatible HTTP endpoints.
//!
//! Both clients report failures as [`Error::Upstream`], flagged transient for
//! timeouts, connection failures, `429` and `5xx` responses. Retrying is left
//! to the caller.

use std::time::Duration;

use reqwest::{
    StatusCode,
    blocking::{Client, Response},
    header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue},
};
use serde::{Deserialize, Serialize};

use crate::{
    config::{ApiConfig, EmbeddingConfig},
    embedding::Embedder,
    error::{Error, Result},
    llm::{ChatMessage, LanguageModel},
};

const EMBEDDINGS: &str = "embeddings";
const CHAT: &str = "chat completion";

fn build_client(api_key: &str, timeout: Duration) -> Result<Client> {
    let mut headers = HeaderMap::new();
    let auth = format!("Bearer {}", api_key.trim());
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&auth).map_err(|_| {
            Error::Config("API key contains invalid characters".into())
        })?,
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Client::builder()
        .timeout(timeout)
        .default_headers(headers)
        .build()
        .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn send_error(service: &'static str, err: reqwest::Error) -> Error {
    let transient = err.is_timeout() || err.is_connect() || err.is_request();
    Error::upstream(service, transient, err.to_string())
}

/// Turn a non-success response into an upstream error.
fn status_error(service: &'static str, resp: Response) -> Error {
    let status = resp.status();
    let body = resp
        .text()
        .unwrap_or_else(|_| "<body unavailable>".to_string());
    Error::upstream(
        service,
        is_transient_status(status),
        format!("{status}: {}", body.trim()),
    )
}

/// Embeddings client for `POST {base_url}/embeddings`.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: Option<usize>,
}

impl OpenAiEmbedder {
    pub fn new(api: &ApiConfig, embedding: &EmbeddingConfig) -> Result<Self> {
        if embedding.model.trim().is_empty() {
            return Err(Error::Config("missing embedding model name".into()));
        }
        Ok(Self {
            client: build_client(api.require_key()?, api.timeout)?,
            endpoint: format!("{}/embeddings", api.base_url),
            model: embedding.model.clone(),
            dimensions: embedding.dimensions,
        })
    }
}

impl Embedder for OpenAiEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> Option<usize> {
        self.dimensions
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: self.dimensions,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .map_err(|e| send_error(EMBEDDINGS, e))?;
        if !resp.status().is_success() {
            return Err(status_error(EMBEDDINGS, resp));
        }

        let mut parsed: EmbeddingResponse = resp.json().map_err(|e| {
            Error::upstream(
                EMBEDDINGS,
                false,
                format!("malformed response: {e}"),
            )
        })?;
        parsed.data.sort_by_key(|entry| entry.index);
        if parsed.data.len() != texts.len() {
            return Err(Error::upstream(
                EMBEDDINGS,
                false,
                format!(
                    "returned {} embeddings for {} inputs",
                    parsed.data.len(),
                    texts.len()
                ),
            ));
        }
        Ok(parsed.data.into_iter().map(|entry| entry.embedding).collect())
    }
}

impl std::fmt::Debug for OpenAiEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiEmbedder")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    #[serde(borrow)]
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// Chat client for `POST {base_url}/chat/completions`.
#[derive(Clone)]
pub struct OpenAiChat {
    client: Client,
    endpoint: String,
    model: String,
    temperature: f32,
}

impl OpenAiChat {
    pub fn new(api: &ApiConfig, model: &str, temperature: f32) -> Result<Self> {
        Ok(Self {
            client: build_client(api.require_key()?, api.timeout)?,
            endpoint: format!("{}/chat/completions", api.base_url),
            model: model.to_string(),
            temperature,
        })
    }
}

impl LanguageModel for OpenAiChat {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .map_err(|e| send_error(CHAT, e))?;
        if !resp.status().is_success() {
            return Err(status_error(CHAT, resp));
        }

        let parsed: ChatResponse = resp.json().map_err(|e| {
            Error::upstream(CHAT, false, format!("malformed response: {e}"))
        })?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .ok_or_else(|| {
                Error::upstream(CHAT, false, "response contained no message")
            })
    }
}

impl std::fmt::Debug for OpenAiChat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiChat")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}
