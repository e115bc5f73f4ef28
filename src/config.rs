//! Runtime configuration.
//!
//! A [`Config`] is resolved once at startup and passed by reference to every
//! component. Each setting is looked up in order of priority:
//!
//! 1. a command-line override,
//! 2. the `COURSEDEX_<KEY>` environment variable,
//! 3. the `settings` table in `config.redb` (`coursedex config set`),
//! 4. the built-in default.
//!
//! Credentials are only ever read from the environment and never persisted.

use std::{collections::HashMap, fmt, str::FromStr, time::Duration};

use crate::{
    chunking::{ChunkingConfig, DEFAULT_OVERLAP, DEFAULT_WINDOW},
    config_db::ConfigDb,
    embedding::RetryPolicy,
    error::{Error, Result},
};

pub const ENV_PREFIX: &str = "COURSEDEX_";
pub const API_KEY_ENV_VARS: [&str; 2] = ["COURSEDEX_API_KEY", "OPENAI_API_KEY"];

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_EMBEDDING_MODEL: &str = "text-embedding-ada-002";
pub const DEFAULT_LOCAL_EMBEDDING_MODEL: &str =
    "lightonai/GTE-ModernColBERT-v1";
pub const DEFAULT_HASH_DIMENSION: usize = 256;
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_COURSE_NAME: &str = "this course module";

/// Every key accepted by `coursedex config set`, with a short description.
pub const SETTINGS: &[(&str, &str)] = &[
    ("chunk_window", "words per chunk (default 80)"),
    ("chunk_overlap", "words shared by adjacent chunks (default 20)"),
    ("embedding_provider", "openai, local or hash (default openai)"),
    ("embedding_model", "embedding model id or local model path"),
    (
        "embedding_dimensions",
        "requested vector dimension, if the provider supports it",
    ),
    ("embedding_batch_size", "texts per embedding request (default 64)"),
    ("embedding_parallelism", "embedding requests in flight (default 4)"),
    ("embedding_retries", "attempts per embedding request (default 3)"),
    ("api_base_url", "OpenAI-compatible API base URL"),
    ("request_timeout_secs", "timeout for each HTTP request (default 60)"),
    ("chat_model", "chat completion model (default gpt-4o-mini)"),
    ("chat_temperature", "sampling temperature, 0 to 2 (default 0)"),
    ("history_turns", "question/answer pairs kept per session (default 10)"),
    ("retrieval_mode", "mmr or similarity (default mmr)"),
    ("retrieval_k", "chunks handed to the model per question (default 5)"),
    ("retrieval_fetch_k", "MMR candidate pool size (default 20)"),
    ("retrieval_lambda", "MMR relevance weight, 0 to 1 (default 0.5)"),
    ("course_name", "course named in the tutor prompt"),
    ("course_overview", "answer to \"what can you do\" questions"),
];

/// Snapshot of the environment variables the configuration reads.
#[derive(Debug, Clone, Default)]
pub struct EnvVars {
    vars: HashMap<String, String>,
}

impl EnvVars {
    /// Capture `COURSEDEX_*` and the API key variables from the process.
    pub fn from_process() -> Self {
        Self::from_pairs(std::env::vars().filter(|(k, _)| {
            k.starts_with(ENV_PREFIX) || API_KEY_ENV_VARS.contains(&k.as_str())
        }))
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str).filter(|v| !v.is_empty())
    }

    fn setting(&self, key: &str) -> Option<&str> {
        self.get(&format!("{ENV_PREFIX}{}", key.to_ascii_uppercase()))
    }

    fn api_key(&self) -> Option<String> {
        API_KEY_ENV_VARS
            .iter()
            .find_map(|name| self.get(name))
            .map(|k| k.trim().to_string())
    }
}

/// Command-line overrides, keyed like [`SETTINGS`].
pub type Overrides = HashMap<&'static str, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingProvider {
    /// OpenAI-compatible `/embeddings` endpoint.
    OpenAi,
    /// ColBERT model run in-process, mean-pooled to one vector.
    Local,
    /// Deterministic feature hashing, no network or model.
    Hash,
}

impl FromStr for EmbeddingProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "local" | "colbert" => Ok(Self::Local),
            "hash" => Ok(Self::Hash),
            other => Err(Error::Config(format!(
                "unknown embedding provider `{other}` \
                 (expected openai, local or hash)"
            ))),
        }
    }
}

impl fmt::Display for EmbeddingProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OpenAi => "openai",
            Self::Local => "local",
            Self::Hash => "hash",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalMode {
    Mmr,
    Similarity,
}

impl FromStr for RetrievalMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mmr" => Ok(Self::Mmr),
            "similarity" => Ok(Self::Similarity),
            other => Err(Error::Config(format!(
                "unknown retrieval mode `{other}` (expected mmr or similarity)"
            ))),
        }
    }
}

impl fmt::Display for RetrievalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Mmr => "mmr",
            Self::Similarity => "similarity",
        })
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub model: String,
    pub dimensions: Option<usize>,
    pub batch_size: usize,
    pub parallelism: usize,
    pub retry: RetryPolicy,
}

#[derive(Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl ApiConfig {
    /// The API key, or a configuration error explaining how to provide one.
    pub fn require_key(&self) -> Result<&str> {
        self.api_key.as_deref().ok_or_else(|| {
            Error::Config(format!(
                "missing API key: set {} or {}",
                API_KEY_ENV_VARS[0], API_KEY_ENV_VARS[1]
            ))
        })
    }
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub model: String,
    pub temperature: f32,
    pub history_turns: usize,
    pub course_name: String,
    pub course_overview: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct RetrievalConfig {
    pub mode: RetrievalMode,
    pub k: usize,
    pub fetch_k: usize,
    pub lambda: f32,
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub api: ApiConfig,
    pub chat: ChatConfig,
    pub retrieval: RetrievalConfig,
}

impl Config {
    /// Resolve the configuration from overrides, environment and stored
    /// settings.
    pub fn resolve(
        db: &ConfigDb,
        env: &EnvVars,
        overrides: &Overrides,
    ) -> Result<Self> {
        let mut config = Self::from_lookup(|key| {
            if let Some(v) = overrides.get(key) {
                return Ok(Some(v.clone()));
            }
            if let Some(v) = env.setting(key) {
                return Ok(Some(v.to_string()));
            }
            db.get_setting(key)
        })?;
        config.api.api_key = env.api_key();
        Ok(config)
    }

    /// Check that `value` is acceptable for `key` before storing it.
    ///
    /// Chunk window and overlap are checked together with the other one's
    /// stored value; every other key is checked on its own.
    pub fn validate_setting(
        db: &ConfigDb,
        key: &str,
        value: &str,
    ) -> Result<()> {
        if !SETTINGS.iter().any(|(k, _)| *k == key) {
            return Err(Error::NotFound {
                kind: "setting",
                name: key.to_string(),
            });
        }
        let chunking_key =
            |k: &str| k == "chunk_window" || k == "chunk_overlap";
        let config = Self::from_lookup(|k| {
            if k == key {
                Ok(Some(value.to_string()))
            } else if chunking_key(key) && chunking_key(k) {
                db.get_setting(k)
            } else {
                Ok(None)
            }
        })?;
        if chunking_key(key) {
            config.chunking.step()?;
        }
        Ok(())
    }

    /// The resolved value of a setting, rendered the way `config set` takes it.
    pub fn setting_value(&self, key: &str) -> Option<String> {
        let value = match key {
            "chunk_window" => self.chunking.window.to_string(),
            "chunk_overlap" => self.chunking.overlap.to_string(),
            "embedding_provider" => self.embedding.provider.to_string(),
            "embedding_model" => self.embedding.model.clone(),
            "embedding_dimensions" => self.embedding.dimensions?.to_string(),
            "embedding_batch_size" => self.embedding.batch_size.to_string(),
            "embedding_parallelism" => self.embedding.parallelism.to_string(),
            "embedding_retries" => {
                self.embedding.retry.max_attempts.to_string()
            }
            "api_base_url" => self.api.base_url.clone(),
            "request_timeout_secs" => self.api.timeout.as_secs().to_string(),
            "chat_model" => self.chat.model.clone(),
            "chat_temperature" => self.chat.temperature.to_string(),
            "history_turns" => self.chat.history_turns.to_string(),
            "retrieval_mode" => self.retrieval.mode.to_string(),
            "retrieval_k" => self.retrieval.k.to_string(),
            "retrieval_fetch_k" => self.retrieval.fetch_k.to_string(),
            "retrieval_lambda" => self.retrieval.lambda.to_string(),
            "course_name" => self.chat.course_name.clone(),
            "course_overview" => self.chat.course_overview.clone()?,
            _ => return None,
        };
        Some(value)
    }

    fn from_lookup(
        lookup: impl Fn(&str) -> Result<Option<String>>,
    ) -> Result<Self> {
        let lookup: Lookup<'_> = &lookup;
        let text = |key: &str, default: &str| -> Result<String> {
            Ok(lookup(key)?.unwrap_or_else(|| default.to_string()))
        };

        let provider: EmbeddingProvider =
            text("embedding_provider", "openai")?.parse()?;
        let default_model = match provider {
            EmbeddingProvider::OpenAi => DEFAULT_OPENAI_EMBEDDING_MODEL,
            EmbeddingProvider::Local => DEFAULT_LOCAL_EMBEDDING_MODEL,
            EmbeddingProvider::Hash => "hash",
        };
        let mut dimensions = lookup("embedding_dimensions")?
            .map(|v| parse_number::<usize>("embedding_dimensions", &v))
            .transpose()?;
        if provider == EmbeddingProvider::Hash && dimensions.is_none() {
            dimensions = Some(DEFAULT_HASH_DIMENSION);
        }

        let (window, overlap) =
            (DEFAULT_WINDOW.to_string(), DEFAULT_OVERLAP.to_string());
        let chunking = ChunkingConfig {
            window: number(lookup, "chunk_window", &window)?,
            overlap: number(lookup, "chunk_overlap", &overlap)?,
        };

        let retries: usize = at_least_one(
            "embedding_retries",
            number(lookup, "embedding_retries", "3")?,
        )?;
        let embedding = EmbeddingConfig {
            provider,
            model: text("embedding_model", default_model)?,
            dimensions,
            batch_size: at_least_one(
                "embedding_batch_size",
                number(lookup, "embedding_batch_size", "64")?,
            )?,
            parallelism: at_least_one(
                "embedding_parallelism",
                number(lookup, "embedding_parallelism", "4")?,
            )?,
            retry: RetryPolicy {
                max_attempts: retries as u32,
                ..RetryPolicy::default()
            },
        };

        let timeout_secs: u64 = number(lookup, "request_timeout_secs", "60")?;
        let api = ApiConfig {
            base_url: text("api_base_url", DEFAULT_BASE_URL)?
                .trim_end_matches('/')
                .to_string(),
            api_key: None,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        };

        let temperature: f32 = number(lookup, "chat_temperature", "0")?;
        if !(0.0..=2.0).contains(&temperature) {
            return Err(Error::Config(format!(
                "chat_temperature must be between 0 and 2, got {temperature}"
            )));
        }
        let chat = ChatConfig {
            model: text("chat_model", DEFAULT_CHAT_MODEL)?,
            temperature,
            history_turns: number(lookup, "history_turns", "10")?,
            course_name: text("course_name", DEFAULT_COURSE_NAME)?,
            course_overview: lookup("course_overview")?
                .filter(|s| !s.trim().is_empty()),
        };

        let k =
            at_least_one("retrieval_k", number(lookup, "retrieval_k", "5")?)?;
        let lambda: f32 = number(lookup, "retrieval_lambda", "0.5")?;
        if !(0.0..=1.0).contains(&lambda) {
            return Err(Error::Config(format!(
                "retrieval_lambda must be between 0 and 1, got {lambda}"
            )));
        }
        let fetch_k: usize = number(lookup, "retrieval_fetch_k", "20")?;
        let retrieval = RetrievalConfig {
            mode: text("retrieval_mode", "mmr")?.parse()?,
            k,
            fetch_k: fetch_k.max(k),
            lambda,
        };

        Ok(Self {
            chunking,
            embedding,
            api,
            chat,
            retrieval,
        })
    }
}

type Lookup<'a> = &'a dyn Fn(&str) -> Result<Option<String>>;

/// Parse the value stored for `key`, or `default` when there is none.
fn number<T: FromStr>(
    lookup: Lookup<'_>,
    key: &str,
    default: &str,
) -> Result<T> {
    match lookup(key)? {
        Some(raw) => parse_number(key, &raw),
        None => parse_number(key, default),
    }
}

fn parse_number<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| {
        Error::Config(format!("invalid value for `{key}`: {raw:?}"))
    })
}

fn at_least_one(key: &str, value: usize) -> Result<usize> {
    if value == 0 {
        return Err(Error::Config(format!("`{key}` must be at least 1")));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, ConfigDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = ConfigDb::open(&tmp.path().join("config.db")).unwrap();
        (tmp, db)
    }

    fn resolve_default(db: &ConfigDb) -> Result<Config> {
        Config::resolve(db, &EnvVars::default(), &Overrides::new())
    }

    #[test]
    fn defaults() {
        let (_tmp, db) = test_db();
        let config = resolve_default(&db).unwrap();

        assert_eq!(config.chunking, ChunkingConfig::default());
        assert_eq!(config.embedding.provider, EmbeddingProvider::OpenAi);
        assert_eq!(config.embedding.model, DEFAULT_OPENAI_EMBEDDING_MODEL);
        assert_eq!(config.embedding.dimensions, None);
        assert_eq!(config.api.base_url, DEFAULT_BASE_URL);
        assert!(config.api.api_key.is_none());
        assert_eq!(config.chat.model, DEFAULT_CHAT_MODEL);
        assert_eq!(config.retrieval.mode, RetrievalMode::Mmr);
        assert_eq!(config.retrieval.k, 5);
        assert_eq!(config.retrieval.fetch_k, 20);
    }

    #[test]
    fn override_beats_env_beats_db() {
        let (_tmp, db) = test_db();
        db.set_setting("chunk_window", "100").unwrap();
        db.set_setting("chunk_overlap", "10").unwrap();
        db.set_setting("retrieval_k", "3").unwrap();

        let env = EnvVars::from_pairs([("COURSEDEX_CHUNK_WINDOW", "90")]);
        let mut overrides = Overrides::new();
        overrides.insert("chunk_overlap", "30".to_string());

        let config = Config::resolve(&db, &env, &overrides).unwrap();
        assert_eq!(config.chunking.window, 90);
        assert_eq!(config.chunking.overlap, 30);
        assert_eq!(config.retrieval.k, 3);
    }

    #[test]
    fn api_key_comes_from_environment_only() {
        let (_tmp, db) = test_db();
        let env = EnvVars::from_pairs([("OPENAI_API_KEY", " sk-test ")]);
        let config = Config::resolve(&db, &env, &Overrides::new()).unwrap();
        assert_eq!(config.api.require_key().unwrap(), "sk-test");

        let preferred = EnvVars::from_pairs([
            ("OPENAI_API_KEY", "sk-openai"),
            ("COURSEDEX_API_KEY", "sk-coursedex"),
        ]);
        let config =
            Config::resolve(&db, &preferred, &Overrides::new()).unwrap();
        assert_eq!(config.api.api_key.as_deref(), Some("sk-coursedex"));
    }

    #[test]
    fn missing_api_key_is_config_error() {
        let (_tmp, db) = test_db();
        let config = resolve_default(&db).unwrap();
        assert!(matches!(config.api.require_key(), Err(Error::Config(_))));
    }

    #[test]
    fn debug_output_redacts_api_key() {
        let (_tmp, db) = test_db();
        let env = EnvVars::from_pairs([("OPENAI_API_KEY", "sk-secret")]);
        let config = Config::resolve(&db, &env, &Overrides::new()).unwrap();
        assert!(!format!("{config:?}").contains("sk-secret"));
    }

    #[test]
    fn hash_provider_gets_default_dimension() {
        let (_tmp, db) = test_db();
        db.set_setting("embedding_provider", "hash").unwrap();
        let config = resolve_default(&db).unwrap();
        assert_eq!(config.embedding.provider, EmbeddingProvider::Hash);
        assert_eq!(config.embedding.dimensions, Some(DEFAULT_HASH_DIMENSION));
    }

    #[test]
    fn fetch_k_is_never_below_k() {
        let (_tmp, db) = test_db();
        db.set_setting("retrieval_k", "8").unwrap();
        db.set_setting("retrieval_fetch_k", "2").unwrap();
        let config = resolve_default(&db).unwrap();
        assert_eq!(config.retrieval.fetch_k, 8);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let (_tmp, db) = test_db();
        db.set_setting("retrieval_lambda", "1.5").unwrap();
        let err = resolve_default(&db).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn every_setting_renders_a_value_that_validates() {
        let (_tmp, db) = test_db();
        db.set_setting("embedding_dimensions", "512").unwrap();
        db.set_setting("course_overview", "- Chapter 7").unwrap();
        let config = resolve_default(&db).unwrap();

        for (key, _) in SETTINGS {
            let value = config.setting_value(key).unwrap();
            Config::validate_setting(&db, key, &value).unwrap();
        }
        assert_eq!(config.setting_value("unknown"), None);
    }

    #[test]
    fn validate_setting_checks_keys_and_values() {
        let (_tmp, db) = test_db();
        assert!(Config::validate_setting(&db, "chunk_window", "120").is_ok());
        assert!(matches!(
            Config::validate_setting(&db, "chunk_window", "ten"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::validate_setting(&db, "chunk_overlap", "80"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::validate_setting(&db, "embedding_provider", "magic"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::validate_setting(&db, "no_such_key", "1"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn chunk_overlap_is_checked_against_stored_window() {
        let (_tmp, db) = test_db();
        db.set_setting("chunk_window", "200").unwrap();
        assert!(Config::validate_setting(&db, "chunk_overlap", "100").is_ok());
        assert!(matches!(
            Config::validate_setting(&db, "chunk_overlap", "200"),
            Err(Error::Config(_))
        ));

        // Unrelated keys ignore a broken stored chunking pair.
        db.set_setting("chunk_overlap", "500").unwrap();
        assert!(Config::validate_setting(&db, "retrieval_k", "3").is_ok());
    }
}
