use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{service} request failed ({}): {message}", transience(.transient))]
    Upstream {
        service: &'static str,
        transient: bool,
        message: String,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("empty input: {0}")]
    EmptyInput(String),

    #[error(
        "no index found at {0}; \
         run `coursedex build` (or `coursedex index`) first"
    )]
    IndexMissing(PathBuf),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}

fn transience(transient: &bool) -> &'static str {
    if *transient { "transient" } else { "permanent" }
}

impl Error {
    pub(crate) fn upstream(
        service: &'static str,
        transient: bool,
        message: impl Into<String>,
    ) -> Self {
        Self::Upstream {
            service,
            transient,
            message: message.into(),
        }
    }

    /// Whether retrying the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Upstream { transient: true, .. })
    }
}
