use std::path::Path;

use redb::{
    Database,
    ReadableDatabase,
    ReadableTable,
    ReadableTableMetadata,
    TableDefinition,
};

use crate::{
    chunking::Chunk,
    error::{Error, Result},
};

const VECTORS: TableDefinition<u64, &[u8]> = TableDefinition::new("vectors");
const CHUNKS: TableDefinition<u64, &[u8]> = TableDefinition::new("chunks");
const MANIFEST: TableDefinition<&str, &str> = TableDefinition::new("manifest");

/// Header size: 4 bytes dimension.
const HEADER_SIZE: usize = 4;

/// File name of the database inside an index directory.
pub const INDEX_FILE: &str = "index.redb";

/// Layout version written into every manifest.
pub const FORMAT_VERSION: u32 = 1;

/// Summary of a persisted index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub format_version: u32,
    /// Embedding model the vectors were produced with.
    pub model: String,
    pub dimension: usize,
    pub count: usize,
}

/// One persisted entry: id, vector and the chunk it was computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub id: u64,
    pub vector: Vec<f32>,
    pub chunk: Chunk,
}

/// On-disk form of the vector index.
///
/// Vectors and chunk metadata live in separate tables keyed by the same id,
/// and are always written together in one transaction.
///
/// Binary format per vector:
/// - 4 bytes: dimension D (u32 LE)
/// - D * 4 bytes: f32 LE values
///
/// Chunk metadata is stored as JSON.
pub struct IndexDb {
    db: Database,
}

impl IndexDb {
    /// Create a fresh index database at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(VECTORS)?;
        txn.open_table(CHUNKS)?;
        txn.open_table(MANIFEST)?;
        txn.commit()?;

        Ok(Self { db })
    }

    /// Open an existing index database.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::open(path).map_err(|e| {
            Error::Storage(format!("cannot open index {}: {e}", path.display()))
        })?;
        Ok(Self { db })
    }

    /// Write the manifest and every entry in a single transaction.
    pub fn write_all<'a>(
        &self,
        manifest: &Manifest,
        entries: impl IntoIterator<Item = (u64, &'a [f32], &'a Chunk)>,
    ) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut vectors = txn.open_table(VECTORS)?;
            let mut chunks = txn.open_table(CHUNKS)?;
            for (id, vector, chunk) in entries {
                vectors.insert(id, encode_vector(vector).as_slice())?;
                chunks.insert(id, serde_json::to_vec(chunk)?.as_slice())?;
            }

            let mut table = txn.open_table(MANIFEST)?;
            let version = FORMAT_VERSION.to_string();
            table.insert("format_version", version.as_str())?;
            table.insert("model", manifest.model.as_str())?;
            table.insert("dimension", manifest.dimension.to_string().as_str())?;
            table.insert("count", manifest.count.to_string().as_str())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn manifest(&self) -> Result<Manifest> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(MANIFEST)?;

        let get = |key: &str| -> Result<String> {
            table
                .get(key)?
                .map(|v| v.value().to_string())
                .ok_or_else(|| {
                    Error::Storage(format!("index manifest is missing `{key}`"))
                })
        };
        let parse = |key: &str| -> Result<usize> {
            get(key)?.parse().map_err(|_| {
                Error::Storage(format!("index manifest has an invalid `{key}`"))
            })
        };

        let format_version = parse("format_version")? as u32;
        if format_version != FORMAT_VERSION {
            return Err(Error::Storage(format!(
                "unsupported index format version {format_version}"
            )));
        }

        Ok(Manifest {
            format_version,
            model: get("model")?,
            dimension: parse("dimension")?,
            count: parse("count")?,
        })
    }

    /// Read every entry ordered by id.
    pub fn entries(&self) -> Result<Vec<StoredEntry>> {
        let txn = self.db.begin_read()?;
        let vectors = txn.open_table(VECTORS)?;
        let chunks = txn.open_table(CHUNKS)?;

        let mut result = Vec::new();
        for entry in vectors.iter()? {
            let (k, v) = entry?;
            let id = k.value();
            let vector = decode_vector(v.value()).ok_or_else(|| {
                Error::Storage(format!("vector {id} is truncated"))
            })?;
            let chunk_bytes = chunks.get(id)?.ok_or_else(|| {
                Error::Storage(format!("vector {id} has no chunk metadata"))
            })?;
            let chunk: Chunk = serde_json::from_slice(chunk_bytes.value())
                .map_err(|e| {
                    Error::Storage(format!("chunk {id} is corrupt: {e}"))
                })?;
            result.push(StoredEntry { id, vector, chunk });
        }

        if chunks.len()? != result.len() as u64 {
            return Err(Error::Storage(
                "index has chunk metadata without vectors".into(),
            ));
        }

        Ok(result)
    }
}

impl std::fmt::Debug for IndexDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexDb").finish_non_exhaustive()
    }
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes =
        Vec::with_capacity(HEADER_SIZE + std::mem::size_of_val(vector));
    bytes.extend_from_slice(&(vector.len() as u32).to_le_bytes());
    bytes.extend_from_slice(bytemuck::cast_slice(vector));
    bytes
}

fn decode_vector(bytes: &[u8]) -> Option<Vec<f32>> {
    let header: [u8; HEADER_SIZE] = bytes.get(..HEADER_SIZE)?.try_into().ok()?;
    let dimension = u32::from_le_bytes(header) as usize;
    let data = &bytes[HEADER_SIZE..];
    if data.len() != dimension * 4 {
        return None;
    }

    // redb makes no alignment promise for values.
    Some(match bytemuck::try_cast_slice::<u8, f32>(data) {
        Ok(floats) => floats.to_vec(),
        Err(_) => data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    })
}
