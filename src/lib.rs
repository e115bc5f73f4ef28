//! coursedex - a retrieval-augmented tutor for a course module.
//!
//! coursedex turns the OCR text dump of a course's study material into a
//! searchable index: the text is normalized, split at chapter and section
//! headings, cut into overlapping word windows, and every window is embedded
//! into a flat vector index persisted in [redb](https://www.redb.org/). On
//! top of that index a tutor answers questions from the retrieved chunks.
//!
//! # Quick start
//!
//! ```
//! # let tmp = tempfile::tempdir().unwrap();
//! use std::sync::Arc;
//!
//! use coursedex::{
//!     DataDir, Pipeline, Retriever, VectorIndex,
//!     chunking::ChunkingConfig,
//!     embedding::{EmbedOptions, HashEmbedder, RetryPolicy},
//! };
//!
//! let source = tmp.path().join("module.txt");
//! std::fs::write(
//!     &source,
//!     "Chapter 7 Recommender systems suggest items. \
//!      Chapter 8 Vision models read images.",
//! )
//! .unwrap();
//!
//! let data_dir =
//!     DataDir::resolve(Some(&tmp.path().join("data")), None).unwrap();
//! let embedder = HashEmbedder::new(64);
//! Pipeline::new(&data_dir, ChunkingConfig::default())
//!     .build(&source, &embedder, &EmbedOptions::default())
//!     .unwrap();
//!
//! let index = VectorIndex::load(&data_dir.index_dir()).unwrap();
//! let retriever = Retriever::new(
//!     Arc::new(index),
//!     Arc::new(embedder),
//!     RetryPolicy::none(),
//! )
//! .unwrap();
//! let results = retriever.similarity("vision models read images", 1).unwrap();
//! assert_eq!(results[0].chunk.section, "Chapter 8");
//! ```

pub mod chat;
pub mod chunk_store;
pub mod chunking;
pub mod cli;
pub mod config;
pub mod config_db;
pub mod data_dir;
pub mod embedding;
pub mod error;
pub mod index_db;
pub mod indexer;
pub mod llm;
pub mod mcp;
pub mod model_manager;
pub mod normalize;
pub mod openai;
pub mod pipeline;
pub mod retrieval;
pub mod search;
pub mod sections;
pub mod session_store;
pub mod text_util;
pub mod vector_index;

pub use chat::{Answer, Tutor};
pub use config::Config;
pub use config_db::ConfigDb;
pub use data_dir::DataDir;
pub use error::{Error, Result};
pub use model_manager::LocalEmbedder;
pub use pipeline::Pipeline;
pub use retrieval::Retriever;
pub use vector_index::VectorIndex;
