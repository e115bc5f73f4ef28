//! Chunking utilities for splitting course text into overlapping word windows.
//!
//! Each section span is windowed independently, so a chunk never mixes text
//! from two sections. Every chunk carries the label of the section it came
//! from; the order of the returned list (section order, then window order) is
//! the only place section continuity survives, so callers must preserve it.

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    normalize::normalize_whitespace,
    sections::segment,
};

/// Default window size in words.
pub const DEFAULT_WINDOW: usize = 80;

/// Default overlap between adjacent windows in words.
pub const DEFAULT_OVERLAP: usize = 20;

/// Word-window settings.
///
/// # Examples
///
/// ```
/// use coursedex::chunking::ChunkingConfig;
///
/// let config = ChunkingConfig::default();
/// assert_eq!(config.step().unwrap(), 60);
///
/// let broken = ChunkingConfig { window: 80, overlap: 80 };
/// assert!(broken.step().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    /// Maximum number of words per chunk.
    pub window: usize,
    /// Number of words shared by adjacent chunks of the same section.
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            overlap: DEFAULT_OVERLAP,
        }
    }
}

impl ChunkingConfig {
    /// Distance in words between the starts of adjacent windows.
    ///
    /// Fails when the window is empty or the overlap is not smaller than the
    /// window, since the windows would never advance.
    pub fn step(&self) -> Result<usize> {
        if self.window == 0 {
            return Err(Error::Config(
                "chunk window must be at least 1 word".into(),
            ));
        }
        if self.overlap >= self.window {
            return Err(Error::Config(format!(
                "chunk overlap ({}) must be smaller than the window ({})",
                self.overlap, self.window
            )));
        }
        Ok(self.window - self.overlap)
    }
}

/// A window of course text tagged with its section heading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Label of the section this chunk was cut from.
    pub section: String,
    /// Words of the window joined by single spaces.
    pub text: String,
}

impl Chunk {
    pub fn new(section: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            section: section.into(),
            text: text.into(),
        }
    }
}

/// Split one section's text into overlapping word windows.
///
/// The final window may be shorter than `config.window`. Returns an empty
/// list for text without words.
///
/// # Examples
///
/// ```
/// use coursedex::chunking::{chunk_span, ChunkingConfig};
///
/// let config = ChunkingConfig { window: 3, overlap: 1 };
/// let chunks = chunk_span("Chapter 1", "a b c d e", &config).unwrap();
/// let texts: Vec<_> = chunks.iter().map(|c| c.text.as_str()).collect();
/// assert_eq!(texts, ["a b c", "c d e", "e"]);
/// ```
pub fn chunk_span(
    label: &str,
    text: &str,
    config: &ChunkingConfig,
) -> Result<Vec<Chunk>> {
    let step = config.step()?;
    let words: Vec<&str> = text.split_whitespace().collect();

    let mut chunks = Vec::with_capacity(words.len().div_ceil(step));
    for start in (0..words.len()).step_by(step) {
        let end = (start + config.window).min(words.len());
        let joined = words[start..end].join(" ");
        let joined = joined.trim();
        if !joined.is_empty() {
            chunks.push(Chunk::new(label, joined));
        }
    }

    Ok(chunks)
}

/// Chunks of a whole document and the number of section spans they came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDocument {
    pub sections: usize,
    pub chunks: Vec<Chunk>,
}

/// Normalize, segment and window a whole document.
///
/// Fails with [`Error::EmptyInput`] when the document yields no chunks and
/// with [`Error::Config`] when the window settings cannot advance.
pub fn chunk_document(
    raw: &str,
    config: &ChunkingConfig,
) -> Result<ChunkedDocument> {
    config.step()?;

    let normalized = normalize_whitespace(raw);
    if normalized.is_empty() {
        return Err(Error::EmptyInput(
            "document contains no text after normalization".into(),
        ));
    }

    let spans = segment(&normalized);
    tracing::info!(sections = spans.len(), "segmented document");

    let mut chunks = Vec::new();
    for span in &spans {
        let section_chunks =
            chunk_span(&span.label, span.slice(&normalized), config)?;
        tracing::debug!(
            section = %span.label,
            chunks = section_chunks.len(),
            "chunked section"
        );
        chunks.extend(section_chunks);
    }

    if chunks.is_empty() {
        return Err(Error::EmptyInput(
            "document produced no chunks".into(),
        ));
    }

    tracing::info!(chunks = chunks.len(), "chunked document");
    Ok(ChunkedDocument {
        sections: spans.len(),
        chunks,
    })
}
