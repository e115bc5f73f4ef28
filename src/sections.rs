//! Chapter and section heading detection.
//!
//! Course material marks its structure with headings such as `Chapter 7` or
//! `Section 3.2`. The segmenter finds every heading in normalized text and
//! splits the text into spans that run from one heading to the next.

use std::sync::LazyLock;

use regex::Regex;

/// Label used when the text contains no recognizable heading.
pub const UNTITLED_LABEL: &str = "Untitled";

static HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)chapter\s+\d+|section\s+\d+\.\d+")
        .expect("heading pattern is valid")
});

/// A labelled region of normalized text.
///
/// `start` and `end` are byte offsets; `end` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionSpan {
    /// The heading exactly as it appears in the text.
    pub label: String,
    pub start: usize,
    pub end: usize,
}

impl SectionSpan {
    /// The slice of `text` this span covers.
    pub fn slice<'a>(&self, text: &'a str) -> &'a str {
        &text[self.start..self.end]
    }
}

/// Split normalized text into heading-delimited spans.
///
/// Each span starts at a heading match and ends where the next heading
/// starts (or at the end of the text). Text before the first heading belongs
/// to no span. When no heading matches, the whole text becomes a single
/// [`UNTITLED_LABEL`] span; empty text yields no spans.
///
/// # Examples
///
/// ```
/// use coursedex::sections::segment;
///
/// let text = "Chapter 1 intro Section 1.1 details";
/// let spans = segment(text);
/// assert_eq!(spans.len(), 2);
/// assert_eq!(spans[0].label, "Chapter 1");
/// assert_eq!(spans[0].slice(text), "Chapter 1 intro ");
/// assert_eq!(spans[1].label, "Section 1.1");
/// ```
pub fn segment(text: &str) -> Vec<SectionSpan> {
    let matches: Vec<_> = HEADING.find_iter(text).collect();

    if matches.is_empty() {
        if text.trim().is_empty() {
            return Vec::new();
        }
        tracing::debug!("no section headings found, using a single span");
        return vec![SectionSpan {
            label: UNTITLED_LABEL.to_string(),
            start: 0,
            end: text.len(),
        }];
    }

    matches
        .iter()
        .enumerate()
        .map(|(i, m)| SectionSpan {
            label: m.as_str().to_string(),
            start: m.start(),
            end: matches.get(i + 1).map_or(text.len(), |next| next.start()),
        })
        .collect()
}
