//! Whitespace normalization for OCR output.

/// Collapse every run of whitespace (spaces, tabs, newlines, any Unicode
/// whitespace) into a single ASCII space and trim both ends.
///
/// All non-whitespace characters are kept as-is.
///
/// # Examples
///
/// ```
/// use coursedex::normalize::normalize_whitespace;
///
/// assert_eq!(
///     normalize_whitespace("  Chapter 7\n\n Recommender\tsystems  "),
///     "Chapter 7 Recommender systems"
/// );
/// ```
pub fn normalize_whitespace(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for word in raw.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}
