/// Maximum number of characters in a snippet before truncation.
pub const DEFAULT_SNIPPET_MAX_CHARS: usize = 240;

/// Cut `text` to at most `max_chars` characters, marking the cut with `...`.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}...", text[..byte_idx].trim_end()),
        None => text.to_string(),
    }
}

/// Extract a snippet of `text` around the first word matching a word of
/// `query`.
///
/// Chunk text is a single line of words, so the snippet is a word window
/// rather than a line range. Falls back to the start of the text when no
/// query word occurs. Returns `None` if the text is empty.
pub fn extract_snippet(
    text: &str,
    query: &str,
    max_chars: usize,
) -> Option<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return None;
    }

    let query_words: Vec<String> = query
        .split_whitespace()
        .map(normalize_word)
        .filter(|w| w.chars().count() > 2)
        .collect();
    let match_idx = words
        .iter()
        .position(|w| query_words.contains(&normalize_word(w)));

    let start = match match_idx {
        Some(idx) => idx.saturating_sub(8),
        None => 0,
    };
    let mut snippet = words[start..].join(" ");
    snippet = truncate_chars(&snippet, max_chars);
    if start > 0 {
        snippet.insert_str(0, "...");
    }
    Some(snippet)
}

fn normalize_word(word: &str) -> String {
    word.trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_short_text_is_unchanged() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 5), "hello");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("ααααα", 2), "αα...");
    }

    #[test]
    fn extract_snippet_centers_on_match() {
        let text = (0..40)
            .map(|i| {
                if i == 30 {
                    "Fairness".to_string()
                } else {
                    format!("w{i}")
                }
            })
            .collect::<Vec<_>>()
            .join(" ");
        let snippet = extract_snippet(&text, "what is fairness?", 400).unwrap();
        assert!(snippet.starts_with("...w22"));
        assert!(snippet.contains("Fairness"));
    }

    #[test]
    fn extract_snippet_no_match_returns_head() {
        let snippet =
            extract_snippet("alpha beta gamma", "zzz_nomatch", 400).unwrap();
        assert_eq!(snippet, "alpha beta gamma");
    }

    #[test]
    fn extract_snippet_empty_text() {
        assert!(extract_snippet("   ", "query", 100).is_none());
    }

    #[test]
    fn extract_snippet_truncates_long() {
        let text = "word ".repeat(200);
        let snippet = extract_snippet(&text, "word", 50).unwrap();
        assert!(snippet.chars().count() <= 53);
        assert!(snippet.ends_with("..."));
    }
}
