//! Terminal and JSON rendering for search results and answers.

use std::fmt::Write as _;

use serde::Serialize;

use crate::{
    chat::Answer,
    retrieval::Retrieved,
    text_util::{DEFAULT_SNIPPET_MAX_CHARS, extract_snippet, truncate_chars},
};

#[derive(Serialize)]
struct SearchOutput<'a> {
    query: &'a str,
    result_count: usize,
    results: Vec<RankedResult<'a>>,
}

#[derive(Serialize)]
struct RankedResult<'a> {
    rank: usize,
    #[serde(flatten)]
    result: &'a Retrieved,
}

/// Format results for human-readable terminal output.
pub fn format_human(results: &[Retrieved], query: &str) -> String {
    if results.is_empty() {
        return "No results found.\n".to_string();
    }

    let mut out = String::new();
    for (i, r) in results.iter().enumerate() {
        let _ = writeln!(
            out,
            "{:>3}. [{:.3}] {} #{}",
            i + 1,
            r.distance,
            r.chunk.section,
            r.id
        );
        if let Some(snippet) =
            extract_snippet(&r.chunk.text, query, DEFAULT_SNIPPET_MAX_CHARS)
        {
            let _ = writeln!(out, "     {snippet}");
        }
    }
    let _ = writeln!(out, "\n{} result(s)", results.len());
    out
}

/// Format results as a JSON document.
pub fn format_json(
    results: &[Retrieved],
    query: &str,
) -> serde_json::Result<String> {
    serde_json::to_string(&SearchOutput {
        query,
        result_count: results.len(),
        results: results
            .iter()
            .enumerate()
            .map(|(i, result)| RankedResult { rank: i + 1, result })
            .collect(),
    })
}

/// Format an answer followed by the sections it drew on.
pub fn format_answer(answer: &Answer) -> String {
    let mut out = format!("{}\n", answer.text.trim_end());
    if !answer.sources.is_empty() {
        out.push_str("\nSources:\n");
        for source in &answer.sources {
            let _ = writeln!(
                out,
                "  - {} #{}: {}",
                source.chunk.section,
                source.id,
                truncate_chars(&source.chunk.text, 60)
            );
        }
    }
    out
}
