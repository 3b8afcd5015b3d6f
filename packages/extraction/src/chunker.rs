//! Header-aware markdown chunker.
//!
//! Splits a document on second-level headings, packs sections greedily
//! into budget-bounded chunks, and carries a heading breadcrumb for each
//! chunk. Sections that alone exceed the budget fall back to paragraph
//! and finally word splitting, so a chunk never silently drops content.

use serde::{Deserialize, Serialize};

use crate::config::ChunkerConfig;

/// One chunk of a document, with its position and heading context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub content: String,
    pub chunk_index: usize,
    pub total_chunks: usize,

    /// Breadcrumb of enclosing #/##/### headings at the chunk start.
    pub header_path: Vec<String>,
}

/// Split `document` into chunks within the configured budget.
///
/// Concatenating the chunk contents reproduces the document modulo the
/// whitespace consumed at split boundaries.
pub fn chunk_markdown(document: &str, config: &ChunkerConfig) -> Vec<DocumentChunk> {
    let budget = config.max_chars().max(1);
    let sections = split_sections(document);

    // Greedy packing: sections accumulate until the next would overflow.
    let mut pieces: Vec<(String, Vec<String>)> = Vec::new();
    let mut current = String::new();
    let mut current_path: Vec<String> = Vec::new();

    for section in &sections {
        if section.text.len() > budget {
            // Flush whatever was packed, then split the big section alone.
            if !current.is_empty() {
                pieces.push((std::mem::take(&mut current), current_path.clone()));
            }
            for part in split_oversized(&section.text, budget) {
                pieces.push((part, section.header_path.clone()));
            }
            current_path = section.header_path.clone();
            continue;
        }

        // Sections keep their trailing newlines, so no separator is
        // inserted and concatenation stays exact.
        if !current.is_empty() && current.len() + section.text.len() > budget {
            pieces.push((std::mem::take(&mut current), current_path.clone()));
        }
        if current.is_empty() {
            current_path = section.header_path.clone();
        }
        current.push_str(&section.text);
    }
    if !current.is_empty() {
        pieces.push((current, current_path));
    }

    if pieces.is_empty() {
        pieces.push((String::new(), vec![]));
    }

    let total = pieces.len();
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, (content, header_path))| DocumentChunk {
            content,
            chunk_index: i,
            total_chunks: total,
            header_path,
        })
        .collect()
}

struct Section {
    text: String,
    header_path: Vec<String>,
}

/// Split on `##` headings, keeping each heading with its section and
/// tracking the #/##/### breadcrumb at each section start.
fn split_sections(document: &str) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();
    let mut current = String::new();
    let mut h1: Option<String> = None;
    let mut h2: Option<String> = None;
    let mut h3: Option<String> = None;
    // Breadcrumb captured when the current section began.
    let mut current_path: Vec<String> = Vec::new();

    let mut first_line_of_section = true;
    for line in document.split_inclusive('\n') {
        let trimmed = line.trim_end();
        if let Some(title) = heading_title(trimmed, 2) {
            // A new `##` opens a section.
            if !current.is_empty() {
                sections.push(Section {
                    text: std::mem::take(&mut current),
                    header_path: current_path.clone(),
                });
            }
            h2 = Some(title);
            h3 = None;
            current_path = breadcrumb(&h1, &h2, &h3);
            current.push_str(line);
            first_line_of_section = false;
            continue;
        }

        if let Some(title) = heading_title(trimmed, 1) {
            h1 = Some(title);
            h2 = None;
            h3 = None;
        } else if let Some(title) = heading_title(trimmed, 3) {
            h3 = Some(title);
        }

        if first_line_of_section {
            current_path = breadcrumb(&h1, &h2, &h3);
            first_line_of_section = false;
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        sections.push(Section {
            text: current,
            header_path: current_path,
        });
    }
    sections
}

fn breadcrumb(h1: &Option<String>, h2: &Option<String>, h3: &Option<String>) -> Vec<String> {
    [h1, h2, h3].into_iter().flatten().cloned().collect()
}

/// `## Title` → `Title` when the line is a heading of exactly `level`.
fn heading_title(line: &str, level: usize) -> Option<String> {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    if hashes != level {
        return None;
    }
    let rest = &line[hashes..];
    if !rest.starts_with(' ') {
        return None;
    }
    Some(rest.trim().to_string())
}

/// Paragraph split, then word split for paragraphs still over budget.
fn split_oversized(text: &str, budget: usize) -> Vec<String> {
    let mut parts: Vec<String> = Vec::new();
    let mut current = String::new();

    for paragraph in text.split_inclusive("\n\n") {
        if paragraph.len() > budget {
            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
            parts.extend(split_words(paragraph, budget));
            continue;
        }
        if !current.is_empty() && current.len() + paragraph.len() > budget {
            parts.push(std::mem::take(&mut current));
        }
        current.push_str(paragraph);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

fn split_words(text: &str, budget: usize) -> Vec<String> {
    let mut parts: Vec<String> = Vec::new();
    let mut current = String::new();
    for word in text.split_inclusive(char::is_whitespace) {
        if !current.is_empty() && current.len() + word.len() > budget {
            parts.push(std::mem::take(&mut current));
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize_ws(s: &str) -> String {
        s.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn test_no_second_level_headers_single_chunk() {
        let doc = "# Title\n\nSome intro text.\n\nMore text without sections.\n";
        let chunks = chunk_markdown(doc, &ChunkerConfig::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].total_chunks, 1);
        assert_eq!(chunks[0].content, doc);
    }

    #[test]
    fn test_heading_kept_with_section() {
        let doc = "intro\n## Pricing\nplans here\n## Features\nsso and more\n";
        // Budget fits two sections per chunk but not all three.
        let config = ChunkerConfig::default().with_max_tokens(7);
        let chunks = chunk_markdown(doc, &config);
        assert!(chunks.len() >= 2);
        let pricing = chunks
            .iter()
            .find(|c| c.content.contains("## Pricing"))
            .unwrap();
        assert!(pricing.content.contains("plans here"));
    }

    #[test]
    fn test_header_path_breadcrumbs() {
        let doc = "# Acme\n## Pricing\n### Tiers\ntext\n## Features\ntext\n";
        let config = ChunkerConfig::default().with_max_tokens(5);
        let chunks = chunk_markdown(doc, &config);

        let features = chunks
            .iter()
            .find(|c| c.content.contains("## Features"))
            .unwrap();
        assert_eq!(features.header_path, vec!["Acme", "Features"]);
    }

    #[test]
    fn test_oversized_section_concatenation_property() {
        // One giant section, far over budget, no paragraph breaks.
        let big = "word ".repeat(20_000);
        let doc = format!("## Big\n{}", big);
        let config = ChunkerConfig::default(); // 32k chars
        let chunks = chunk_markdown(&doc, &config);
        assert!(chunks.len() > 1);

        let rejoined: String = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(normalize_ws(&rejoined), normalize_ws(&doc));
        for chunk in &chunks {
            assert!(chunk.content.len() <= config.max_chars() + 1);
        }
    }

    #[test]
    fn test_greedy_packing_respects_budget() {
        let doc = (0..10)
            .map(|i| format!("## S{}\n{}\n", i, "x".repeat(100)))
            .collect::<String>();
        let config = ChunkerConfig::default().with_max_tokens(60); // 240 chars
        let chunks = chunk_markdown(&doc, &config);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.content.len() <= 241, "len {}", chunk.content.len());
        }
        let rejoined: String = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(rejoined, doc);
    }

    #[test]
    fn test_empty_document() {
        let chunks = chunk_markdown("", &ChunkerConfig::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "");
    }

    #[test]
    fn test_total_chunks_consistent() {
        let doc = "## A\nx\n## B\ny\n";
        let config = ChunkerConfig::default().with_max_tokens(2);
        let chunks = chunk_markdown(doc, &config);
        for chunk in &chunks {
            assert_eq!(chunk.total_chunks, chunks.len());
        }
        let indexes: Vec<_> = chunks.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indexes, (0..chunks.len()).collect::<Vec<_>>());
    }

    proptest::proptest! {
        // Chunking never loses or rewrites a byte, whatever the input
        // shape or budget pressure.
        #[test]
        fn prop_concatenation_is_exact(doc in "([ -~]|\n){0,800}") {
            let config = ChunkerConfig::default().with_max_tokens(20);
            let chunks = chunk_markdown(&doc, &config);
            let rejoined: String = chunks.iter().map(|c| c.content.as_str()).collect();
            proptest::prop_assert_eq!(rejoined, doc);
        }
    }
}
