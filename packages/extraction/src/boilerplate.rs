//! Cross-page boilerplate detection and stripping.
//!
//! Pages of one `(project, domain)` share navigation, cookie banners and
//! footers. The engine fingerprints blocks that recur on enough pages and
//! subtracts them, feeding cleaner content to classification and
//! extraction. Blocks are only ever removed whole, never rewritten, so
//! the cleaned content is always a subsequence of the original.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::cleanup::collapse_blank_runs;
use crate::types::boilerplate::{BoilerplateParams, BoilerplateStats, DomainBoilerplate};

fn block_separator_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n\s*\n").unwrap())
}

/// Truncated SHA-256 of a whitespace-collapsed, lowercased block.
///
/// 64 bits is plenty at per-domain scope.
pub fn block_hash(block: &str) -> String {
    let normalized = block
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let digest = Sha256::digest(normalized.trim().as_bytes());
    hex::encode(&digest[..])[..16].to_string()
}

/// Maximal non-blank-separated blocks of a document.
fn split_blocks(content: &str) -> Vec<&str> {
    block_separator_re()
        .split(content)
        .filter(|b| !b.trim().is_empty())
        .collect()
}

/// Result of stripping one document.
#[derive(Debug, Clone)]
pub struct StripResult {
    pub cleaned_content: String,
    pub bytes_removed: usize,
    pub blocks_removed: usize,
}

/// Fingerprints and strips boilerplate for one `(project, domain)`.
#[derive(Debug, Clone)]
pub struct BoilerplateEngine {
    params: BoilerplateParams,
}

impl Default for BoilerplateEngine {
    fn default() -> Self {
        Self::new(BoilerplateParams::default())
    }
}

impl BoilerplateEngine {
    pub fn new(params: BoilerplateParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &BoilerplateParams {
        &self.params
    }

    /// Fingerprint the domain from all of its page contents.
    ///
    /// Pure over its inputs: the same pages always produce the same
    /// hashes. Refuses (empty fingerprint) below `min_pages`.
    pub fn analyze(
        &self,
        project_id: Uuid,
        domain: &str,
        pages: &[&str],
    ) -> DomainBoilerplate {
        let mut fingerprint = DomainBoilerplate::new(project_id, domain);
        fingerprint.params = self.params;
        fingerprint.stats.pages_analyzed = pages.len();

        if pages.len() < self.params.min_pages {
            tracing::debug!(
                domain,
                pages = pages.len(),
                min_pages = self.params.min_pages,
                "too few pages to fingerprint domain"
            );
            return fingerprint;
        }

        let threshold = self.page_threshold(pages.len());
        let mut page_counts: HashMap<String, usize> = HashMap::new();
        let mut blocks_total = 0usize;

        for page in pages {
            // Dedup within the page first so a block repeated on one page
            // counts once toward the cross-page threshold.
            let mut seen: HashSet<String> = HashSet::new();
            for block in split_blocks(page) {
                if block.len() < self.params.min_block_chars {
                    continue;
                }
                blocks_total += 1;
                let hash = block_hash(block);
                if seen.insert(hash.clone()) {
                    *page_counts.entry(hash).or_insert(0) += 1;
                }
            }
        }

        let mut hashes: Vec<String> = page_counts
            .into_iter()
            .filter(|(_, count)| *count >= threshold)
            .map(|(hash, _)| hash)
            .collect();
        hashes.sort();

        fingerprint.stats.blocks_total = blocks_total;
        fingerprint.stats.blocks_boilerplate = hashes.len();
        fingerprint.hashes = hashes;
        if !fingerprint.hashes.is_empty() {
            let removed_total: usize = pages
                .iter()
                .map(|page| self.strip(page, &fingerprint).bytes_removed)
                .sum();
            fingerprint.stats.bytes_removed_avg = removed_total / pages.len();
        }
        fingerprint.updated_at = Utc::now();

        tracing::info!(
            domain,
            pages = pages.len(),
            threshold,
            boilerplate_blocks = fingerprint.hashes.len(),
            "domain fingerprint computed"
        );
        fingerprint
    }

    /// Pages a block must appear on to be boilerplate.
    pub fn page_threshold(&self, pages: usize) -> usize {
        let pct = (pages as f32 * self.params.threshold_pct).floor() as usize;
        pct.max(self.params.min_pages)
    }

    /// Remove fingerprinted blocks from one document.
    ///
    /// Separators are preserved around surviving blocks; runs of three or
    /// more newlines collapse to a blank line afterwards.
    pub fn strip(&self, content: &str, fingerprint: &DomainBoilerplate) -> StripResult {
        if fingerprint.hashes.is_empty() {
            return StripResult {
                cleaned_content: content.to_string(),
                bytes_removed: 0,
                blocks_removed: 0,
            };
        }
        let hashes: HashSet<&str> = fingerprint.hashes.iter().map(String::as_str).collect();

        let mut cleaned = String::with_capacity(content.len());
        let mut bytes_removed = 0usize;
        let mut blocks_removed = 0usize;
        let mut cursor = 0usize;

        for separator in block_separator_re().find_iter(content) {
            let block = &content[cursor..separator.start()];
            if self.keep_block(block, &hashes) {
                cleaned.push_str(block);
                cleaned.push_str(separator.as_str());
            } else {
                bytes_removed += block.len();
                blocks_removed += 1;
            }
            cursor = separator.end();
        }
        let tail = &content[cursor..];
        if self.keep_block(tail, &hashes) {
            cleaned.push_str(tail);
        } else {
            bytes_removed += tail.len();
            blocks_removed += 1;
        }

        StripResult {
            cleaned_content: collapse_blank_runs(&cleaned),
            bytes_removed,
            blocks_removed,
        }
    }

    fn keep_block(&self, block: &str, hashes: &HashSet<&str>) -> bool {
        if block.len() < self.params.min_block_chars {
            return true;
        }
        !hashes.contains(block_hash(block).as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> BoilerplateEngine {
        BoilerplateEngine::new(BoilerplateParams {
            threshold_pct: 0.7,
            min_pages: 5,
            min_block_chars: 50,
        })
    }

    fn banner() -> String {
        "We use cookies to improve your experience. ".repeat(100)
    }

    fn page_with_banner(i: usize, banner: &str) -> String {
        format!(
            "# Page {i}\n\nUnique content for page number {i}, long enough to count as a real block of text for the engine.\n\n{banner}\n\nFooter-free unique trailer {i} that also has enough characters to be a block on its own."
        )
    }

    #[test]
    fn test_refuses_below_min_pages() {
        let e = engine();
        let b = banner();
        let pages: Vec<String> = (0..4).map(|i| page_with_banner(i, &b)).collect();
        let refs: Vec<&str> = pages.iter().map(String::as_str).collect();
        let fp = e.analyze(Uuid::new_v4(), "example.com", &refs);
        assert!(fp.hashes.is_empty());
        assert_eq!(fp.stats.pages_analyzed, 4);

        // And stripping with an empty fingerprint changes nothing.
        let result = e.strip(&pages[0], &fp);
        assert_eq!(result.cleaned_content, pages[0]);
        assert_eq!(result.bytes_removed, 0);
    }

    #[test]
    fn test_cookie_banner_scenario() {
        // 10 pages, 8 share the banner; threshold = max(5, floor(10*0.7)) = 7.
        let e = engine();
        let b = banner();
        let mut pages: Vec<String> = (0..8).map(|i| page_with_banner(i, &b)).collect();
        pages.push("# Page 8\n\nEntirely unique body with no shared banner, padded out to block length for the analyzer.".into());
        pages.push("# Page 9\n\nAnother unique body with no shared banner, also padded out to block length for the analyzer.".into());

        let refs: Vec<&str> = pages.iter().map(String::as_str).collect();
        let fp = e.analyze(Uuid::new_v4(), "example.com", &refs);
        assert_eq!(fp.stats.blocks_boilerplate, 1);
        assert_eq!(fp.hashes.len(), 1);
        // 8 of 10 pages lose one banner-sized block each.
        assert_eq!(fp.stats.bytes_removed_avg, b.len() * 8 / 10);

        let result = e.strip(&pages[0], &fp);
        assert!(!result.cleaned_content.contains("We use cookies"));
        assert!(result.cleaned_content.contains("Unique content for page number 0"));
        assert!(result.cleaned_content.len() <= pages[0].len());
        assert_eq!(result.blocks_removed, 1);
        assert_eq!(result.bytes_removed, b.len());
    }

    #[test]
    fn test_analyze_is_pure() {
        let e = engine();
        let b = banner();
        let pages: Vec<String> = (0..6).map(|i| page_with_banner(i, &b)).collect();
        let refs: Vec<&str> = pages.iter().map(String::as_str).collect();
        let project = Uuid::new_v4();
        let a = e.analyze(project, "example.com", &refs);
        let b2 = e.analyze(project, "example.com", &refs);
        assert_eq!(a.hashes, b2.hashes);
    }

    #[test]
    fn test_short_blocks_ignored() {
        let e = engine();
        // "Menu" repeats everywhere but is under min_block_chars.
        let pages: Vec<String> = (0..6)
            .map(|i| format!("Menu\n\nReal body content number {i} long enough to count as an analyzable block of text."))
            .collect();
        let refs: Vec<&str> = pages.iter().map(String::as_str).collect();
        let fp = e.analyze(Uuid::new_v4(), "example.com", &refs);
        assert!(fp.hashes.is_empty());
    }

    #[test]
    fn test_per_page_dedup_before_counting() {
        // Five banner occurrences spread over only three distinct pages;
        // with threshold 5 the block stays out. Counting occurrences
        // instead of pages would wrongly cross the bar.
        let e = engine();
        let b = banner();
        let mut pages: Vec<String> = vec![
            format!("{b}\n\n{b}\n\n{b}\n\nUnique page zero content long enough to be treated as a block by the analyzer."),
            page_with_banner(1, &b),
            page_with_banner(2, &b),
        ];
        for i in 3..6 {
            pages.push(format!(
                "# Page {i}\n\nBanner-free body number {i}, padded out to block length for the analyzer."
            ));
        }
        let refs: Vec<&str> = pages.iter().map(String::as_str).collect();
        let fp = e.analyze(Uuid::new_v4(), "example.com", &refs);
        // threshold = max(5, floor(6 * 0.7)) = 5 > 3 distinct pages.
        assert!(fp.hashes.is_empty());
    }

    #[test]
    fn test_strip_collapses_leftover_gaps() {
        let e = engine();
        let b = banner();
        let pages: Vec<String> = (0..6).map(|i| page_with_banner(i, &b)).collect();
        let refs: Vec<&str> = pages.iter().map(String::as_str).collect();
        let fp = e.analyze(Uuid::new_v4(), "example.com", &refs);

        let result = e.strip(&pages[0], &fp);
        assert!(!result.cleaned_content.contains("\n\n\n"));
    }

    #[test]
    fn test_block_hash_normalizes_whitespace_and_case() {
        assert_eq!(
            block_hash("Accept  COOKIES now"),
            block_hash("accept cookies\nnow")
        );
        assert_eq!(block_hash("x").len(), 16);
    }
}
