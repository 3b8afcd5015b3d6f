//! Structural and semantic content cleanup.
//!
//! Layer 1 (structural) removes inline trackers, clusters of bare links,
//! and known navigation preambles; it is always safe and feeds the
//! extractor. Layer 2 (semantic) additionally drops high-link-density
//! windows and is applied only to the classifier's input, where noise
//! hurts the similarity signal but recall does not matter.

use std::sync::OnceLock;

use regex::Regex;

fn tracker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)!\[[^\]]*\]\([^)]*(?:pixel|track|beacon|analytics|utm_)[^)]*\)",
        )
        .unwrap()
    })
}

fn bare_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*\[[^\]]{0,40}\]\([^)]*\)\s*$").unwrap())
}

fn nav_preamble_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:skip to (?:main )?content|toggle navigation|menu|search)\s*$")
            .unwrap()
    })
}

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[[^\]]*\]\([^)]*\)").unwrap())
}

/// Minimum consecutive bare-link lines that count as a nav cluster.
const LINK_CLUSTER_MIN: usize = 3;

/// Layer-1 structural cleanup.
///
/// Drops tracker images, runs of three or more bare-link lines, and nav
/// preamble lines. Keeps everything else verbatim.
pub fn layer1_clean(content: &str) -> String {
    let without_trackers = tracker_re().replace_all(content, "");

    let lines: Vec<&str> = without_trackers.lines().collect();
    let mut keep = vec![true; lines.len()];

    // Mark runs of bare-link lines (blank lines do not break a run).
    let mut run_start: Option<usize> = None;
    let mut run_links = 0usize;
    for (i, line) in lines.iter().enumerate() {
        let is_link = bare_link_re().is_match(line);
        let is_blank = line.trim().is_empty();
        if is_link {
            if run_start.is_none() {
                run_start = Some(i);
            }
            run_links += 1;
        } else if !is_blank {
            if let Some(start) = run_start.take() {
                if run_links >= LINK_CLUSTER_MIN {
                    for item in keep.iter_mut().take(i).skip(start) {
                        *item = false;
                    }
                }
            }
            run_links = 0;
        }
    }
    if let Some(start) = run_start {
        if run_links >= LINK_CLUSTER_MIN {
            for item in keep.iter_mut().skip(start) {
                *item = false;
            }
        }
    }

    let mut out = String::with_capacity(without_trackers.len());
    for (i, line) in lines.iter().enumerate() {
        if !keep[i] || nav_preamble_re().is_match(line) {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    collapse_blank_runs(&out)
}

/// Window size, in lines, for Layer-2 link-density scoring.
const DENSITY_WINDOW: usize = 5;
/// Windows where links occupy more than this share of characters drop.
const DENSITY_MAX: f32 = 0.5;

/// Layer-2 semantic cleanup: Layer 1 plus link-density windowing.
///
/// Classifier input only; too aggressive for extraction.
pub fn layer2_clean(content: &str) -> String {
    let structural = layer1_clean(content);
    let lines: Vec<&str> = structural.lines().collect();
    if lines.is_empty() {
        return structural;
    }

    let mut keep = vec![true; lines.len()];
    let mut start = 0;
    while start < lines.len() {
        let end = (start + DENSITY_WINDOW).min(lines.len());
        let window = &lines[start..end];
        let total: usize = window.iter().map(|l| l.len()).sum();
        if total > 0 {
            let linked: usize = window
                .iter()
                .flat_map(|l| link_re().find_iter(l))
                .map(|m| m.len())
                .sum();
            if linked as f32 / total as f32 > DENSITY_MAX {
                for item in keep.iter_mut().take(end).skip(start) {
                    *item = false;
                }
            }
        }
        start = end;
    }

    let mut out = String::with_capacity(structural.len());
    for (i, line) in lines.iter().enumerate() {
        if keep[i] {
            out.push_str(line);
            out.push('\n');
        }
    }
    collapse_blank_runs(&out)
}

/// Collapse any run of three or more newlines to exactly two.
pub fn collapse_blank_runs(text: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\n{3,}").unwrap());
    re.replace_all(text, "\n\n").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_images_removed() {
        let content = "Hello ![](https://cdn.x.com/pixel.gif?utm_source=a) world\n";
        let cleaned = layer1_clean(content);
        assert!(cleaned.contains("Hello"));
        assert!(cleaned.contains("world"));
        assert!(!cleaned.contains("pixel"));
    }

    #[test]
    fn test_link_cluster_removed_short_list_kept() {
        let content = "\
Real paragraph here.

[Home](/)
[About](/about)
[Pricing](/pricing)
[Contact](/contact)

Another real paragraph.
";
        let cleaned = layer1_clean(content);
        assert!(cleaned.contains("Real paragraph"));
        assert!(cleaned.contains("Another real paragraph"));
        assert!(!cleaned.contains("[Home]"));

        // Two links do not make a cluster.
        let short = "text\n[a](/a)\n[b](/b)\nmore text\n";
        let cleaned = layer1_clean(short);
        assert!(cleaned.contains("[a](/a)"));
    }

    #[test]
    fn test_nav_preamble_removed() {
        let cleaned = layer1_clean("Skip to main content\nActual body text\n");
        assert!(!cleaned.to_lowercase().contains("skip to"));
        assert!(cleaned.contains("Actual body text"));
    }

    #[test]
    fn test_layer2_drops_link_dense_window() {
        // One full window of prose, one full window of inline links
        // (which survive layer 1 because they are not bare-link lines),
        // then prose again.
        let mut content = String::new();
        for i in 0..5 {
            content.push_str(&format!(
                "Ordinary prose sentence number {i} with no links whatsoever in it.\n"
            ));
        }
        for i in 0..5 {
            content.push_str(&format!("see [link {i}](https://example.com/{i}) here\n"));
        }
        content.push_str("Closing prose paragraph with plenty of plain words in it.\n");

        let l1 = layer1_clean(&content);
        assert!(l1.contains("[link 0]"));

        let l2 = layer2_clean(&content);
        assert!(l2.contains("Ordinary prose sentence number 0"));
        assert!(!l2.contains("[link 0]"));
        assert!(l2.contains("Closing prose"));
    }

    #[test]
    fn test_collapse_blank_runs() {
        assert_eq!(collapse_blank_runs("a\n\n\n\nb"), "a\n\nb");
        assert_eq!(collapse_blank_runs("a\n\nb"), "a\n\nb");
    }
}
