//! Post-conversion cleanup pipeline for extracted page text.
//!
//! Each cleanup pass is a function `&str -> String` applied in sequence.
//! The output is plain Markdown-ish text meant for prompts and chunking.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

/// Run the full cleanup pipeline on converted Markdown text.
pub(crate) fn run_pipeline(md: &str, base_url: Option<&Url>) -> String {
    let mut result = drop_images(md);

    result = strip_leftover_html(&result);
    result = resolve_links(&result, base_url);
    result = normalize_whitespace(&result);
    result = collapse_blank_lines(&result);

    result.trim().to_string()
}

// ---------------------------------------------------------------------------
// Pass 1: Drop images
// ---------------------------------------------------------------------------

/// Remove Markdown images; their alt text is rarely useful content.
fn drop_images(md: &str) -> String {
    static IMAGE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").expect("valid regex"));

    IMAGE_RE.replace_all(md, "").to_string()
}

// ---------------------------------------------------------------------------
// Pass 2: Strip leftover HTML tags
// ---------------------------------------------------------------------------

/// Remove stray HTML tags that survived the conversion, keeping their text.
/// Code blocks are left untouched.
fn strip_leftover_html(md: &str) -> String {
    static HTML_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"</?[a-zA-Z][a-zA-Z0-9-]*(?:\s[^<>]*)?/?>").expect("valid regex")
    });

    let mut lines = Vec::new();
    let mut in_code_block = false;

    for line in md.lines() {
        if line.trim_start().starts_with("```") {
            in_code_block = !in_code_block;
            lines.push(line.to_string());
            continue;
        }

        if in_code_block {
            lines.push(line.to_string());
        } else {
            lines.push(HTML_TAG_RE.replace_all(line, "").to_string());
        }
    }

    lines.join("\n")
}

// ---------------------------------------------------------------------------
// Pass 3: Resolve relative links
// ---------------------------------------------------------------------------

/// Resolve relative URLs in Markdown links against the page URL so the text
/// stays meaningful once detached from the page.
fn resolve_links(md: &str, base_url: Option<&Url>) -> String {
    let Some(base) = base_url else {
        return md.to_string();
    };

    static LINK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\[([^\]]*)\]\(([^)\s]+)\)").expect("valid regex"));

    LINK_RE
        .replace_all(md, |caps: &regex::Captures| {
            let text = &caps[1];
            let href = &caps[2];

            if href.starts_with("http://")
                || href.starts_with("https://")
                || href.starts_with('#')
                || href.starts_with("mailto:")
                || href.starts_with("tel:")
            {
                return format!("[{text}]({href})");
            }

            match base.join(href) {
                Ok(resolved) => format!("[{text}]({resolved})"),
                Err(_) => format!("[{text}]({href})"),
            }
        })
        .to_string()
}

// ---------------------------------------------------------------------------
// Pass 4: Normalize whitespace
// ---------------------------------------------------------------------------

/// Trim trailing whitespace and turn whitespace-only lines into empty lines.
fn normalize_whitespace(md: &str) -> String {
    md.lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Pass 5: Collapse blank lines
// ---------------------------------------------------------------------------

/// Collapse runs of blank lines into a single blank line.
fn collapse_blank_lines(md: &str) -> String {
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

    MULTI_BLANK_RE.replace_all(md, "\n\n").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_images_removes_markdown_images() {
        let input = "Intro ![logo](/img/logo.png) text";
        assert_eq!(drop_images(input), "Intro  text");
    }

    #[test]
    fn strip_leftover_html_removes_tags_keeps_text() {
        let input = "<div class=\"avis\">Termini: <span>30 dies</span></div>";
        assert_eq!(strip_leftover_html(input), "Termini: 30 dies");
    }

    #[test]
    fn strip_leftover_html_preserves_code_blocks() {
        let input = "Text\n\n```html\n<div>Preserved</div>\n```\n\nMore";
        let result = strip_leftover_html(input);
        assert!(result.contains("<div>Preserved</div>"));
    }

    #[test]
    fn strip_leftover_html_keeps_comparisons() {
        let input = "edat < 18 i ingressos > 0";
        assert_eq!(strip_leftover_html(input), input);
    }

    #[test]
    fn resolve_links_relative_resolved() {
        let base = Url::parse("https://web.gencat.cat/ca/tramits/").unwrap();
        let result = resolve_links("[Sol·licitud](/ca/tramits/beca)", Some(&base));
        assert_eq!(result, "[Sol·licitud](https://web.gencat.cat/ca/tramits/beca)");
    }

    #[test]
    fn resolve_links_absolute_and_anchor_untouched() {
        let base = Url::parse("https://web.gencat.cat/ca/").unwrap();
        assert_eq!(
            resolve_links("[A](https://other.cat/x) [B](#top)", Some(&base)),
            "[A](https://other.cat/x) [B](#top)"
        );
    }

    #[test]
    fn collapse_blank_lines_keeps_single_blank() {
        assert_eq!(collapse_blank_lines("a\n\n\n\n\nb"), "a\n\nb");
        assert_eq!(collapse_blank_lines("a\n\nb"), "a\n\nb");
    }

    #[test]
    fn full_pipeline_normalizes() {
        let input = "# Tràmit   \n\n\n\n<div>Requisits</div>\t\n\n\n![x](y.png)\n\nFi\n\n";
        let result = run_pipeline(input, None);
        assert_eq!(result, "# Tràmit\n\nRequisits\n\nFi");
    }
}
