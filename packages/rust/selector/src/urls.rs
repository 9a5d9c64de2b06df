use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use tramit_shared::SelectedSource;

/// Characters trimmed from the end of an extracted URL.
const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', ')', '}', ']', '*', '_'];

/// Pull every http(s) URL out of free text, in order of first appearance.
pub fn extract_urls(text: &str) -> Vec<String> {
    static URL_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#"https?://[^\s,)}\]"'<>`|*]+"#).expect("valid regex"));

    let mut seen = HashSet::new();
    URL_RE
        .find_iter(text)
        .map(|m| m.as_str().trim_end_matches(TRAILING_PUNCTUATION).to_string())
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

/// Drop every source whose URL is a string prefix of a longer source's URL,
/// keeping the most specific pages. Output is ordered by URL length.
pub fn remove_parent_urls(sources: Vec<SelectedSource>) -> Vec<SelectedSource> {
    let mut sorted = sources;
    sorted.sort_by(|a, b| a.url.len().cmp(&b.url.len()).then_with(|| a.url.cmp(&b.url)));

    let keep: Vec<bool> = (0..sorted.len())
        .map(|i| {
            !sorted[i + 1..]
                .iter()
                .any(|later| later.url.starts_with(&sorted[i].url))
        })
        .collect();

    sorted
        .into_iter()
        .zip(keep)
        .filter_map(|(source, keep)| keep.then_some(source))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(url: &str) -> SelectedSource {
        SelectedSource {
            url: url.into(),
            title: None,
            content: format!("content of {url}"),
        }
    }

    fn urls(sources: &[SelectedSource]) -> Vec<&str> {
        sources.iter().map(|s| s.url.as_str()).collect()
    }

    #[test]
    fn extracts_urls_from_free_text() {
        let answer = "The best sources are https://web.gencat.cat/ca/tramits/beca, and \
                      (https://web.gencat.cat/ca/tramits/padro). See also \
                      [link](https://x.cat/a) or \"https://x.cat/b\".";
        assert_eq!(
            extract_urls(answer),
            vec![
                "https://web.gencat.cat/ca/tramits/beca",
                "https://web.gencat.cat/ca/tramits/padro",
                "https://x.cat/a",
                "https://x.cat/b",
            ]
        );
    }

    #[test]
    fn strips_markdown_emphasis_and_table_pipes() {
        let answer = "1. **https://x.cat/a**\n| https://x.cat/b|https://x.cat/c |\n_https://x.cat/d_";
        assert_eq!(
            extract_urls(answer),
            vec!["https://x.cat/a", "https://x.cat/b", "https://x.cat/c", "https://x.cat/d"]
        );
    }

    #[test]
    fn trims_trailing_punctuation_and_dedups() {
        let answer = "1. https://x.cat/a.\n2. https://x.cat/a;\n3. http://x.cat/c:";
        assert_eq!(extract_urls(answer), vec!["https://x.cat/a", "http://x.cat/c"]);
    }

    #[test]
    fn no_urls_in_answer() {
        assert!(extract_urls("Cap de les fonts és rellevant.").is_empty());
    }

    #[test]
    fn removes_parent_urls() {
        let pruned = remove_parent_urls(vec![
            source("https://x.cat/tramits/beca/requisits"),
            source("https://x.cat/tramits"),
            source("https://x.cat/tramits/beca"),
            source("https://x.cat/ajuts"),
        ]);
        assert_eq!(
            urls(&pruned),
            vec!["https://x.cat/ajuts", "https://x.cat/tramits/beca/requisits"]
        );
    }

    #[test]
    fn parent_pruning_is_idempotent() {
        let input = vec![
            source("https://x.cat/a"),
            source("https://x.cat/a/b"),
            source("https://x.cat/c"),
            source("https://x.cat/a"),
        ];
        let once = remove_parent_urls(input);
        let twice = remove_parent_urls(once.clone());
        assert_eq!(once, twice);
        assert_eq!(urls(&once), vec!["https://x.cat/c", "https://x.cat/a/b"]);
    }

    #[test]
    fn pruning_empty_set() {
        assert!(remove_parent_urls(Vec::new()).is_empty());
    }
}
