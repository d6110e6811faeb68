//! Description keyword extraction.
//!
//! Tokens are the lowercase maximal runs of ASCII letters and digits; empty
//! tokens and stop-words are dropped.

use std::collections::HashMap;

use ghscan_core::Keyword;

pub const STOP_WORDS: &[&str] = &[
    "a", "about", "all", "also", "am", "an", "and", "any", "are", "as", "at", "be", "been", "but",
    "by", "can", "do", "does", "for", "from", "had", "has", "have", "he", "her", "his", "how",
    "i", "if", "in", "into", "is", "it", "its", "me", "my", "no", "not", "of", "on", "or", "our",
    "she", "so", "some", "such", "than", "that", "the", "their", "them", "then", "there",
    "these", "they", "this", "those", "to", "too", "up", "us", "very", "was", "we", "were",
    "what", "when", "which", "who", "will", "with", "you", "your",
];

pub fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.contains(&token)
}

pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_ascii_lowercase)
        .filter(|t| !is_stop_word(t))
        .collect()
}

/// The `k` most frequent tokens across `descriptions`, most frequent first,
/// ties broken alphabetically.
pub fn top_keywords<S: AsRef<str>>(descriptions: &[S], k: usize) -> Vec<Keyword> {
    let mut counts: HashMap<String, i64> = HashMap::new();
    for description in descriptions {
        for token in tokenize(description.as_ref()) {
            *counts.entry(token).or_default() += 1;
        }
    }
    let mut keywords: Vec<Keyword> = counts
        .into_iter()
        .map(|(id, value)| Keyword { id, value })
        .collect();
    keywords.sort_by(|a, b| b.value.cmp(&a.value).then_with(|| a.id.cmp(&b.id)));
    keywords.truncate(k);
    keywords
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kw(id: &str, value: i64) -> Keyword {
        Keyword { id: id.into(), value }
    }

    #[test]
    fn splits_on_punctuation_and_drops_stop_words() {
        assert_eq!(
            tokenize("The Go-based, fast HTTP server!"),
            vec!["go", "based", "fast", "http", "server"]
        );
        assert!(tokenize("  --- !!! ").is_empty());
        assert_eq!(tokenize("naïve café"), vec!["na", "ve", "caf"]);
    }

    #[test]
    fn description_contributes_one_count_per_token() {
        let out = top_keywords(&["The Go-based, fast HTTP server!"], 20);
        assert_eq!(
            out,
            vec![kw("based", 1), kw("fast", 1), kw("go", 1), kw("http", 1), kw("server", 1)]
        );
    }

    #[test]
    fn ranks_by_frequency_and_truncates() {
        let out = top_keywords(
            &["rust cli tool", "a rust web server", "cli for rust"],
            2,
        );
        assert_eq!(out, vec![kw("rust", 3), kw("cli", 2)]);
        assert!(top_keywords::<&str>(&[], 5).is_empty());
    }
}
