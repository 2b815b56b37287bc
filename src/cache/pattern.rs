//! Glob patterns for bulk invalidation.
//!
//! The remote store understands globs natively; the in-process store needs
//! them translated into an anchored regular expression. Only `*` (any run)
//! and `?` (one character) are wildcards; a backslash makes the next
//! character literal, as it does for the remote store. Every other character
//! matches itself.

use regex::Regex;

use super::store::StoreError;

/// Backslash-escape every glob metacharacter in `text`.
pub fn escape_glob(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Compile a glob into an anchored regex with every non-wildcard escaped.
pub fn glob_to_regex(glob: &str) -> Result<Regex, StoreError> {
    if glob.is_empty() {
        return Err(StoreError::invalid_pattern(glob, "pattern must not be empty"));
    }

    let mut source = String::with_capacity(glob.len() * 2 + 2);
    source.push('^');
    let mut literal = [0u8; 4];
    let mut chars = glob.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            '\\' => {
                let escaped = chars.next().unwrap_or('\\');
                source.push_str(&regex::escape(escaped.encode_utf8(&mut literal)));
            }
            other => source.push_str(&regex::escape(other.encode_utf8(&mut literal))),
        }
    }
    source.push('$');

    Regex::new(&source).map_err(|err| StoreError::invalid_pattern(glob, err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_any_run() {
        let re = glob_to_regex("gazette:*:/api/news*").unwrap();
        assert!(re.is_match("gazette:resource:/api/news?page=1@anon"));
        assert!(re.is_match("gazette:route:GET:/api/news/42@anon"));
        assert!(!re.is_match("gazette:resource:/api/activities@anon"));
    }

    #[test]
    fn metacharacters_match_literally() {
        let re = glob_to_regex("v1.(beta)+*").unwrap();
        assert!(re.is_match("v1.(beta)+anything"));
        assert!(!re.is_match("v1x(beta)+anything"));
        assert!(!re.is_match("v1.betaaa"));
    }

    #[test]
    fn pattern_is_anchored() {
        let re = glob_to_regex("news:*").unwrap();
        assert!(!re.is_match("old-news:1"));
        assert!(re.is_match("news:1"));
    }

    #[test]
    fn question_mark_matches_one_character() {
        let re = glob_to_regex("item:?").unwrap();
        assert!(re.is_match("item:7"));
        assert!(!re.is_match("item:77"));
    }

    #[test]
    fn backslash_makes_wildcards_literal() {
        let re = glob_to_regex(r"*/api/news\?*").unwrap();
        assert!(re.is_match("gazette:news:/api/news?page=2@anon"));
        assert!(!re.is_match("gazette:newsletters:/api/newsletters@anon"));

        let re = glob_to_regex(&format!("{}*", escape_glob("a*b?"))).unwrap();
        assert!(re.is_match("a*b?c"));
        assert!(!re.is_match("axbyc"));
    }

    #[test]
    fn trailing_backslash_is_literal() {
        let re = glob_to_regex("dir\\").unwrap();
        assert!(re.is_match("dir\\"));
    }

    #[test]
    fn empty_pattern_is_rejected() {
        assert!(matches!(
            glob_to_regex(""),
            Err(StoreError::InvalidPattern { .. })
        ));
    }
}
