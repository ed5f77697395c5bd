//! Filter evaluator: keyword set (OR) AND optional regex.
//!
//! Keyword-only and regex-only rules pass the other test vacuously.
//! A malformed pattern never matches.

use regex::Regex;
use tracing::{debug, warn};

use crate::store::model::FilterSpec;

#[derive(Debug, Clone)]
enum Pattern {
    Any,
    Compiled(Regex),
    Invalid { pattern: String, error: String },
}

/// A [`FilterSpec`] with its regex compiled once.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    keywords: Vec<String>,
    pattern: Pattern,
}

impl CompiledFilter {
    pub fn new(spec: &FilterSpec) -> Self {
        let keywords = spec.keywords.clone();

        let pattern = if spec.regex.is_empty() {
            Pattern::Any
        } else {
            match Regex::new(&spec.regex) {
                Ok(re) => Pattern::Compiled(re),
                Err(e) => Pattern::Invalid {
                    pattern: spec.regex.clone(),
                    error: e.to_string(),
                },
            }
        };

        Self { keywords, pattern }
    }

    /// Compile error for the regex, if it is malformed.
    pub fn regex_error(&self) -> Option<&str> {
        match &self.pattern {
            Pattern::Invalid { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn matches(&self, text: &str) -> bool {
        let keyword_ok =
            self.keywords.is_empty() || self.keywords.iter().any(|k| text.contains(k.as_str()));
        if !keyword_ok {
            return false;
        }

        match &self.pattern {
            Pattern::Any => true,
            Pattern::Compiled(re) => re.is_match(text),
            Pattern::Invalid { pattern, error } => {
                debug!(pattern = %pattern, error = %error, "Malformed filter regex, failing closed");
                false
            }
        }
    }
}

/// One-shot evaluation of `spec` against `text`.
pub fn matches(spec: &FilterSpec, text: &str) -> bool {
    let filter = CompiledFilter::new(spec);
    if let Some(error) = filter.regex_error() {
        warn!(pattern = %spec.regex, error = %error, "Malformed filter regex");
    }
    filter.matches(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(keywords: &[&str], regex: &str) -> FilterSpec {
        FilterSpec {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            regex: regex.into(),
        }
    }

    #[test]
    fn empty_spec_passes_everything() {
        let s = spec(&[], "");
        assert!(matches(&s, ""));
        assert!(matches(&s, "anything at all"));
    }

    #[test]
    fn any_keyword_suffices() {
        let s = spec(&["foo", "bar"], "");
        assert!(matches(&s, "a bar walks in"));
        assert!(matches(&s, "foo"));
        assert!(!matches(&s, "baz"));
    }

    #[test]
    fn keywords_are_case_sensitive_substrings() {
        let s = spec(&["Alert"], "");
        assert!(matches(&s, "RedAlert!"));
        assert!(!matches(&s, "alert"));
    }

    #[test]
    fn keyword_and_regex_must_both_pass() {
        let s = spec(&["foo", "bar"], "^baz");
        assert!(!matches(&s, "foo starts the line"));
        assert!(matches(&s, "baz then foo"));
    }

    #[test]
    fn regex_search_is_unanchored() {
        let s = spec(&[], r"\d{3}");
        assert!(matches(&s, "order 123 shipped"));
        assert!(!matches(&s, "order 12 shipped"));
    }

    #[test]
    fn malformed_regex_fails_closed() {
        let s = spec(&[], "(unclosed");
        let filter = CompiledFilter::new(&s);
        assert!(filter.regex_error().is_some());
        assert!(!filter.matches("(unclosed"));
        assert!(!matches(&s, ""));
    }

    #[test]
    fn evaluation_is_idempotent() {
        let filter = CompiledFilter::new(&spec(&["x"], "y$"));
        for _ in 0..3 {
            assert!(filter.matches("x...y"));
            assert!(!filter.matches("x...z"));
        }
    }

    #[test]
    fn blank_keyword_matches_everything() {
        let s = spec(&["", "foo"], "");
        assert!(matches(&s, "anything"));
        assert!(matches(&s, ""));
    }
}
