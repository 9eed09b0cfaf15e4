//! Patterns matched against captured output

use regex::bytes::Regex;
use std::fmt;
use std::ops::Range;

use crate::error::{HarnessError, Result};

/// How a [`Pattern`] was built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    /// Plain substring, matched literally
    Literal,
    /// Regular expression
    Regex,
}

/// Something to look for in a byte stream
#[derive(Clone)]
pub struct Pattern {
    source: String,
    compiled: Compiled,
}

#[derive(Clone)]
enum Compiled {
    /// Escaped form of the literal; `None` only if it exceeded the regex size limit
    Literal(Option<Regex>),
    Regex(Regex),
}

impl Pattern {
    /// Match `text` literally
    pub fn literal(text: impl Into<String>) -> Self {
        let source = text.into();
        let escaped = Regex::new(&regex::escape(&source)).ok();
        Self {
            source,
            compiled: Compiled::Literal(escaped),
        }
    }

    /// Match a regular expression
    pub fn regex(expr: impl Into<String>) -> Result<Self> {
        let source = expr.into();
        let regex = Regex::new(&source).map_err(|e| HarnessError::InvalidPattern {
            pattern: source.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            source,
            compiled: Compiled::Regex(regex),
        })
    }

    pub fn kind(&self) -> PatternKind {
        match self.compiled {
            Compiled::Literal(_) => PatternKind::Literal,
            Compiled::Regex(_) => PatternKind::Regex,
        }
    }

    /// The text the pattern was built from
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Byte range of the first match in `haystack`
    pub fn find(&self, haystack: &[u8]) -> Option<Range<usize>> {
        match &self.compiled {
            Compiled::Literal(Some(escaped)) => escaped.find(haystack).map(|m| m.range()),
            Compiled::Literal(None) => {
                let needle = self.source.as_bytes();
                if needle.is_empty() {
                    return Some(0..0);
                }
                haystack
                    .windows(needle.len())
                    .position(|window| window == needle)
                    .map(|start| start..start + needle.len())
            }
            Compiled::Regex(regex) => regex.find(haystack).map(|m| m.range()),
        }
    }

    pub fn is_match(&self, haystack: &[u8]) -> bool {
        self.find(haystack).is_some()
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pattern")
            .field("kind", &self.kind())
            .field("source", &self.source)
            .finish()
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            PatternKind::Literal => write!(f, "{:?}", self.source),
            PatternKind::Regex => write!(f, "/{}/", self.source),
        }
    }
}

impl From<&str> for Pattern {
    fn from(text: &str) -> Self {
        Pattern::literal(text)
    }
}

impl From<String> for Pattern {
    fn from(text: String) -> Self {
        Pattern::literal(text)
    }
}

impl From<&Pattern> for Pattern {
    fn from(pattern: &Pattern) -> Self {
        pattern.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_is_escaped() {
        let p = Pattern::literal("a.b");
        assert!(p.is_match(b"xx a.b yy"));
        assert!(!p.is_match(b"axb"));
        assert_eq!(p.find(b"--a.b"), Some(2..5));
        assert_eq!(p.kind(), PatternKind::Literal);
    }

    #[test]
    fn test_literal_search_on_large_repetitive_output() {
        // Near-miss prefixes at every offset
        let needle = format!("{}b", "a".repeat(4096));
        let mut haystack = vec![b'a'; 4 << 20];
        haystack.extend_from_slice(b"b\xff\x00tail");

        let p = Pattern::literal(needle.clone());
        let end = (4 << 20) + 1;
        assert_eq!(p.find(&haystack), Some(end - needle.len()..end));
        assert!(!p.is_match(&haystack[..4 << 20]));

        assert_eq!(Pattern::literal("").find(b"anything"), Some(0..0));
        assert_eq!(Pattern::literal("tail").find(&haystack), Some(end + 2..end + 6));
        assert_eq!(Pattern::literal("é").find("café".as_bytes()), Some(3..5));
    }

    #[test]
    fn test_regex_pattern() {
        let p = Pattern::regex(r"the-cell-id-.*-0").unwrap();
        assert!(p.is_match(b"placed on the-cell-id-abc-0"));
        assert_eq!(p.to_string(), "/the-cell-id-.*-0/");
    }

    #[test]
    fn test_invalid_regex() {
        let err = Pattern::regex("(unclosed").unwrap_err();
        assert!(matches!(err, HarnessError::InvalidPattern { .. }));
    }
}
