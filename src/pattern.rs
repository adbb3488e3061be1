//! `@match` URL patterns.
//!
//! The dialect is a small glob: `*` matches any run of characters, every other
//! character is literal, and a leading `http:` also accepts `https:`. A `*.`
//! that opens the host (`*.torn.com/*`, `https://*.torn.com/*`) also accepts
//! the bare domain. Patterns are compiled to an anchored regex after escaping
//! each literal run, so `?`, `+` or `(` in a pattern never change its meaning.

use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Longest pattern accepted by [`MatchPattern::compile`].
pub const MAX_PATTERN_LEN: usize = 4096;

const REGEX_SIZE_LIMIT: usize = 1 << 20;
const CACHE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("match pattern is empty")]
    Empty,

    #[error("match pattern is {len} bytes long (max: {max})")]
    TooLong { len: usize, max: usize },

    #[error("match pattern '{pattern}' could not be compiled: {message}")]
    Invalid { pattern: String, message: String },
}

/// A compiled `@match` pattern.
#[derive(Debug, Clone)]
pub struct MatchPattern {
    source: String,
    regex: Regex,
}

impl MatchPattern {
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        if pattern.trim().is_empty() {
            return Err(PatternError::Empty);
        }
        if pattern.len() > MAX_PATTERN_LEN {
            return Err(PatternError::TooLong {
                len: pattern.len(),
                max: MAX_PATTERN_LEN,
            });
        }

        let expression = to_regex_source(pattern);
        let regex = RegexBuilder::new(&expression)
            .dot_matches_new_line(true)
            .size_limit(REGEX_SIZE_LIMIT)
            .build()
            .map_err(|e| PatternError::Invalid {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// True if the whole URL matches.
    pub fn matches(&self, url: &str) -> bool {
        self.regex.is_match(url)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for MatchPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn to_regex_source(pattern: &str) -> String {
    let mut expression = String::with_capacity(pattern.len() * 2 + 2);
    expression.push('^');

    let mut rest = pattern;
    let mut offset = 0;
    if let Some(after) = pattern.strip_prefix("http:") {
        expression.push_str("https?:");
        rest = after;
        offset = "http:".len();
    }

    let mut literal = String::new();
    let mut after_wildcard = false;
    let mut chars = rest.char_indices().peekable();
    while let Some((i, ch)) = chars.next() {
        if ch != '*' {
            literal.push(ch);
            after_wildcard = false;
            continue;
        }

        if !literal.is_empty() {
            expression.push_str(&regex::escape(&literal));
            literal.clear();
        } else if after_wildcard {
            continue;
        }

        // `*.` opening the host also matches the bare domain
        let consumed = &pattern[..offset + i];
        if chars.peek().map(|&(_, c)| c) == Some('.') && at_host_start(consumed) {
            chars.next();
            if consumed.is_empty() {
                expression.push_str(r"(?:.*\.|[A-Za-z][A-Za-z0-9+.-]*://)");
            } else {
                expression.push_str(r"(?:.*\.)?");
            }
            after_wildcard = false;
            continue;
        }

        expression.push_str(".*");
        after_wildcard = true;
    }
    if !literal.is_empty() {
        expression.push_str(&regex::escape(&literal));
    }

    expression.push('$');
    expression
}

fn at_host_start(consumed: &str) -> bool {
    consumed.is_empty() || consumed.ends_with("://")
}

/// Test a URL against a pattern; malformed patterns never match.
pub fn url_matches(url: &str, pattern: &str) -> bool {
    MatchPattern::compile(pattern)
        .map(|compiled| compiled.matches(url))
        .unwrap_or(false)
}

/// Memoized pattern compilation, shared across navigations.
///
/// Failures are cached too so a broken `@match` is reported once per pattern
/// text rather than recompiled on every page load.
#[derive(Debug, Default)]
pub struct PatternCache {
    compiled: Mutex<HashMap<String, Result<MatchPattern, PatternError>>>,
}

impl PatternCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, pattern: &str) -> Result<MatchPattern, PatternError> {
        let mut compiled = self.compiled.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(result) = compiled.get(pattern) {
            return result.clone();
        }

        let result = MatchPattern::compile(pattern);
        if compiled.len() >= CACHE_CAPACITY {
            compiled.clear();
        }
        compiled.insert(pattern.to_string(), result.clone());
        result
    }

    pub fn matches(&self, pattern: &str, url: &str) -> Result<bool, PatternError> {
        self.get(pattern).map(|compiled| compiled.matches(url))
    }

    pub fn len(&self) -> usize {
        self.compiled.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
