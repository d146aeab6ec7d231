//! Wildcard key patterns shared by both tiers.
//!
//! Keys are `:`-separated segments (`cache:user:42`). In a pattern:
//!
//! - `*` matches any run of characters within one segment, so `user:*`
//!   matches `user:1` but not `user:other:9`
//! - `**` matches any run of characters, separators included, so
//!   `user:**` matches both
//! - every other character matches itself
//!
//! A pattern without wildcards matches exactly one key. L1 evaluates
//! [`KeyPattern::matches`] directly. The Redis adapter scans with
//! [`KeyPattern::to_redis_glob`], whose match set is a superset, and
//! re-checks every scanned key with [`KeyPattern::matches`], so both tiers
//! select the same keys.

use regex::Regex;

use crate::error::{CacheError, CacheResult};

/// Segment separator inside cache keys.
pub const SEPARATOR: char = ':';

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    /// `*`
    Segment,
    /// `**`
    Any,
}

/// A compiled invalidation pattern. Matching runs in time linear in the key.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    raw: String,
    tokens: Vec<Token>,
    regex: Regex,
}

impl KeyPattern {
    pub fn new(pattern: impl Into<String>) -> CacheResult<Self> {
        let raw = pattern.into();
        let tokens = tokenize(&raw);

        let mut source = String::with_capacity(raw.len() + 8);
        source.push('^');
        for token in &tokens {
            match token {
                Token::Literal(text) => source.push_str(&regex::escape(text)),
                Token::Segment => {
                    source.push_str("[^");
                    source.push_str(&regex::escape(&SEPARATOR.to_string()));
                    source.push_str("]*");
                }
                Token::Any => source.push_str("(?s:.*)"),
            }
        }
        source.push('$');

        let regex = Regex::new(&source).map_err(|e| {
            CacheError::invalid_configuration(format!("invalid key pattern '{raw}': {e}"))
        })?;

        Ok(Self { raw, tokens, regex })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when the pattern has no wildcard and names a single key.
    pub fn is_exact(&self) -> bool {
        self.tokens.iter().all(|t| matches!(t, Token::Literal(_)))
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    /// Pattern for Redis `SCAN MATCH`. Redis `*` also crosses separators, so
    /// results must be filtered with [`KeyPattern::matches`].
    pub fn to_redis_glob(&self) -> String {
        let mut out = String::with_capacity(self.raw.len() + 4);
        for token in &self.tokens {
            match token {
                Token::Literal(text) => {
                    for c in text.chars() {
                        if matches!(c, '?' | '[' | ']' | '\\') {
                            out.push('\\');
                        }
                        out.push(c);
                    }
                }
                Token::Segment | Token::Any => out.push('*'),
            }
        }
        out
    }
}

/// Split a pattern into literals and wildcards. A run of one `*` is a
/// segment wildcard, a longer run crosses separators.
fn tokenize(raw: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '*' {
            literal.push(c);
            continue;
        }
        let mut run = 1;
        while chars.next_if_eq(&'*').is_some() {
            run += 1;
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(std::mem::take(&mut literal)));
        }
        tokens.push(if run == 1 { Token::Segment } else { Token::Any });
    }
    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    tokens
}

impl PartialEq for KeyPattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for KeyPattern {}
