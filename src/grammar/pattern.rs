//! Pattern mini-language
//!
//! Plugins write command patterns the way they are spoken:
//!
//! - `say <chord>`: bare words are literals, `<name>` references a fragment
//! - `[please] stop`: optional part
//! - `(go to | jump) line NUMBER`: alternation; a bare word naming a known
//!   fragment or built-in terminal is a reference too
//! - `key+`, `word*`: repetition of the preceding atom
//! - `"quoted phrase"` and `/regex/` pass through unchanged
//!
//! [`translate`] turns a pattern into grammar text. Consecutive bare words
//! become a single quoted phrase, so `go to` becomes `"go to"`.

use super::text::{self, Dialect, Expr, SyntaxError};

/// A pattern that does not conform to the mini-language
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid pattern {pattern:?}: {source}")]
pub struct PatternError {
    pub pattern: String,
    #[source]
    pub source: SyntaxError,
}

/// Parse a pattern into an expression.
///
/// `known` decides whether a bare word names a fragment.
pub fn parse(pattern: &str, known: &dyn Fn(&str) -> bool) -> Result<Expr, PatternError> {
    text::parse_expr(pattern, Dialect::Pattern { known }).map_err(|source| PatternError {
        pattern: pattern.to_string(),
        source,
    })
}

/// Translate a pattern into grammar text.
pub fn translate(pattern: &str, known: &dyn Fn(&str) -> bool) -> Result<String, PatternError> {
    parse(pattern, known).map(|expr| expr.to_string())
}
