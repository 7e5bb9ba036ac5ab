//! Dynamic command grammars
//!
//! Plugins register patterns in a small mini-language ([`pattern`]). At
//! dispatch time the active registries are combined into one grammar text
//! ([`compiler`]), which is parsed ([`text`]) and linked into a runtime
//! recognizer ([`engine`]). The compiled [`compiler::Dispatcher`] maps every
//! recognized command back to its handler.

pub mod compiler;
pub mod engine;
pub mod pattern;
pub mod registry;
pub mod text;

pub use compiler::{Command, Dispatcher};
pub use pattern::PatternError;
pub use registry::{Arg, Handler, Registry, Reload};

/// Errors raised while building a grammar or parsing a transcript with it
#[derive(Debug, thiserror::Error)]
pub enum GrammarError {
    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error("`{rule}` references undefined symbol `{name}`")]
    UndefinedReference { rule: String, name: String },

    #[error("`{rule}` has an invalid regex: {source}")]
    InvalidRegex {
        rule: String,
        #[source]
        source: regex::Error,
    },

    #[error("`{rule}` cannot be written as grammar text: {reason}")]
    Unrepresentable { rule: String, reason: String },

    #[error("symbol `{0}` is defined more than once")]
    NameCollision(String),

    #[error("grammar text line {line}: {message}")]
    Text { line: usize, message: String },

    #[error("grammar has no `start` production")]
    MissingStart,

    #[error("no command matches {text:?} (stopped at offset {offset})")]
    ParseFailure { text: String, offset: usize },
}
