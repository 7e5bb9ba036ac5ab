//! voca: route spoken-command transcripts to desktop actions
//!
//! A manager process reads recognizer output, decides which transcripts to act
//! on and hands them to a pool of worker processes. Each worker compiles the
//! active plugins' patterns into one grammar, parses the transcript and runs
//! the matched handlers.

pub mod config;
pub mod context;
pub mod envelope;
pub mod executor;
pub mod frame;
pub mod grammar;
pub mod logging;
pub mod manager;
pub mod plugin;
pub mod pool;
pub mod worker;
