//! Structured log output
//!
//! Manager and workers both log newline-delimited JSON to stdout, so a
//! worker's records can be relayed line by line through the manager.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "voca=info";

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init(enabled: bool) {
    if !enabled {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true)
        .with_env_filter(filter())
        .with_writer(std::io::stdout)
        .try_init();
}
