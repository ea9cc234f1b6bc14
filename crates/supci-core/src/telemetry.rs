//! Tracing setup for the `supci` binary.
//!
//! Logs go to stderr; stdout is reserved for the JSON documents the CLI
//! prints (`resolve`, `matrix`, `plan`). The filter comes from `SUPCI_LOG`,
//! then `RUST_LOG`, then [`default_directives`].

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "SUPCI_LOG";

/// Default filter: `level` for our crates, HTTP plumbing held at `warn` so
/// readiness polling does not flood the log.
pub fn default_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    format!("{level},supci_core={level},supci={level},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn")
}

fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)))
}

/// Install the global subscriber. Later calls are no-ops.
///
/// JSON output flattens event fields and carries the current span, so every
/// line of a run has its `run_id`.
pub fn init_tracing(json: bool, level: Level) {
    let filter = env_filter(level);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}
