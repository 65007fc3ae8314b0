//! tracing subscriber setup.
//!
//! `RUST_LOG` wins when set; otherwise `info`, or `debug` for fanout's own
//! targets with `--verbose`. Logs go to stderr so stdout stays free for the
//! summary.

use anyhow::{Result, anyhow};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn default_directive(verbose: bool) -> &'static str {
    if verbose { "info,fanout=debug" } else { "info" }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(verbose: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose),
        )
        .try_init()
        .map_err(|e| anyhow!("failed to initialize logging: {e}"))
}
