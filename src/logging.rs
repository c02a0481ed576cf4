//! Structured logging to stderr.
//!
//! `RUST_LOG` wins when set; otherwise `[logging] level` from the config,
//! or `debug` with `--verbose`. Stdout stays reserved for command output.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init_logging(level: &str, verbose: bool) {
    let level = if verbose { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")));

    // A second init (tests, embedding callers) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .try_init();
}
