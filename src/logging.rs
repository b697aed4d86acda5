//! Tracing subscriber setup for the `cqa` binary.
//!
//! Logs go to stderr so stdout carries only command output. `RUST_LOG`
//! takes precedence; otherwise the level is `info`, or `debug` with
//! `--verbose`.

use tracing_subscriber::EnvFilter;

pub fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    // A second call (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
