//! Log output for the CLI.
//!
//! `RUST_LOG` wins when set; otherwise `-v` raises the crate's level from
//! `warn` to `info` (`-v`) or `debug` (`-vv` and up). Logs go to stderr.

use tracing_subscriber::{fmt, EnvFilter};

/// Default filter directive for a verbosity count.
pub fn default_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "warn,workflow_deps=info,wfdeps=info",
        _ => "info,workflow_deps=debug,wfdeps=debug",
    }
}

/// Install the global subscriber. Safe to call more than once.
pub fn init(verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose > 1)
        .try_init();
}
