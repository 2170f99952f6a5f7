//! Tracing setup for the binary.

use tracing_subscriber::EnvFilter;

/// Installs the global subscriber, writing to stderr. `RUST_LOG` wins over the
/// default level, which is `info` or `debug` when `verbose` is set.
pub fn init_tracing(verbose: bool) {
    let default = if verbose { "checkflow=debug" } else { "checkflow=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
