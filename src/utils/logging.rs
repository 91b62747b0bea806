use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

// Audit events stay on even when RUST_LOG narrows the crate's own output.
const DEFAULT_FILTER: &str = "info,audit=info";

/// Logs go to stderr so `call` output on stdout stays machine-readable.
pub fn init() {
    let fmt_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
