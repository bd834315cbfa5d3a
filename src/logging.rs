//! Tracing subscriber setup.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Error, Result};

/// Installs a `fmt` subscriber filtered by `level` (any `EnvFilter`
/// directive, e.g. `info` or `graphflow::dispatch=debug`).
///
/// Fails when the directive does not parse or a global subscriber is
/// already installed.
pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .map_err(|e| Error::InvalidArgument(format!("invalid log level '{level}': {e}")))?;
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|_| Error::InvalidArgument("logging already initialized".into()))
}

/// Installs the subscriber at most once, preferring `RUST_LOG` over
/// `fallback`. Later calls are no-ops.
pub fn install_once(fallback: &str) {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
        let _ = fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}
