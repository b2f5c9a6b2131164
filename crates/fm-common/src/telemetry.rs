//! Tracing subscriber bootstrap.
//!
//! `RUST_LOG` takes precedence over the configured level. Installing a
//! subscriber twice is not an error; the second call is ignored so tests and
//! embedding processes can call this freely.

use crate::config::LogConfig;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global `tracing` subscriber described by `config`.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_tracing(config: &LogConfig) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .json(),
            )
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_thread_ids(true))
            .try_init()
    };
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_ignored() {
        let config = LogConfig::default();
        let _ = init_tracing(&config);
        assert!(!init_tracing(&config));
    }
}
