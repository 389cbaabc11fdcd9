//! Tracing initialisation.
//!
//! The container crates only emit `tracing` events; installing a
//! subscriber is left to the application. These helpers wire up the
//! `fmt` layer with an env-filter for binaries, demos and quick experiments.

use tracing_subscriber::EnvFilter;

/// Default filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "khazna=info,khazna_container=info";

/// Builds the filter: `RUST_LOG` wins, otherwise `fallback`.
pub fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Installs a global `fmt` subscriber.
///
/// Returns `false` when a global subscriber was already installed
/// (e.g. by a test harness), in which case nothing changes.
pub fn try_init_tracing(fallback: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(fallback))
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Installs a global `fmt` subscriber using [`DEFAULT_FILTER`].
pub fn init_tracing() {
    if !try_init_tracing(DEFAULT_FILTER) {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_filter_parses() {
        let filter = EnvFilter::new("khazna=debug");
        assert!(filter.to_string().contains("khazna=debug"));
    }

    #[test]
    fn second_init_is_harmless() {
        let _ = try_init_tracing("warn");
        assert!(!try_init_tracing("warn"));
    }
}
