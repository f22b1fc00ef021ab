//! Tracing setup for suite runs.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the fmt subscriber, filtered by `RUST_LOG` or else `fallback_filter`.
///
/// Safe to call from every test: only the first call installs a subscriber.
/// Returns whether this call installed it.
pub fn init(fallback_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init("mcs_conformance=debug");
        assert!(!init("mcs_conformance=debug"));
    }
}
