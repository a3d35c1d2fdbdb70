//! Logging setup / 日志初始化

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is not set / 默认日志过滤
pub const DEFAULT_FILTER: &str = "bucketkit=info";

/// Install a `tracing` subscriber writing to stderr, filtered by `RUST_LOG`.
/// Returns false when a global subscriber was already installed.
/// 初始化日志
pub fn init_logging() -> bool {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        init_logging();
        assert!(!init_logging());
        tracing::info!("logging initialized");
    }
}
