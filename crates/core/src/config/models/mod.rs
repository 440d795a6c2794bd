pub mod app_config;
pub mod database;
pub mod dispatcher;
pub mod handlers;
pub mod observability;
pub mod retry;

/// 以秒计的间隔类配置允许的最大值（30 天）
pub const MAX_INTERVAL_SECONDS: i64 = 30 * 24 * 60 * 60;

// Re-export main types for easier imports
pub use app_config::AppConfig;
pub use database::DatabaseConfig;
pub use dispatcher::DispatcherConfig;
pub use handlers::{BroadcastConfig, SegmentConfig};
pub use observability::ObservabilityConfig;
pub use retry::{BackoffStrategy, RetryConfig};
