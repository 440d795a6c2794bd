//! 配置管理
//!
//! 加载顺序：内置默认值 → TOML 配置文件 → 环境变量（前缀 `TASKENGINE`，分隔符 `__`）。

pub mod models;


pub use models::{
    AppConfig, BackoffStrategy, BroadcastConfig, DatabaseConfig, DispatcherConfig,
    ObservabilityConfig, RetryConfig, SegmentConfig, MAX_INTERVAL_SECONDS,
};
