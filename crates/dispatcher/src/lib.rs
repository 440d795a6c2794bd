//! 任务分发与执行
//!
//! 由外部定时器触发的 `execute_pending` 入口、处理器注册表、重试策略与内置处理器。

pub mod dispatcher;
pub mod handler;
pub mod handler_registry;
pub mod handlers;
pub mod retry_service;

pub use dispatcher::{DispatchReport, ExecutionResult, TaskDispatcher, TaskExecutionRecord};
pub use handler::{ExecutionContext, TaskHandler, TaskLease, TaskOutcome};
pub use handler_registry::HandlerRegistry;
pub use handlers::{register_builtin, BuiltinCollaborators};
pub use retry_service::{AbandonedDisposition, RetryPolicy, Transition};
