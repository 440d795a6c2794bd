//! 持久化、可恢复的多租户任务执行引擎

pub mod app;

pub use app::{Application, HostCollaborators};
pub use taskengine_core::{AppConfig, SchedulerError, SchedulerResult};
pub use taskengine_dispatcher::{DispatchReport, ExecutionResult, TaskExecutionRecord};
