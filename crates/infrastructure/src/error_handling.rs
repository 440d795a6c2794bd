//! 仓储操作的错误上下文
//!
//! 数据库错误在这里附加工作空间、任务等实体信息后统一记录，再转换为 `SchedulerError`。

use chrono::{DateTime, Utc};
use sqlx::Error as SqlxError;
use std::fmt;
use taskengine_core::SchedulerError;
use tracing::{error, instrument};

#[derive(Debug, Clone, Copy)]
pub enum RepositoryOperation {
    Create,
    Read,
    Query,
    Claim,
    Checkpoint,
    Transition,
    Migrate,
}

impl fmt::Display for RepositoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryOperation::Create => write!(f, "创建"),
            RepositoryOperation::Read => write!(f, "查询"),
            RepositoryOperation::Query => write!(f, "扫描"),
            RepositoryOperation::Claim => write!(f, "认领"),
            RepositoryOperation::Checkpoint => write!(f, "保存检查点"),
            RepositoryOperation::Transition => write!(f, "状态转换"),
            RepositoryOperation::Migrate => write!(f, "迁移"),
        }
    }
}

/// 任务仓储操作的上下文信息
#[derive(Debug, Clone)]
pub struct TaskOperationContext {
    pub operation: RepositoryOperation,
    pub workspace_id: Option<String>,
    pub task_id: Option<String>,
    pub task_type: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub additional_info: Option<String>,
}

impl TaskOperationContext {
    pub fn new(operation: RepositoryOperation) -> Self {
        Self {
            operation,
            workspace_id: None,
            task_id: None,
            task_type: None,
            timestamp: Utc::now(),
            additional_info: None,
        }
    }

    pub fn with_workspace_id(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_additional_info(mut self, info: impl Into<String>) -> Self {
        self.additional_info = Some(info.into());
        self
    }

    pub fn entity_description(&self) -> String {
        let mut desc = match (&self.task_id, &self.workspace_id) {
            (Some(id), Some(ws)) => format!("任务 (ID: {id}, 工作空间: {ws})"),
            (Some(id), None) => format!("任务 (ID: {id})"),
            (None, Some(ws)) => format!("工作空间 {ws} 的任务"),
            (None, None) => "任务".to_string(),
        };
        if let Some(info) = &self.additional_info {
            desc.push_str(&format!(" [{info}]"));
        }
        desc
    }
}

pub struct RepositoryErrorHelpers;

impl RepositoryErrorHelpers {
    #[instrument(skip_all, fields(
        operation = %context.operation,
        workspace_id = ?context.workspace_id,
        task_id = ?context.task_id,
        task_type = ?context.task_type,
        timestamp = %context.timestamp,
    ))]
    pub fn task_database_error(context: TaskOperationContext, error: SqlxError) -> SchedulerError {
        let entity_desc = context.entity_description();
        let operation_desc = context.operation.to_string();

        let error_msg = match &error {
            SqlxError::Database(db_error) => match db_error.constraint() {
                Some("tasks_pkey") => format!(
                    "{operation_desc}{entity_desc}时发生主键冲突: 任务ID {} 已存在",
                    context.task_id.as_deref().unwrap_or("未知")
                ),
                Some(constraint) => {
                    format!("{operation_desc}{entity_desc}时发生数据库约束冲突: {constraint}")
                }
                None => format!("{operation_desc}{entity_desc}时发生数据库错误: {db_error}"),
            },
            SqlxError::PoolClosed => format!("{operation_desc}{entity_desc}时数据库连接池已关闭"),
            SqlxError::PoolTimedOut => format!("{operation_desc}{entity_desc}时数据库连接池超时"),
            SqlxError::Io(io_error) => {
                format!("{operation_desc}{entity_desc}时发生I/O错误: {io_error}")
            }
            _ => format!("{operation_desc}{entity_desc}时发生未知数据库错误: {error}"),
        };

        error!(error = %error, "{}", error_msg);
        SchedulerError::database_error(error_msg)
    }

    pub fn task_serialization_error(
        context: TaskOperationContext,
        error: serde_json::Error,
    ) -> SchedulerError {
        let msg = format!(
            "{}{}时序列化任务状态失败: {error}",
            context.operation,
            context.entity_description()
        );
        error!(error = %error, "{}", msg);
        SchedulerError::Serialization(msg)
    }
}

/// 快速构建任务操作上下文
#[macro_export]
macro_rules! task_context {
    ($operation:expr) => {
        $crate::error_handling::TaskOperationContext::new($operation)
    };
    ($operation:expr, workspace_id = $workspace_id:expr) => {
        $crate::error_handling::TaskOperationContext::new($operation)
            .with_workspace_id($workspace_id)
    };
    ($operation:expr, workspace_id = $workspace_id:expr, task_id = $task_id:expr) => {
        $crate::error_handling::TaskOperationContext::new($operation)
            .with_workspace_id($workspace_id)
            .with_task_id($task_id)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_description() {
        let ctx = task_context!(
            RepositoryOperation::Claim,
            workspace_id = "ws_1",
            task_id = "t_1"
        );
        assert_eq!(ctx.entity_description(), "任务 (ID: t_1, 工作空间: ws_1)");

        let ctx = task_context!(RepositoryOperation::Query, workspace_id = "ws_1")
            .with_additional_info("limit=10");
        assert_eq!(ctx.entity_description(), "工作空间 ws_1 的任务 [limit=10]");
    }

    #[test]
    fn test_pool_errors_map_to_retryable_database_errors() {
        let err = RepositoryErrorHelpers::task_database_error(
            task_context!(RepositoryOperation::Transition),
            SqlxError::PoolTimedOut,
        );
        assert!(err.is_retryable());
        assert!(err.to_string().contains("连接池超时"));
    }
}
