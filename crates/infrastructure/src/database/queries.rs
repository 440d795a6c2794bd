//! 两种后端共用的任务表 SQL
//!
//! 所有状态转换都是单条条件 UPDATE，调用方以受影响行数判断条件是否命中。
//! 时间戳一律由调用方绑定，SQLite 中以 RFC 3339 文本存储，可直接按字典序比较。

pub const TASK_COLUMNS: &str = "id, workspace_id, type, status, progress, state, error_message, \
     max_runtime, max_retries, retry_count, retry_interval, next_run_after, timeout_after, \
     last_run_at, completed_at, claim_token, broadcast_id, created_at, updated_at";

pub const INSERT_TASK: &str = r#"
    INSERT INTO tasks (
        id, workspace_id, type, status, progress, state, error_message,
        max_runtime, max_retries, retry_count, retry_interval, next_run_after,
        created_at, updated_at, broadcast_id
    )
    VALUES ($1, $2, $3, 'pending', $4, $5, NULL, $6, $7, $8, $9, $10, $11, $11, $12)
"#;

pub fn select_by_id() -> String {
    format!("SELECT {TASK_COLUMNS} FROM tasks WHERE workspace_id = $1 AND id = $2")
}

pub fn select_by_broadcast_id() -> String {
    format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE workspace_id = $1 AND broadcast_id = $2 \
         ORDER BY created_at DESC LIMIT 1"
    )
}

/// $1 = now, $2 = abandoned_before, $3 = limit, $4 = offset
pub fn select_due() -> String {
    format!(
        r#"SELECT {TASK_COLUMNS} FROM tasks
        WHERE (status IN ('pending', 'paused') AND (next_run_after IS NULL OR next_run_after <= $1))
           OR (status = 'running' AND (timeout_after IS NULL OR timeout_after < $2))
        ORDER BY CASE WHEN status = 'running' THEN COALESCE(timeout_after, created_at)
                      ELSE COALESCE(next_run_after, created_at) END ASC,
                 created_at ASC, workspace_id ASC, id ASC
        LIMIT $3 OFFSET $4"#
    )
}

/// $1 workspace_id, $2 id, $3 timeout_after, $4 now, $5 claim_token, $6 abandoned_before
///
/// SET 右侧读取的都是更新前的值，因此重新认领被遗弃任务时 retry_count 只加一。
pub const CLAIM_TASK: &str = r#"
    UPDATE tasks SET
        retry_count = CASE WHEN status = 'running' THEN retry_count + 1 ELSE retry_count END,
        status = 'running',
        timeout_after = $3,
        last_run_at = $4,
        claim_token = $5,
        updated_at = $4
    WHERE workspace_id = $1 AND id = $2 AND (
        (status IN ('pending', 'paused') AND (next_run_after IS NULL OR next_run_after <= $4))
        OR (status = 'running'
            AND (timeout_after IS NULL OR timeout_after < $6)
            AND retry_count < max_retries)
    )
"#;

/// $1 workspace_id, $2 id, $3 claim_token, $4 progress, $5 state, $6 updated_at
pub const SAVE_STATE: &str = r#"
    UPDATE tasks SET
        progress = CASE WHEN $4 > progress THEN $4 ELSE progress END,
        state = $5,
        updated_at = $6
    WHERE workspace_id = $1 AND id = $2 AND status = 'running' AND claim_token = $3
"#;

/// $1 workspace_id, $2 id, $3 claim_token, $4 state, $5 completed_at
pub const MARK_COMPLETED: &str = r#"
    UPDATE tasks SET
        status = 'completed',
        progress = 1.0,
        state = $4,
        error_message = NULL,
        completed_at = $5,
        updated_at = $5,
        next_run_after = NULL,
        timeout_after = NULL,
        claim_token = NULL
    WHERE workspace_id = $1 AND id = $2 AND status = 'running' AND claim_token = $3
"#;

/// $1 workspace_id, $2 id, $3 claim_token, $4 error_message, $5 updated_at
pub const MARK_FAILED: &str = r#"
    UPDATE tasks SET
        status = 'failed',
        error_message = $4,
        updated_at = $5,
        next_run_after = NULL,
        timeout_after = NULL,
        claim_token = NULL
    WHERE workspace_id = $1 AND id = $2 AND status = 'running' AND claim_token = $3
"#;

/// $1 workspace_id, $2 id, $3 claim_token, $4 next_run_after, $5 progress, $6 state, $7 updated_at
pub const MARK_PAUSED: &str = r#"
    UPDATE tasks SET
        status = 'paused',
        next_run_after = $4,
        progress = CASE WHEN $5 > progress THEN $5 ELSE progress END,
        state = $6,
        updated_at = $7,
        timeout_after = NULL,
        claim_token = NULL
    WHERE workspace_id = $1 AND id = $2 AND status = 'running' AND claim_token = $3
"#;

/// $1 workspace_id, $2 id, $3 claim_token, $4 retry_count, $5 next_run_after, $6 updated_at
pub const SCHEDULE_RETRY: &str = r#"
    UPDATE tasks SET
        status = 'pending',
        retry_count = $4,
        next_run_after = $5,
        updated_at = $6,
        timeout_after = NULL,
        claim_token = NULL
    WHERE workspace_id = $1 AND id = $2 AND status = 'running' AND claim_token = $3
      AND $4 <= max_retries
"#;

/// $1 workspace_id, $2 id, $3 claim_token, $4 status, $5 updated_at
pub const RELEASE_CLAIM: &str = r#"
    UPDATE tasks SET
        status = $4,
        updated_at = $5,
        timeout_after = NULL,
        claim_token = NULL
    WHERE workspace_id = $1 AND id = $2 AND status = 'running' AND claim_token = $3
"#;

/// $1 workspace_id, $2 id, $3 abandoned_before, $4 error_message, $5 updated_at
pub const FAIL_ABANDONED: &str = r#"
    UPDATE tasks SET
        status = 'failed',
        error_message = $4,
        updated_at = $5,
        next_run_after = NULL,
        timeout_after = NULL,
        claim_token = NULL
    WHERE workspace_id = $1 AND id = $2 AND status = 'running'
      AND (timeout_after IS NULL OR timeout_after < $3)
      AND retry_count >= max_retries
"#;

/// $1 workspace_id, $2 id, $3 now
pub const WAKE_TASK: &str = r#"
    UPDATE tasks SET next_run_after = $3, updated_at = $3
    WHERE workspace_id = $1 AND id = $2 AND status = 'paused'
"#;

pub const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_tasks_status_next_run ON tasks(status, next_run_after)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_status_timeout ON tasks(status, timeout_after)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_broadcast ON tasks(workspace_id, broadcast_id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_workspace_type ON tasks(workspace_id, type)",
];
