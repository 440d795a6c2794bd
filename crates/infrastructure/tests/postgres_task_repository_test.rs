use anyhow::Result;
use chrono::Duration;
use taskengine_domain::{
    task_types, BuildSegmentState, DueTaskQuery, Task, TaskRepository, TaskState, TaskStatus,
};
use taskengine_infrastructure::PostgresTaskRepository;

mod common;
use common::{at, claim};
use database_test_utils::DatabaseTestContainer;

#[tokio::test]
#[ignore = "需要 Docker"]
async fn test_postgres_task_lifecycle() -> Result<()> {
    let container = DatabaseTestContainer::new().await?;
    PostgresTaskRepository::run_migrations(&container.pool).await?;
    // 迁移可重复执行
    PostgresTaskRepository::run_migrations(&container.pool).await?;
    let repo = PostgresTaskRepository::new(container.pool.clone());

    let mut task = Task::new("ws_1", task_types::BUILD_SEGMENT)
        .with_state(TaskState::BuildSegment(BuildSegmentState::new("seg_1", 2)));
    task.created_at = at(0);
    task.updated_at = at(0);
    let created = repo.create(&task).await?;
    assert_eq!(created, task);

    let lease = claim(&repo, "ws_1", &task.id, at(10)).await?.unwrap();
    assert!(claim(&repo, "ws_1", &task.id, at(11)).await?.is_none());

    let mut checkpoint = BuildSegmentState::new("seg_1", 2);
    checkpoint.contact_offset = 100;
    let checkpoint = TaskState::BuildSegment(checkpoint);
    assert!(
        repo.save_state("ws_1", &task.id, &lease.claim_token, 0.4, &checkpoint, at(11))
            .await?
    );
    assert!(
        repo.save_state("ws_1", &task.id, &lease.claim_token, 0.2, &checkpoint, at(12))
            .await?
    );
    assert!(!repo
        .save_state("ws_1", &task.id, "stale", 0.9, &checkpoint, at(13))
        .await?);

    assert!(
        repo.schedule_retry("ws_1", &task.id, &lease.claim_token, 1, at(400), at(14))
            .await?
    );
    let pending = repo.get("ws_1", &task.id).await?.unwrap();
    assert_eq!(pending.status, TaskStatus::Pending);
    assert_eq!(pending.progress, 0.4);
    assert_eq!(pending.state, checkpoint);

    let query = DueTaskQuery {
        now: at(399),
        abandoned_before: at(399) - Duration::seconds(30),
        limit: 10,
    };
    assert!(repo.list_due(&query).await?.is_empty());

    let lease = claim(&repo, "ws_1", &task.id, at(400)).await?.unwrap();
    assert!(
        repo.mark_completed("ws_1", &task.id, &lease.claim_token, &checkpoint, at(401))
            .await?
    );
    let completed = repo.get("ws_1", &task.id).await?.unwrap();
    assert_eq!(completed.status, TaskStatus::Completed);
    assert_eq!(completed.completed_at, Some(at(401)));
    Ok(())
}

#[tokio::test]
#[ignore = "需要 Docker"]
async fn test_postgres_abandoned_reclaim() -> Result<()> {
    let container = DatabaseTestContainer::new().await?;
    let repo = PostgresTaskRepository::connect(&container.database_url, 5).await?;

    let mut task = Task::new("ws_1", task_types::BUILD_SEGMENT);
    task.created_at = at(0);
    repo.create(&task).await?;

    claim(&repo, "ws_1", &task.id, at(10)).await?.unwrap();
    claim(&repo, "ws_1", &task.id, at(100)).await?.unwrap();
    assert_eq!(repo.get("ws_1", &task.id).await?.unwrap().retry_count, 1);
    Ok(())
}

#[tokio::test]
#[ignore = "需要 Docker"]
async fn test_postgres_release_and_unreadable_rows() -> Result<()> {
    let container = DatabaseTestContainer::new().await?;
    let repo = PostgresTaskRepository::connect(&container.database_url, 5).await?;

    let mut unreadable = Task::new("ws_1", task_types::BUILD_SEGMENT);
    unreadable.created_at = at(0);
    repo.create(&unreadable).await?;
    sqlx::query("UPDATE tasks SET state = $1::jsonb WHERE id = $2")
        .bind(r#"{"type":"future_kind","payload":{}}"#)
        .bind(&unreadable.id)
        .execute(repo.pool())
        .await?;

    let mut task = Task::new("ws_1", task_types::BUILD_SEGMENT).with_retry_policy(0, 60);
    task.created_at = at(1);
    repo.create(&task).await?;

    let query = DueTaskQuery {
        now: at(10),
        abandoned_before: at(10) - Duration::seconds(30),
        limit: 1,
    };
    let due = repo.list_due(&query).await?;
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, task.id);

    let lease = claim(&repo, "ws_1", &task.id, at(10)).await?.unwrap();
    assert!(
        repo.release_claim("ws_1", &task.id, &lease.claim_token, TaskStatus::Pending, at(11))
            .await?
    );
    let released = repo.get("ws_1", &task.id).await?.unwrap();
    assert_eq!(released.status, TaskStatus::Pending);
    assert_eq!(released.retry_count, 0);
    assert_eq!(released.claim_token, None);
    assert_eq!(released.updated_at, at(11));
    Ok(())
}
