use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::str::FromStr;
use taskengine_core::config::DatabaseConfig;
use taskengine_core::{SchedulerError, SchedulerResult};
use taskengine_domain::TaskRepository;
use tracing::info;

use super::postgres::PostgresTaskRepository;
use super::sqlite::SqliteTaskRepository;

/// 由连接串前缀判断数据库类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseType {
    PostgreSQL,
    SQLite,
}

impl DatabaseType {
    pub fn from_url(url: &str) -> SchedulerResult<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(DatabaseType::PostgreSQL)
        } else if url.starts_with("sqlite:") {
            Ok(DatabaseType::SQLite)
        } else {
            Err(SchedulerError::config_error(format!(
                "不支持的数据库URL: {url}"
            )))
        }
    }
}

pub enum DatabasePool {
    PostgreSQL(sqlx::PgPool),
    SQLite(sqlx::SqlitePool),
}

impl DatabasePool {
    pub async fn connect(config: &DatabaseConfig) -> SchedulerResult<Self> {
        let acquire_timeout = Duration::from_secs(config.connection_timeout_seconds);
        let idle_timeout = Duration::from_secs(config.idle_timeout_seconds);

        match DatabaseType::from_url(&config.url)? {
            DatabaseType::PostgreSQL => {
                let pool = PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .min_connections(config.min_connections)
                    .acquire_timeout(acquire_timeout)
                    .idle_timeout(idle_timeout)
                    .connect(&config.url)
                    .await?;
                Ok(DatabasePool::PostgreSQL(pool))
            }
            DatabaseType::SQLite => {
                let options = SqliteConnectOptions::from_str(&config.url)?
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .busy_timeout(acquire_timeout);
                let pool = SqlitePoolOptions::new()
                    .max_connections(config.max_connections)
                    .min_connections(config.min_connections)
                    .acquire_timeout(acquire_timeout)
                    .idle_timeout(idle_timeout)
                    .connect_with(options)
                    .await?;
                Ok(DatabasePool::SQLite(pool))
            }
        }
    }

    pub fn database_type(&self) -> DatabaseType {
        match self {
            DatabasePool::PostgreSQL(_) => DatabaseType::PostgreSQL,
            DatabasePool::SQLite(_) => DatabaseType::SQLite,
        }
    }
}

/// 单个任务库的连接池与仓储工厂
pub struct DatabaseManager {
    pool: DatabasePool,
}

impl DatabaseManager {
    pub async fn connect(config: &DatabaseConfig) -> SchedulerResult<Self> {
        let pool = DatabasePool::connect(config).await?;
        info!(database_type = ?pool.database_type(), "数据库连接池已建立");
        Ok(Self { pool })
    }

    pub fn database_type(&self) -> DatabaseType {
        self.pool.database_type()
    }

    pub async fn migrate(&self) -> SchedulerResult<()> {
        match &self.pool {
            DatabasePool::PostgreSQL(pool) => PostgresTaskRepository::run_migrations(pool).await,
            DatabasePool::SQLite(pool) => SqliteTaskRepository::run_migrations(pool).await,
        }
    }

    pub async fn health_check(&self) -> SchedulerResult<()> {
        match &self.pool {
            DatabasePool::PostgreSQL(pool) => {
                sqlx::query("SELECT 1").execute(pool).await?;
            }
            DatabasePool::SQLite(pool) => {
                sqlx::query("SELECT 1").execute(pool).await?;
            }
        }
        Ok(())
    }

    pub async fn close(&self) {
        match &self.pool {
            DatabasePool::PostgreSQL(pool) => pool.close().await,
            DatabasePool::SQLite(pool) => pool.close().await,
        }
    }

    pub fn task_repository(&self) -> Arc<dyn TaskRepository> {
        match &self.pool {
            DatabasePool::PostgreSQL(pool) => Arc::new(PostgresTaskRepository::new(pool.clone())),
            DatabasePool::SQLite(pool) => Arc::new(SqliteTaskRepository::new(pool.clone())),
        }
    }
}
