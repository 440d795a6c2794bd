use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use tracing::info;

use taskengine::Application;
use taskengine_core::{init_logging, AppConfig};
use taskengine_domain::{Task, TaskState};

/// 任务引擎命令行工具
#[derive(Parser, Debug)]
#[command(name = "taskengine")]
#[command(version = "1.0.0")]
#[command(about = "持久化、可恢复的多租户任务执行引擎 - 运维工具")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 配置文件路径（缺省时按默认路径查找）
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// 日志级别
    #[arg(
        short,
        long,
        global = true,
        value_parser = ["trace", "debug", "info", "warn", "error"]
    )]
    log_level: Option<String>,

    /// 日志格式
    #[arg(long, global = true, value_parser = ["json", "pretty"])]
    log_format: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 创建或升级任务表
    Migrate,
    /// 创建一个任务
    Enqueue {
        /// 工作空间ID
        #[arg(short, long)]
        workspace: String,
        /// 任务类型
        #[arg(short = 't', long = "type")]
        task_type: String,
        /// 初始状态 (JSON格式，如 {"type":"send_broadcast","payload":{...}})
        #[arg(short, long)]
        state: Option<String>,
        /// 关联的群发ID
        #[arg(long)]
        broadcast_id: Option<String>,
        /// 单次执行的最长时间（秒）
        #[arg(long)]
        max_runtime: Option<i32>,
        /// 最大重试次数
        #[arg(long)]
        max_retries: Option<i32>,
        /// 重试间隔（秒）
        #[arg(long)]
        retry_interval: Option<i32>,
        /// 延迟执行（秒）
        #[arg(long)]
        delay: Option<i64>,
    },
    /// 查看任务详情
    Show {
        #[arg(short, long)]
        workspace: String,
        /// 任务ID
        id: String,
    },
    /// 列出到期任务（不认领）
    Due {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).with_context(|| {
        format!(
            "加载配置失败: {}",
            cli.config.as_deref().unwrap_or("<默认路径>")
        )
    })?;
    if let Some(level) = &cli.log_level {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.observability.log_format = format.clone();
    }
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    )?;

    let app = Application::connect(config).await?;
    let result = run_command(&app, cli.command).await;
    app.shutdown().await;
    result
}

async fn run_command(app: &Application, command: Commands) -> Result<()> {
    match command {
        Commands::Migrate => {
            // 连接时已执行迁移
            app.health_check().await?;
            info!("数据库迁移完成");
            println!("migrated");
        }
        Commands::Enqueue {
            workspace,
            task_type,
            state,
            broadcast_id,
            max_runtime,
            max_retries,
            retry_interval,
            delay,
        } => {
            let mut task = Task::new(workspace, task_type);
            if let Some(state) = state {
                let state: TaskState =
                    serde_json::from_str(&state).context("解析任务状态JSON失败")?;
                task = task.with_state(state);
            }
            if let Some(broadcast_id) = broadcast_id {
                task = task.with_broadcast_id(broadcast_id);
            }
            if let Some(seconds) = max_runtime {
                task = task.with_max_runtime(seconds);
            }
            task.max_retries = max_retries.unwrap_or(task.max_retries);
            task.retry_interval = retry_interval.unwrap_or(task.retry_interval);
            if let Some(seconds) = delay {
                task = task.scheduled_at(Utc::now() + Duration::seconds(seconds));
            }

            let created = app.enqueue(&task).await?;
            println!("{}", serde_json::to_string_pretty(&created)?);
        }
        Commands::Show { workspace, id } => match app.get_task(&workspace, &id).await? {
            Some(task) => println!("{}", serde_json::to_string_pretty(&task)?),
            None => anyhow::bail!("任务不存在: {workspace}/{id}"),
        },
        Commands::Due { limit } => {
            let tasks = app.due_tasks(limit).await?;
            for task in &tasks {
                println!(
                    "{}\t{}\t{}\t{}\t{:.2}\t{}",
                    task.workspace_id,
                    task.id,
                    task.task_type,
                    task.status,
                    task.progress,
                    task.due_at().to_rfc3339()
                );
            }
            info!("共 {} 个到期任务", tasks.len());
        }
    }
    Ok(())
}
