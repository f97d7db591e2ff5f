//! echo-cu —— 本地计算单元
//!
//! ```bash
//! # 注册进程并持续更新，Ctrl-C 退出
//! echo-cu watch <process_id> [<process_id>...]
//!
//! # 查询某条消息的执行结果
//! echo-cu resolve <process_id> <message_id>
//! ```
//!
//! 配置见 `CuConfig`：`--config` 指定 YAML 文件，环境变量（含 `.env`）覆盖文件值。

use clap::{Parser, Subcommand};
use echo_cu::engine::RemoteEngine;
use echo_cu::{ComputeUnit, CuConfig};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "echo-cu", version, about = "本地计算单元：增量 checkpoint 的进程结果缓存")]
struct Cli {
    /// YAML 配置文件
    #[arg(long, env = "CU_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 注册进程并在后台持续更新，直到 Ctrl-C
    Watch {
        #[arg(required = true)]
        process_ids: Vec<String>,
    },
    /// 查询消息的执行结果并以 JSON 输出
    Resolve {
        process_id: String,
        message_id: String,
    },
}

#[tokio::main]
async fn main() -> echo_cu::error::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "echo_cu=info".into()))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => CuConfig::load(path)?.with_env()?,
        None => CuConfig::from_env()?,
    };
    let engine = Arc::new(RemoteEngine::from_config(&config)?);
    let cu = ComputeUnit::builder(config).engine(engine).build().await?;

    let outcome = match cli.command {
        Command::Watch { process_ids } => watch(&cu, &process_ids).await,
        Command::Resolve {
            process_id,
            message_id,
        } => resolve(&cu, &process_id, &message_id).await,
    };

    cu.shutdown().await;
    outcome
}

async fn watch(cu: &ComputeUnit, process_ids: &[String]) -> echo_cu::error::Result<()> {
    for process_id in process_ids {
        if let Err(e) = cu.register(process_id).await {
            error!(process_id = %process_id, error = %e, "❌ 注册失败");
        }
    }
    for p in cu.stats().processes {
        info!(process_id = %p.process_id, checkpoint = ?p.checkpoint, "已注册");
    }

    tokio::signal::ctrl_c().await?;
    info!("收到 Ctrl-C，准备退出");
    Ok(())
}

async fn resolve(cu: &ComputeUnit, process_id: &str, message_id: &str) -> echo_cu::error::Result<()> {
    let result = cu.resolve(process_id, message_id).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
