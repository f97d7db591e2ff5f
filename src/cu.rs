//! 计算单元服务对象
//!
//! [`ComputeUnit`] 拥有全部缓存与运行时状态，构造时创建，[`ComputeUnit::shutdown`]
//! 时清理，没有全局变量：
//!
//! ```text
//! ComputeUnit
//!  ├── ProcessUpdater ─┐
//!  └── ResultResolver ─┴─▶ Pipeline
//!                           ├── ArtifactStore       (进程定义 / 模块)
//!                           ├── MessageLogStore     (消息日志)
//!                           ├── MemorySnapshotStore (checkpoint 快照)
//!                           ├── Evaluator           (执行引擎)
//!                           ├── ProcessRegistry     (checkpoint / 锁 / 注册)
//!                           ├── ResultStore         (持久化结果)
//!                           └── Broadcaster         (结果推送)
//! ```
//!
//! # 示例
//!
//! ```rust,no_run
//! use echo_cu::{ComputeUnit, CuConfig};
//! use echo_cu::engine::RemoteEngine;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> echo_cu::error::Result<()> {
//! let config = CuConfig::from_env()?;
//! let engine = Arc::new(RemoteEngine::from_config(&config)?);
//! let cu = ComputeUnit::builder(config).engine(engine).build().await?;
//!
//! cu.register("IN3T2l6QERA6d65XGW5asx2JWX7VrOQ3HIbwQvKVBQo").await?;
//! cu.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::artifact::ArtifactStore;
use crate::broadcast::{Broadcaster, LoggingBroadcaster, WebSocketBroadcaster};
use crate::config::CuConfig;
use crate::error::{ConfigError, Result};
use crate::eval::{Evaluator, ExecutionEngine};
use crate::log::MessageLogStore;
use crate::pipeline::Pipeline;
use crate::registry::ProcessRegistry;
use crate::resolver::ResultResolver;
use crate::results::{FileResultStore, InMemoryResultStore, ResultStore};
use crate::snapshot::MemorySnapshotStore;
use crate::source::http::HttpSequencer;
use crate::source::{ArtifactSource, MessageSource};
use crate::types::EvaluationResult;
use crate::updater::{CycleOutcome, ProcessUpdater};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// 某进程的诊断信息
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessStats {
    pub process_id: String,
    pub checkpoint: Option<u64>,
    pub snapshots: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CuStats {
    pub processes: Vec<ProcessStats>,
    pub snapshots: usize,
    pub locks: usize,
}

pub struct ComputeUnit {
    pipeline: Arc<Pipeline>,
    updater: ProcessUpdater,
    resolver: ResultResolver,
}

impl ComputeUnit {
    pub fn builder(config: CuConfig) -> ComputeUnitBuilder {
        ComputeUnitBuilder::new(config)
    }

    /// 注册进程；返回时首轮更新已完成
    pub async fn register(&self, process_id: &str) -> Result<()> {
        self.updater.register(process_id).await
    }

    pub fn unregister(&self, process_id: &str) -> bool {
        self.updater.unregister(process_id)
    }

    /// 查询某条消息的执行结果
    pub async fn resolve(&self, process_id: &str, message_id: &str) -> Result<EvaluationResult> {
        self.resolver.resolve(process_id, message_id).await
    }

    pub fn resolver(&self) -> &ResultResolver {
        &self.resolver
    }

    /// 立即执行一轮更新（不等冷却）
    pub async fn update_now(&self, process_id: &str) -> Result<CycleOutcome> {
        self.updater.run_cycle(process_id).await
    }

    pub fn stats(&self) -> CuStats {
        let registry = &self.pipeline.registry;
        let processes = registry
            .registered()
            .into_iter()
            .map(|process_id| ProcessStats {
                checkpoint: registry.checkpoint(&process_id).map(|c| c.nonce),
                snapshots: self.pipeline.snapshots.checkpoints(&process_id),
                process_id,
            })
            .collect();
        CuStats {
            processes,
            snapshots: self.pipeline.snapshots.len(),
            locks: registry.lock_count(),
        }
    }

    /// 取消所有后台循环，等待退出，清空全部缓存
    pub async fn shutdown(&self) {
        info!("⏹️ 计算单元关闭中");
        self.pipeline.registry.shutdown();
        self.updater.shutdown().await;
        self.pipeline.snapshots.shutdown().await;
        info!("计算单元已关闭");
    }
}

// ── Builder ───────────────────────────────────────────────────────────────────

/// 未指定的协作方按配置创建：数据源用 [`HttpSequencer`]，结果库按
/// `results_path` 选择文件或内存，广播按 `broadcast_port` 选择 WebSocket 或日志。
/// 执行引擎必须显式提供。
pub struct ComputeUnitBuilder {
    config: CuConfig,
    messages: Option<Arc<dyn MessageSource>>,
    artifacts: Option<Arc<dyn ArtifactSource>>,
    engine: Option<Arc<dyn ExecutionEngine>>,
    results: Option<Arc<dyn ResultStore>>,
    broadcaster: Option<Arc<dyn Broadcaster>>,
}

impl ComputeUnitBuilder {
    pub fn new(config: CuConfig) -> Self {
        Self {
            config,
            messages: None,
            artifacts: None,
            engine: None,
            results: None,
            broadcaster: None,
        }
    }

    /// 同一个对象同时作为消息源与制品源
    pub fn source<S>(mut self, source: Arc<S>) -> Self
    where
        S: MessageSource + ArtifactSource + 'static,
    {
        let messages: Arc<dyn MessageSource> = source.clone();
        let artifacts: Arc<dyn ArtifactSource> = source;
        self.messages = Some(messages);
        self.artifacts = Some(artifacts);
        self
    }

    pub fn message_source(mut self, source: Arc<dyn MessageSource>) -> Self {
        self.messages = Some(source);
        self
    }

    pub fn artifact_source(mut self, source: Arc<dyn ArtifactSource>) -> Self {
        self.artifacts = Some(source);
        self
    }

    pub fn engine(mut self, engine: Arc<dyn ExecutionEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn result_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.results = Some(store);
        self
    }

    pub fn broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub async fn build(self) -> Result<ComputeUnit> {
        let config = self.config;
        let engine = self.engine.ok_or_else(|| ConfigError::InvalidValue {
            field: "engine".to_string(),
            message: "an execution engine is required".to_string(),
        })?;

        let (messages, artifacts) = match (self.messages, self.artifacts) {
            (Some(m), Some(a)) => (m, a),
            (m, a) => {
                let http = Arc::new(HttpSequencer::from_config(&config)?);
                let default_messages: Arc<dyn MessageSource> = http.clone();
                let default_artifacts: Arc<dyn ArtifactSource> = http;
                (
                    m.unwrap_or(default_messages),
                    a.unwrap_or(default_artifacts),
                )
            }
        };

        let results: Arc<dyn ResultStore> = match (self.results, &config.results_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(FileResultStore::new(path)?),
            (None, None) => Arc::new(InMemoryResultStore::new()),
        };

        let broadcaster: Arc<dyn Broadcaster> = match (self.broadcaster, config.broadcast_port) {
            (Some(b), _) => b,
            (None, Some(port)) => Arc::new(WebSocketBroadcaster::bind(port).await?),
            (None, None) => Arc::new(LoggingBroadcaster),
        };

        let pipeline = Arc::new(Pipeline {
            artifacts: ArtifactStore::new(artifacts)
                .with_allowed_owners(config.allowed_owners.clone()),
            log: MessageLogStore::new(messages),
            snapshots: MemorySnapshotStore::new(),
            evaluator: Evaluator::new(engine).with_policy(config.failure_policy),
            registry: ProcessRegistry::new(),
            results,
            broadcaster,
            eviction_grace: config.eviction_grace(),
        });

        info!(
            su_url = %config.su_url,
            cooldown_ms = config.cooldown_ms,
            eviction_grace_ms = config.eviction_grace_ms,
            failure_policy = ?config.failure_policy,
            "🚀 计算单元已启动"
        );
        Ok(ComputeUnit {
            updater: ProcessUpdater::new(pipeline.clone(), config.cooldown()),
            resolver: ResultResolver::new(pipeline.clone()),
            pipeline,
        })
    }
}
