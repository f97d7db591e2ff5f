//! 测试基础设施
//!
//! 提供在不依赖真实调度器 / 执行引擎的情况下测试计算单元各组件的工具集。
//!
//! | 类型 | 用途 |
//! |------|------|
//! | [`MockSource`] | 替代远端调度器与网关，同时实现 `MessageSource` 和 `ArtifactSource` |
//! | [`FoldEngine`] | 确定性的执行引擎：内存 = 之前的内存 + 消息数据 |
//! | [`RecordingBroadcaster`] | 记录所有推送的结果 |
//! | [`SlowResultStore`] | 批量写入前人为延迟的结果库 |
//!
//! # 设计原则
//!
//! - **零网络请求**：所有 Mock 都完全在内存中运行
//! - **可脚本化**：通过 `with_*()` / `fail_next_*()` 控制行为
//! - **可观测**：通过 `*_fetches()` / `handle_calls()` 等方法检查调用情况
//!
//! # 使用示例
//!
//! ```rust
//! use echo_cu::testing::{FoldEngine, MockSource};
//! use echo_cu::{ComputeUnit, CuConfig};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> echo_cu::error::Result<()> {
//! let source = Arc::new(MockSource::new().with_process("proc", "owner", "mod"));
//! source.push_message("proc", "hello");
//!
//! let cu = ComputeUnit::builder(CuConfig::default())
//!     .source(source.clone())
//!     .engine(Arc::new(FoldEngine::new()))
//!     .build()
//!     .await?;
//!
//! let result = cu.resolve("proc", "proc-1").await?;
//! assert!(!result.is_error());
//! cu.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod fold_engine;
mod mock_source;

pub use fold_engine::FoldEngine;
pub use mock_source::MockSource;

use crate::broadcast::{Broadcaster, ResultAnnouncement};
use crate::error::Result;
use crate::results::{ResultStore, StoredResult};
use crate::types::{Environment, Message, ModuleEnv, ProcessEnv, Tag};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 测试消息的时间戳起点；第 n 条消息的时间戳为 `BASE_TIMESTAMP + n * 1000`
pub const BASE_TIMESTAMP: u64 = 1_700_000_000_000;

pub fn timestamp_for(nonce: u64) -> u64 {
    BASE_TIMESTAMP + nonce * 1000
}

/// 与 [`MockSource`] 生成的消息同形的测试消息（id 为 `"{pid}-{nonce}"`）
pub fn test_message(process_id: &str, nonce: u64, data: &str) -> Message {
    Message {
        id: format!("{process_id}-{nonce}"),
        signature: None,
        owner: "owner".to_string(),
        target: process_id.to_string(),
        tags: vec![Tag::new("Action", "Eval")],
        data: Some(data.to_string()),
        from: process_id.to_string(),
        forwarded_by: Some("owner".to_string()),
        nonce,
        timestamp: timestamp_for(nonce),
        block_height: 1000 + nonce,
        epoch: 0,
        hash_chain: None,
        cron: false,
        read_only: false,
    }
}

pub fn test_environment(process_id: &str) -> Environment {
    Environment {
        process: ProcessEnv {
            id: process_id.to_string(),
            owner: "owner".to_string(),
            tags: vec![Tag::new("Module", "mod")],
        },
        module: ModuleEnv {
            id: "mod".to_string(),
        },
    }
}

/// 记录所有推送的广播器
#[derive(Default)]
pub struct RecordingBroadcaster {
    published: Arc<Mutex<Vec<ResultAnnouncement>>>,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按推送顺序返回全部记录
    pub fn published(&self) -> Vec<ResultAnnouncement> {
        self.published.lock().unwrap().clone()
    }

    /// 某进程已推送过的 nonce（按推送顺序）
    pub fn nonces(&self, process_id: &str) -> Vec<u64> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.process_id == process_id)
            .map(|a| a.nonce)
            .collect()
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn publish(&self, announcement: ResultAnnouncement) {
        self.published.lock().unwrap().push(announcement);
    }
}

/// 每次 `put_batch` 先睡 `delay` 再写入内层结果库，用来拉长持久化窗口
pub struct SlowResultStore {
    inner: Arc<dyn ResultStore>,
    delay: Duration,
}

impl SlowResultStore {
    pub fn new(inner: Arc<dyn ResultStore>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl ResultStore for SlowResultStore {
    async fn put(&self, record: StoredResult) -> Result<()> {
        self.inner.put(record).await
    }

    async fn get_by_message_id(
        &self,
        process_id: &str,
        message_id: &str,
    ) -> Result<Option<StoredResult>> {
        self.inner.get_by_message_id(process_id, message_id).await
    }

    async fn put_batch(&self, records: Vec<StoredResult>) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.put_batch(records).await
    }
}
