//! 持久化结果库（二级缓存）
//!
//! 每条消息的执行结果按 `process_id / message_id` 存一份。live 缓存只保留最新
//! checkpoint，resolver 的 "already past" 分支靠这里找回已经被取代的结果。
//!
//! ## 内置实现
//!
//! - [`InMemoryResultStore`]：进程内存，适合测试
//! - [`FileResultStore`]：JSON 文件持久化
//!
//! 写入失败由调用方记录日志后吞掉，不会传播给 resolver 的调用者。

use crate::error::{CuError, Result};
use crate::types::EvaluationResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

// ── StoredResult ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    pub process_id: String,
    pub message_id: String,
    pub nonce: u64,
    pub timestamp: u64,
    pub result: EvaluationResult,
    /// 写入时间（Unix 秒）
    pub stored_at: u64,
}

impl StoredResult {
    pub fn new(
        process_id: &str,
        message_id: &str,
        result: EvaluationResult,
        nonce: u64,
        timestamp: u64,
    ) -> Self {
        Self {
            process_id: process_id.to_string(),
            message_id: message_id.to_string(),
            nonce,
            timestamp,
            result,
            stored_at: now_secs(),
        }
    }
}

// ── ResultStore trait ─────────────────────────────────────────────────────────

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// 写入或覆盖一条结果（upsert）
    async fn put(&self, record: StoredResult) -> Result<()>;

    /// 按消息 id 精确获取
    async fn get_by_message_id(
        &self,
        process_id: &str,
        message_id: &str,
    ) -> Result<Option<StoredResult>>;

    /// 批量写入；默认逐条调用 [`put`](ResultStore::put)
    async fn put_batch(&self, records: Vec<StoredResult>) -> Result<()> {
        for record in records {
            self.put(record).await?;
        }
        Ok(())
    }
}

type Table = HashMap<String, HashMap<String, StoredResult>>;

// ── InMemoryResultStore ──────────────────────────────────────────────────────

pub struct InMemoryResultStore {
    /// process_id → message_id → record
    data: RwLock<Table>,
}

impl Default for InMemoryResultStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.values().map(|b| b.len()).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn put(&self, record: StoredResult) -> Result<()> {
        self.data
            .write()
            .await
            .entry(record.process_id.clone())
            .or_default()
            .insert(record.message_id.clone(), record);
        Ok(())
    }

    async fn get_by_message_id(
        &self,
        process_id: &str,
        message_id: &str,
    ) -> Result<Option<StoredResult>> {
        Ok(self
            .data
            .read()
            .await
            .get(process_id)
            .and_then(|b| b.get(message_id))
            .cloned())
    }
}

// ── FileResultStore ───────────────────────────────────────────────────────────

/// 基于 JSON 文件的持久化结果库
///
/// 写时立即落盘，读时从内存返回。存储格式：
/// ```json
/// {
///   "<process_id>": {
///     "<message_id>": { "process_id": "...", "message_id": "...", "nonce": 3, "timestamp": 1700, "result": {...}, "stored_at": 123 }
///   }
/// }
/// ```
pub struct FileResultStore {
    path: PathBuf,
    data: RwLock<Table>,
}

impl FileResultStore {
    /// 打开或创建结果文件，自动建父目录
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = expand_tilde(path.as_ref());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data: Table = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("结果文件解析失败，从空状态开始: {e}");
                HashMap::new()
            })
        } else {
            HashMap::new()
        };
        let processes = data.len();
        let results: usize = data.values().map(|b| b.len()).sum();
        info!(path = %path.display(), processes, results, "🗄️ FileResultStore 初始化");
        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    async fn flush(&self) -> Result<()> {
        let json = {
            let data = self.data.read().await;
            serde_json::to_string(&*data)?
        };
        tokio::fs::write(&self.path, json)
            .await
            .map_err(CuError::Io)?;
        debug!(path = %self.path.display(), "💾 结果已持久化");
        Ok(())
    }
}

#[async_trait]
impl ResultStore for FileResultStore {
    async fn put(&self, record: StoredResult) -> Result<()> {
        self.put_batch(vec![record]).await
    }

    async fn get_by_message_id(
        &self,
        process_id: &str,
        message_id: &str,
    ) -> Result<Option<StoredResult>> {
        Ok(self
            .data
            .read()
            .await
            .get(process_id)
            .and_then(|b| b.get(message_id))
            .cloned())
    }

    async fn put_batch(&self, records: Vec<StoredResult>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        {
            let mut data = self.data.write().await;
            for record in records {
                data.entry(record.process_id.clone())
                    .or_default()
                    .insert(record.message_id.clone(), record);
            }
        }
        self.flush().await
    }
}

// ── 私有工具函数 ──────────────────────────────────────────────────────────────

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if s.starts_with("~/")
        && let Some(home) = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())
    {
        return PathBuf::from(home).join(&s[2..]);
    }
    path.to_path_buf()
}
