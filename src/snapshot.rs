//! 进程内存快照缓存
//!
//! 以 `(process_id, nonce)` 为键保存 checkpoint 处的内存。读方拿到的是共享
//! 的 [`Memory`]（`Arc<[u8]>`），淘汰只移除缓存里的引用，不会影响已经拿到
//! 缓冲区的读方。
//!
//! 淘汰是延迟的：[`MemorySnapshotStore::evict_after`] 在宽限期结束后才移除
//! 被取代的快照，让正在读取旧 checkpoint 的请求先读完。
//!
//! 未命中返回 `None`，这是调用方重新填充缓存的正常信号，不是错误。

use crate::types::Memory;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

type Key = (String, u64);

pub struct MemorySnapshotStore {
    snapshots: Arc<RwLock<HashMap<Key, Memory>>>,
    evictions: TaskTracker,
    shutdown: CancellationToken,
}

impl Default for MemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self {
            snapshots: Arc::new(RwLock::new(HashMap::new())),
            evictions: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn put(&self, process_id: &str, nonce: u64, memory: impl Into<Memory>) {
        let memory = memory.into();
        debug!(process_id = %process_id, nonce, size = memory.len(), "💾 写入内存快照");
        self.write()
            .insert((process_id.to_string(), nonce), memory);
    }

    pub fn get(&self, process_id: &str, nonce: u64) -> Option<Memory> {
        self.read()
            .get(&(process_id.to_string(), nonce))
            .cloned()
    }

    /// 宽限期结束后移除快照；`delay` 为零时立即移除
    pub fn evict_after(&self, process_id: &str, nonce: u64, delay: Duration) {
        let key = (process_id.to_string(), nonce);
        if delay.is_zero() {
            self.write().remove(&key);
            debug!(process_id = %process_id, nonce, "🗑️ 内存快照已淘汰");
            return;
        }

        // 只淘汰此刻的这份缓冲区；期间同键被重新写入的快照保留
        let Some(target) = self.read().get(&key).cloned() else {
            return;
        };
        let snapshots = self.snapshots.clone();
        let shutdown = self.shutdown.clone();
        self.evictions.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => {}
            }
            let mut map = snapshots.write().unwrap_or_else(|p| p.into_inner());
            if map.get(&key).is_some_and(|current| Arc::ptr_eq(current, &target)) {
                map.remove(&key);
                debug!(process_id = %key.0, nonce = key.1, "🗑️ 内存快照已淘汰");
            }
        });
    }

    /// 移除某进程的全部快照
    pub fn forget(&self, process_id: &str) {
        self.write().retain(|(pid, _), _| pid != process_id);
    }

    /// 当前缓存的 checkpoint（升序）
    pub fn checkpoints(&self, process_id: &str) -> Vec<u64> {
        let mut nonces: Vec<u64> = self
            .read()
            .keys()
            .filter(|(pid, _)| pid == process_id)
            .map(|(_, nonce)| *nonce)
            .collect();
        nonces.sort_unstable();
        nonces
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 立即执行所有待淘汰任务并等待完成，然后清空缓存
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.evictions.close();
        self.evictions.wait().await;
        self.write().clear();
        info!("内存快照缓存已关闭");
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Key, Memory>> {
        self.snapshots.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Key, Memory>> {
        self.snapshots.write().unwrap_or_else(|p| p.into_inner())
    }
}
