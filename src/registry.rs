//! 进程运行时状态表
//!
//! [`ProcessRegistry`] 持有三张按进程划分的表，由 [`crate::ComputeUnit`] 创建，
//! 同时注入 updater 和 resolver：
//!
//! | 表 | 内容 |
//! |----|------|
//! | checkpoints | 最新 checkpoint（nonce、时间戳、消息 id、该消息的结果） |
//! | locks | 每进程一把 FIFO 互斥锁，resolver 用它串行化同一进程的请求 |
//! | registrations | 后台更新循环的注册状态与取消令牌 |
//!
//! checkpoint 只通过 [`ProcessRegistry::advance`] 前进（比较后前进，不会回退），
//! 只有缓存一致性故障才会经由 [`ProcessRegistry::reset`] 清空。

use crate::types::EvaluationResult;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{OwnedMutexGuard, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 某进程当前的 checkpoint
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    /// 折叠进快照的最后一条消息的 nonce（规范键）
    pub nonce: u64,
    pub timestamp: u64,
    pub message_id: String,
    /// 该消息的执行结果，供 exact replay 原样返回
    pub result: EvaluationResult,
}

/// [`ProcessRegistry::advance`] 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// 已前进；`previous` 为被取代的 checkpoint
    Advanced { previous: Option<u64> },
    /// 已有不小于新值的 checkpoint，未修改
    Stale { current: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Unregistered,
    Registering,
    Active,
}

/// [`ProcessRegistry::begin_registration`] 的结果
pub enum Registration {
    /// 本调用者负责完成注册
    Started(CancellationToken),
    /// 另一调用者正在注册，等待其完成
    InProgress(watch::Receiver<bool>),
    AlreadyActive,
}

struct RegistrationEntry {
    state: ProcessState,
    cancel: CancellationToken,
    ready: watch::Sender<bool>,
}

pub struct ProcessRegistry {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    registrations: Mutex<HashMap<String, RegistrationEntry>>,
    root: CancellationToken,
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self {
            checkpoints: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            registrations: Mutex::new(HashMap::new()),
            root: CancellationToken::new(),
        }
    }

    // ── checkpoints ──────────────────────────────────────────────────────────

    pub fn checkpoint(&self, process_id: &str) -> Option<Checkpoint> {
        self.checkpoints
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(process_id)
            .cloned()
    }

    /// 仅当新 checkpoint 严格大于当前值时前进
    pub fn advance(&self, process_id: &str, checkpoint: Checkpoint) -> Advance {
        let mut map = self.checkpoints.write().unwrap_or_else(|p| p.into_inner());
        let previous = map.get(process_id).map(|c| c.nonce);
        if let Some(current) = previous
            && current >= checkpoint.nonce
        {
            debug!(process_id = %process_id, current, proposed = checkpoint.nonce, "checkpoint 已被超越，忽略");
            return Advance::Stale { current };
        }
        debug!(process_id = %process_id, from = ?previous, to = checkpoint.nonce, "🔖 checkpoint 前进");
        map.insert(process_id.to_string(), checkpoint);
        Advance::Advanced { previous }
    }

    /// 缓存一致性故障时清空 checkpoint；仅当当前值仍是 `expected` 时生效
    pub fn reset(&self, process_id: &str, expected: u64) -> bool {
        let mut map = self.checkpoints.write().unwrap_or_else(|p| p.into_inner());
        if map.get(process_id).is_some_and(|c| c.nonce == expected) {
            map.remove(process_id);
            warn!(process_id = %process_id, nonce = expected, "checkpoint 已重置，将从创世重放");
            true
        } else {
            false
        }
    }

    // ── locks ────────────────────────────────────────────────────────────────

    /// 获取进程锁；同一进程的等待者按到达顺序排队
    pub async fn lock(&self, process_id: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(process_id.to_string())
            .or_default()
            .clone();
        if mutex.try_lock().is_err() {
            debug!(process_id = %process_id, "进程锁被占用，排队等待");
        }
        mutex.lock_owned().await
    }

    /// 只移除该进程的锁表项，且仅当无人持有、无人等待时；返回是否移除
    pub fn release_lock(&self, process_id: &str) -> bool {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        if locks.get(process_id).is_some_and(|m| Arc::strong_count(m) == 1) {
            locks.remove(process_id);
            return true;
        }
        false
    }

    pub fn lock_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    // ── registrations ────────────────────────────────────────────────────────

    pub fn state(&self, process_id: &str) -> ProcessState {
        self.registrations
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(process_id)
            .map(|r| r.state)
            .unwrap_or(ProcessState::Unregistered)
    }

    pub fn begin_registration(&self, process_id: &str) -> Registration {
        let mut regs = self.registrations.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = regs.get(process_id) {
            return match entry.state {
                ProcessState::Active => Registration::AlreadyActive,
                _ => Registration::InProgress(entry.ready.subscribe()),
            };
        }
        let cancel = self.root.child_token();
        let (ready, _) = watch::channel(false);
        regs.insert(
            process_id.to_string(),
            RegistrationEntry {
                state: ProcessState::Registering,
                cancel: cancel.clone(),
                ready,
            },
        );
        Registration::Started(cancel)
    }

    /// Registering → Active，唤醒等待者
    pub fn activate(&self, process_id: &str) {
        let mut regs = self.registrations.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = regs.get_mut(process_id) {
            entry.state = ProcessState::Active;
            let _ = entry.ready.send(true);
            info!(process_id = %process_id, "✅ 进程已激活");
        }
    }

    /// 首轮更新失败：回到 Unregistered，等待者收到通道关闭
    pub fn abort_registration(&self, process_id: &str) {
        let mut regs = self.registrations.lock().unwrap_or_else(|p| p.into_inner());
        if regs
            .get(process_id)
            .is_some_and(|r| r.state == ProcessState::Registering)
        {
            regs.remove(process_id);
        }
    }

    /// 取消后台循环并清理该进程的锁与 checkpoint；未注册时返回 `false`
    pub fn unregister(&self, process_id: &str) -> bool {
        let entry = self
            .registrations
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(process_id);
        let Some(entry) = entry else {
            return false;
        };
        entry.cancel.cancel();
        self.checkpoints
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(process_id);
        self.release_lock(process_id);
        info!(process_id = %process_id, "进程已注销");
        true
    }

    pub fn registered(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .registrations
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// 取消所有后台循环并清空全部表
    pub fn shutdown(&self) {
        self.root.cancel();
        self.registrations
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        self.checkpoints
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cp(nonce: u64) -> Checkpoint {
        Checkpoint {
            nonce,
            timestamp: nonce * 1000,
            message_id: format!("m{}", nonce),
            result: EvaluationResult::empty(),
        }
    }

    #[test]
    fn test_advance_is_monotonic() {
        let reg = ProcessRegistry::new();
        assert_eq!(reg.advance("p", cp(3)), Advance::Advanced { previous: None });
        assert_eq!(reg.advance("p", cp(5)), Advance::Advanced { previous: Some(3) });
        assert_eq!(reg.advance("p", cp(4)), Advance::Stale { current: 5 });
        assert_eq!(reg.advance("p", cp(5)), Advance::Stale { current: 5 });
        assert_eq!(reg.checkpoint("p").unwrap().nonce, 5);
    }

    #[test]
    fn test_reset_requires_expected_nonce() {
        let reg = ProcessRegistry::new();
        reg.advance("p", cp(5));
        assert!(!reg.reset("p", 4));
        assert!(reg.reset("p", 5));
        assert!(reg.checkpoint("p").is_none());
    }

    #[tokio::test]
    async fn test_lock_serializes_same_process_only() {
        let reg = Arc::new(ProcessRegistry::new());
        let guard = reg.lock("a").await;

        // 不同进程不受影响
        tokio::time::timeout(Duration::from_millis(100), reg.lock("b"))
            .await
            .expect("不同进程的锁应该互不阻塞");

        // 同一进程需要等待
        assert!(
            tokio::time::timeout(Duration::from_millis(50), reg.lock("a"))
                .await
                .is_err()
        );
        drop(guard);
        tokio::time::timeout(Duration::from_millis(100), reg.lock("a"))
            .await
            .expect("释放后应该能拿到锁");
    }

    #[tokio::test]
    async fn test_release_lock_only_touches_idle_entry() {
        let reg = ProcessRegistry::new();
        let held = reg.lock("a").await;
        drop(reg.lock("b").await);
        drop(reg.lock("c").await);
        assert_eq!(reg.lock_count(), 3);

        assert!(!reg.release_lock("a"));
        assert!(reg.release_lock("b"));
        // 其他空闲进程的表项不受影响
        assert_eq!(reg.lock_count(), 2);
        assert!(!reg.release_lock("b"));

        drop(held);
        assert!(reg.release_lock("a"));
        assert_eq!(reg.lock_count(), 1);
    }

    #[test]
    fn test_registration_state_machine() {
        let reg = ProcessRegistry::new();
        assert_eq!(reg.state("p"), ProcessState::Unregistered);

        let token = match reg.begin_registration("p") {
            Registration::Started(t) => t,
            _ => panic!("首次注册应该由调用者负责"),
        };
        assert_eq!(reg.state("p"), ProcessState::Registering);
        assert!(matches!(reg.begin_registration("p"), Registration::InProgress(_)));

        reg.activate("p");
        assert_eq!(reg.state("p"), ProcessState::Active);
        assert!(matches!(reg.begin_registration("p"), Registration::AlreadyActive));

        reg.advance("p", cp(1));
        assert!(reg.unregister("p"));
        assert!(token.is_cancelled());
        assert!(reg.checkpoint("p").is_none());
        assert_eq!(reg.state("p"), ProcessState::Unregistered);
        assert!(!reg.unregister("p"));
    }

    #[tokio::test]
    async fn test_waiter_sees_activation_or_abort() {
        let reg = ProcessRegistry::new();
        let _ = reg.begin_registration("p");
        let Registration::InProgress(mut rx) = reg.begin_registration("p") else {
            panic!("应该处于注册中");
        };
        reg.activate("p");
        assert!(rx.wait_for(|ready| *ready).await.is_ok());

        let _ = reg.begin_registration("q");
        let Registration::InProgress(mut rx) = reg.begin_registration("q") else {
            panic!("应该处于注册中");
        };
        reg.abort_registration("q");
        assert!(rx.wait_for(|ready| *ready).await.is_err());
        assert_eq!(reg.state("q"), ProcessState::Unregistered);
    }

    #[test]
    fn test_shutdown_cancels_everything() {
        let reg = ProcessRegistry::new();
        let Registration::Started(token) = reg.begin_registration("p") else {
            panic!();
        };
        reg.activate("p");
        reg.shutdown();
        assert!(token.is_cancelled());
        assert!(reg.registered().is_empty());
    }
}
