//! 确定性的测试执行引擎。
//!
//! 新内存 = 旧内存 + 消息数据 + `;`。数据为 `"FAIL"` 的消息总是失败，
//! 因此任意消息序列的最终内存都可以直接手算。
//!
//! # 示例
//!
//! ```rust
//! use echo_cu::testing::{FoldEngine, test_environment, test_message};
//! use echo_cu::eval::Evaluator;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let evaluator = Evaluator::new(Arc::new(FoldEngine::new()));
//! let msgs = vec![test_message("p", 1, "a"), test_message("p", 2, "b")];
//! let eval = evaluator
//!     .evaluate("mod", b"", None, &msgs, &test_environment("p"))
//!     .await
//!     .unwrap();
//! assert_eq!(eval.memory.as_deref(), Some(&b"a;b;"[..]));
//! # }
//! ```

use crate::error::{CuError, Result};
use crate::eval::{ExecutionEngine, HandleResponse, ProcessHandle};
use crate::types::{Environment, Message};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
struct Counters {
    instantiations: AtomicUsize,
    handle_calls: AtomicUsize,
    /// 接下来 N 次 handle 返回引擎错误（与消息内容无关）
    transient_failures: AtomicUsize,
}

#[derive(Default)]
pub struct FoldEngine {
    counters: Arc<Counters>,
    delay: Duration,
}

impl FoldEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每次 handle 前的人为延迟，用来拉长求值窗口
    pub fn with_delay_ms(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }

    /// 接下来 `n` 次 handle 调用失败
    pub fn fail_next(&self, n: usize) {
        self.counters.transient_failures.store(n, Ordering::SeqCst);
    }

    pub fn handle_calls(&self) -> usize {
        self.counters.handle_calls.load(Ordering::SeqCst)
    }

    pub fn instantiations(&self) -> usize {
        self.counters.instantiations.load(Ordering::SeqCst)
    }

    /// 手算某段数据折叠后的内存
    pub fn expected_memory<'a>(data: impl IntoIterator<Item = &'a str>) -> Vec<u8> {
        let mut memory = Vec::new();
        for d in data {
            if d != "FAIL" {
                memory.extend_from_slice(d.as_bytes());
                memory.push(b';');
            }
        }
        memory
    }
}

#[async_trait]
impl ExecutionEngine for FoldEngine {
    async fn instantiate(&self, _module_id: &str, _bytecode: &[u8]) -> Result<Arc<dyn ProcessHandle>> {
        self.counters.instantiations.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FoldHandle {
            counters: self.counters.clone(),
            delay: self.delay,
        }))
    }
}

struct FoldHandle {
    counters: Arc<Counters>,
    delay: Duration,
}

#[async_trait]
impl ProcessHandle for FoldHandle {
    async fn handle(
        &self,
        memory: Option<&[u8]>,
        message: &Message,
        _env: &Environment,
    ) -> Result<HandleResponse> {
        self.counters.handle_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let transient = self
            .counters
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if transient {
            return Err(CuError::Other("engine unavailable".to_string()));
        }

        let data = message.data.as_deref().unwrap_or("");
        if data == "FAIL" {
            return Ok(HandleResponse {
                error: Some(format!("message {} rejected", message.nonce)),
                ..HandleResponse::default()
            });
        }

        let mut next = memory.map(<[u8]>::to_vec).unwrap_or_default();
        next.extend_from_slice(data.as_bytes());
        next.push(b';');
        Ok(HandleResponse {
            output: json!({ "nonce": message.nonce, "data": data, "size": next.len() }),
            memory: next,
            messages: vec![],
            spawns: vec![],
            assignments: vec![],
            error: None,
        })
    }
}
