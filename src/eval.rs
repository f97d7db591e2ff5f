//! 确定性求值器
//!
//! 把一段有序消息依次喂给状态转移函数：
//!
//! ```text
//! memory₀ (None = genesis) ──msg₁──▶ memory₁ ──msg₂──▶ memory₂ … ──msgₙ──▶ final
//! ```
//!
//! 状态转移函数由外部执行引擎提供（[`ExecutionEngine`]），这里只负责折叠、
//! 失败策略与结果收集。相同输入必然得到逐字节相同的最终内存，缓存的正确性
//! 依赖这一点。
//!
//! ## 失败策略
//!
//! | 策略 | 行为 |
//! |------|------|
//! | [`FailurePolicy::Skip`]（默认） | 记录日志，该消息的结果带 `Error`，内存保持上一次成功后的状态，继续下一条 |
//! | [`FailurePolicy::Abort`] | 遇到第一条失败消息立即返回 [`EvaluationFault`] |
//!
//! 策略只作用于引擎报告的消息失败（[`HandleResponse::error`]）。`handle` 返回
//! `Err` 说明引擎本身不可用，任何策略下都终止整次求值，由调用方重试整段区间。

use crate::error::{CuError, EvaluationFault, Result};
use crate::types::{Environment, EvaluationResult, Memory, Message};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

// ── 执行引擎接口 ──────────────────────────────────────────────────────────────

/// 状态转移函数单次调用的完整输出
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HandleResponse {
    pub memory: Vec<u8>,
    pub output: Value,
    pub messages: Vec<Value>,
    pub spawns: Vec<Value>,
    pub assignments: Vec<Value>,
    /// 引擎报告这条消息执行失败，受 [`FailurePolicy`] 约束
    pub error: Option<String>,
}

/// 外部执行引擎：把模块字节码实例化为可调用的句柄
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn instantiate(&self, module_id: &str, bytecode: &[u8])
    -> Result<Arc<dyn ProcessHandle>>;
}

/// 已实例化的模块
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// `memory == None` 表示从创世状态开始
    async fn handle(
        &self,
        memory: Option<&[u8]>,
        message: &Message,
        env: &Environment,
    ) -> Result<HandleResponse>;
}

// ── FailurePolicy ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    #[default]
    Skip,
    Abort,
}

impl FromStr for FailurePolicy {
    type Err = CuError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(FailurePolicy::Skip),
            "abort" => Ok(FailurePolicy::Abort),
            other => Err(crate::error::ConfigError::InvalidValue {
                field: "failure_policy".to_string(),
                message: format!("unknown policy '{}'", other),
            }
            .into()),
        }
    }
}

// ── Evaluation ────────────────────────────────────────────────────────────────

/// 某条消息及其执行结果
#[derive(Debug, Clone, PartialEq)]
pub struct MessageResult {
    pub message: Message,
    pub result: EvaluationResult,
    /// 处理完这条消息后的内存大小（字节）
    pub memory_size: usize,
}

/// 一次求值的输出
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// 最终内存；从创世开始且没有任何一条消息成功时为 `None`
    pub memory: Option<Memory>,
    /// 与输入消息一一对应
    pub results: Vec<MessageResult>,
}

impl Evaluation {
    pub fn last(&self) -> Option<&MessageResult> {
        self.results.last()
    }

    pub fn failures(&self) -> usize {
        self.results.iter().filter(|r| r.result.is_error()).count()
    }
}

pub struct Evaluator {
    engine: Arc<dyn ExecutionEngine>,
    policy: FailurePolicy,
}

impl Evaluator {
    pub fn new(engine: Arc<dyn ExecutionEngine>) -> Self {
        Self {
            engine,
            policy: FailurePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// 从 `initial` 开始依次执行 `messages`
    pub async fn evaluate(
        &self,
        module_id: &str,
        bytecode: &[u8],
        initial: Option<Memory>,
        messages: &[Message],
        env: &Environment,
    ) -> Result<Evaluation> {
        let started = Instant::now();
        let handle = self
            .engine
            .instantiate(module_id, bytecode)
            .await
            .map_err(|e| EvaluationFault::Instantiate {
                module_id: module_id.to_string(),
                message: e.to_string(),
            })?;

        let mut memory = initial;
        let mut results = Vec::with_capacity(messages.len());

        for message in messages {
            debug!(process_id = %env.process.id, nonce = message.nonce, message_id = %message.id, "执行消息");
            // 引擎自身出错与消息内容无关，不能当作可跳过的消息失败
            let resp = match handle.handle(memory.as_deref(), message, env).await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(process_id = %env.process.id, nonce = message.nonce, error = %e, "执行引擎出错，终止本次求值");
                    return Err(e);
                }
            };
            let outcome = match resp.error {
                Some(err) => Err(err),
                None => Ok(resp),
            };

            match outcome {
                Ok(resp) => {
                    let memory_size = resp.memory.len();
                    memory = Some(Memory::from(resp.memory));
                    results.push(MessageResult {
                        message: message.clone(),
                        memory_size,
                        result: EvaluationResult {
                            error: None,
                            output: resp.output,
                            messages: resp.messages,
                            spawns: resp.spawns,
                            assignments: resp.assignments,
                        },
                    });
                }
                Err(err) => {
                    let fault = EvaluationFault::Handle {
                        message_id: message.id.clone(),
                        nonce: message.nonce,
                        message: err.clone(),
                    };
                    if self.policy == FailurePolicy::Abort {
                        warn!(process_id = %env.process.id, error = %fault, "消息执行失败，终止本次求值");
                        return Err(fault.into());
                    }
                    warn!(process_id = %env.process.id, error = %fault, "消息执行失败，跳过");
                    results.push(MessageResult {
                        message: message.clone(),
                        result: EvaluationResult::failed(err),
                        memory_size: memory.as_ref().map_or(0, |m| m.len()),
                    });
                }
            }
        }

        let evaluation = Evaluation { memory, results };
        info!(
            process_id = %env.process.id,
            messages = messages.len(),
            failures = evaluation.failures(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "⚙️ 求值完成"
        );
        Ok(evaluation)
    }
}
