//! 核心数据模型：进程定义、消息、执行环境与执行结果
//!
//! 字段命名沿用状态转移函数侧的约定（`Id`、`Block-Height` 等），
//! 以便原样序列化给执行引擎和持久化结果库。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// 进程内存快照，读方共享同一份缓冲区
pub type Memory = Arc<[u8]>;

/// 名称/值对
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// 在 tag 列表中按名称查找第一个值
pub fn tag_value<'a>(tags: &'a [Tag], name: &str) -> Option<&'a str> {
    tags.iter()
        .find(|t| t.name == name)
        .map(|t| t.value.as_str())
}

// ── ProcessDefinition ─────────────────────────────────────────────────────────

/// 进程部署时的不可变定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub process_id: String,
    pub owner: String,
    /// 模块字节码的内容标识
    pub module_id: String,
    /// 部署声明 tag（保持原顺序）
    pub tags: Vec<Tag>,
    pub block_height: u64,
    pub timestamp: u64,
}

impl ProcessDefinition {
    /// 构造只读执行环境
    pub fn environment(&self) -> Environment {
        Environment {
            process: ProcessEnv {
                id: self.process_id.clone(),
                owner: self.owner.clone(),
                tags: self.tags.clone(),
            },
            module: ModuleEnv {
                id: self.module_id.clone(),
            },
        }
    }
}

// ── Message ───────────────────────────────────────────────────────────────────

/// 调度器分配过 nonce 的一条消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Signature")]
    pub signature: Option<String>,
    #[serde(rename = "Owner")]
    pub owner: String,
    #[serde(rename = "Target")]
    pub target: String,
    #[serde(rename = "Tags")]
    pub tags: Vec<Tag>,
    #[serde(rename = "Data")]
    pub data: Option<String>,
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "Forwarded-By")]
    pub forwarded_by: Option<String>,
    /// 进程内严格递增的序号
    #[serde(rename = "Nonce")]
    pub nonce: u64,
    #[serde(rename = "Timestamp")]
    pub timestamp: u64,
    #[serde(rename = "Block-Height")]
    pub block_height: u64,
    #[serde(rename = "Epoch")]
    pub epoch: u64,
    #[serde(rename = "Hash-Chain")]
    pub hash_chain: Option<String>,
    #[serde(rename = "Cron")]
    pub cron: bool,
    #[serde(rename = "Read-Only")]
    pub read_only: bool,
}

impl Message {
    pub fn tag(&self, name: &str) -> Option<&str> {
        tag_value(&self.tags, name)
    }
}

// ── Environment ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProcessEnv {
    pub id: String,
    pub owner: String,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModuleEnv {
    pub id: String,
}

/// 执行环境：整段消息序列执行期间只读
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Environment {
    pub process: ProcessEnv,
    pub module: ModuleEnv,
}

// ── EvaluationResult ──────────────────────────────────────────────────────────

/// 单条消息的执行结果（不含内存，内存随 [`Memory`] 单独移交）
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EvaluationResult {
    /// 非空表示该消息执行失败
    pub error: Option<String>,
    pub output: Value,
    pub messages: Vec<Value>,
    pub spawns: Vec<Value>,
    pub assignments: Vec<Value>,
}

impl EvaluationResult {
    /// 创世/构造消息对应的空结果
    pub fn empty() -> Self {
        Self::default()
    }

    /// 失败消息的结果：只携带错误信息
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
