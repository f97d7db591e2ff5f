//! 远端数据源
//!
//! 调度器（sequencer）提供两类只读数据，这里各抽象为一个 trait：
//!
//! | trait | 数据 | 内置实现 |
//! |-------|------|----------|
//! | [`MessageSource`] | 分页消息日志、单条消息 | [`http::HttpSequencer`] |
//! | [`ArtifactSource`] | 进程定义、模块字节码 | [`http::HttpSequencer`] |
//!
//! 测试替身见 [`crate::testing::MockSource`]。
//!
//! 远端以 "edge" 形式返回消息：每条 edge 是一对 assignment + message，
//! nonce / 时间戳 / 区块高度等字段取自 assignment 的 tag。[`parse_node`]
//! 负责把它转成 [`Message`]。

pub mod http;

use crate::error::{CuError, ParseError, Result};
use crate::types::{Message, ProcessDefinition, Tag, tag_value};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

// ── 传输格式 ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Owner {
    pub address: String,
}

/// 远端原始消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: String,
    #[serde(default)]
    pub signature: Option<String>,
    pub owner: Owner,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

/// 调度器为消息分配序号时产生的 assignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAssignment {
    #[serde(default)]
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub message: RawMessage,
    pub assignment: RawAssignment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// 续页游标，作为下一页的 `from`
    pub cursor: String,
    pub node: Node,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    pub has_next_page: bool,
}

/// 一页消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePage {
    pub edges: Vec<Edge>,
    pub page_info: PageInfo,
}

impl MessagePage {
    /// 下一页的起始游标；没有下一页时为 `None`
    pub fn next_cursor(&self) -> Option<&str> {
        if !self.page_info.has_next_page {
            return None;
        }
        self.edges.last().map(|e| e.cursor.as_str())
    }
}

/// 分页查询区间。远端按时间戳/游标切分，两端都是毫秒时间戳的字符串形式。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageQuery {
    /// 不含；`None` 表示从头开始
    pub from: Option<String>,
    /// 含；`None` 表示直到当前
    pub to: Option<u64>,
}

/// 远端原始进程定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawProcess {
    pub owner: Owner,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(deserialize_with = "number_or_string")]
    pub block: u64,
    #[serde(deserialize_with = "number_or_string")]
    pub timestamp: u64,
}

// ── Source traits ─────────────────────────────────────────────────────────────

/// 分页消息日志来源
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// 拉取一页消息
    async fn fetch_page(&self, process_id: &str, query: &PageQuery) -> Result<MessagePage>;

    /// 按 id 拉取单条消息
    async fn fetch_message(&self, process_id: &str, message_id: &str) -> Result<Node>;
}

/// 不可变制品来源
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn fetch_process(&self, process_id: &str) -> Result<RawProcess>;

    /// 返回不透明的模块字节码
    async fn fetch_module(&self, module_id: &str) -> Result<Vec<u8>>;
}

// ── 解析 ──────────────────────────────────────────────────────────────────────

/// 把 edge 节点解析为消息；进程的部署（构造）消息返回 `None`
pub fn parse_node(node: &Node, process_id: &str) -> Result<Option<Message>> {
    let Node {
        message,
        assignment,
    } = node;

    if tag_value(&message.tags, "Type") == Some("Process") {
        tracing::debug!(process_id = %process_id, message_id = %message.id, "跳过进程部署消息");
        return Ok(None);
    }

    let numeric = |name: &str| -> Result<u64> {
        let raw = tag_value(&assignment.tags, name).ok_or_else(|| ParseError::MissingTag {
            message_id: message.id.clone(),
            tag: name.to_string(),
        })?;
        raw.parse::<u64>().map_err(|_| {
            CuError::Parse(ParseError::InvalidTag {
                message_id: message.id.clone(),
                tag: name.to_string(),
                value: raw.to_string(),
            })
        })
    };

    let tags = message
        .tags
        .iter()
        .chain(assignment.tags.iter())
        .cloned()
        .collect();

    Ok(Some(Message {
        id: message.id.clone(),
        signature: message.signature.clone(),
        owner: message.owner.address.clone(),
        target: process_id.to_string(),
        tags,
        data: message.data.clone(),
        from: process_id.to_string(),
        forwarded_by: Some(message.owner.address.clone()),
        nonce: numeric("Nonce")?,
        timestamp: numeric("Timestamp")?,
        block_height: numeric("Block-Height")?,
        epoch: numeric("Epoch").unwrap_or(0),
        hash_chain: tag_value(&assignment.tags, "Hash-Chain").map(String::from),
        cron: false,
        read_only: false,
    }))
}

/// 把远端进程定义解析为 [`ProcessDefinition`]，要求存在 `Module` tag
pub fn parse_process(raw: &RawProcess, process_id: &str) -> Result<ProcessDefinition> {
    let module_id = tag_value(&raw.tags, "Module").ok_or_else(|| ParseError::MissingTag {
        message_id: process_id.to_string(),
        tag: "Module".to_string(),
    })?;
    Ok(ProcessDefinition {
        process_id: process_id.to_string(),
        owner: raw.owner.address.clone(),
        module_id: module_id.to_string(),
        tags: raw.tags.clone(),
        block_height: raw.block,
        timestamp: raw.timestamp,
    })
}

/// 调度器有时把数字编码为字符串
fn number_or_string<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(u64),
        Str(String),
    }
    match NumOrStr::deserialize(deserializer)? {
        NumOrStr::Num(n) => Ok(n),
        NumOrStr::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}
