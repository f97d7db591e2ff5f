//! 结果广播
//!
//! 每条消息执行完毕后，updater 和 resolver 都会把结果推给 [`Broadcaster`]。
//! 推送是 fire-and-forget：实现不得阻塞调用方，失败自行记录日志。
//!
//! | 实现 | 用途 |
//! |------|------|
//! | [`LoggingBroadcaster`] | 只写 tracing 日志（默认） |
//! | [`WebSocketBroadcaster`] | 推送给已连接的 WebSocket 客户端 |
//! | [`crate::testing::RecordingBroadcaster`] | 测试中记录所有推送 |

mod websocket;

pub use websocket::WebSocketBroadcaster;

use crate::eval::MessageResult;
use crate::types::{EvaluationResult, Tag};
use serde::{Deserialize, Serialize};
use tracing::info;

/// 推送给订阅方的一条执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultAnnouncement {
    pub process_id: String,
    pub message_id: String,
    pub nonce: u64,
    pub timestamp: u64,
    pub tags: Vec<Tag>,
    pub result: EvaluationResult,
    /// 处理完该消息后的内存大小
    pub memory_size: usize,
}

impl ResultAnnouncement {
    pub fn new(process_id: &str, item: &MessageResult) -> Self {
        Self {
            process_id: process_id.to_string(),
            message_id: item.message.id.clone(),
            nonce: item.message.nonce,
            timestamp: item.message.timestamp,
            tags: item.message.tags.clone(),
            result: item.result.clone(),
            memory_size: item.memory_size,
        }
    }
}

pub trait Broadcaster: Send + Sync {
    fn publish(&self, announcement: ResultAnnouncement);
}

/// 只记录日志的广播器
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingBroadcaster;

impl Broadcaster for LoggingBroadcaster {
    fn publish(&self, announcement: ResultAnnouncement) {
        info!(
            process_id = %announcement.process_id,
            message_id = %announcement.message_id,
            nonce = announcement.nonce,
            error = announcement.result.error.as_deref().unwrap_or(""),
            "📣 消息结果"
        );
    }
}
