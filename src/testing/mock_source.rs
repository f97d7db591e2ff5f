//! Mock 调度器 / 网关，用于在不发起真实 HTTP 请求的情况下测试数据拉取与缓存。
//!
//! 每个进程维护一份按 nonce 排序的 edge 列表。分页语义与真实调度器一致：
//! 游标是消息时间戳的字符串形式，`from` 不含、`to` 含。
//!
//! # 示例
//!
//! ```rust
//! use echo_cu::testing::MockSource;
//! use echo_cu::source::{MessageSource, PageQuery};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let source = MockSource::new().with_page_size(2);
//! source.push_message("proc", "a");
//! source.push_message("proc", "b");
//! source.push_message("proc", "c");
//!
//! let page = source.fetch_page("proc", &PageQuery::default()).await.unwrap();
//! assert_eq!(page.edges.len(), 2);
//! assert!(page.page_info.has_next_page);
//! assert_eq!(source.page_fetches(), 1);
//! # }
//! ```

use super::timestamp_for;
use crate::error::{FetchError, Result};
use crate::source::{
    ArtifactSource, Edge, MessagePage, MessageSource, Node, Owner, PageInfo, PageQuery, RawAssignment,
    RawMessage, RawProcess,
};
use crate::types::Tag;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Fixture {
    owner: String,
    module_id: Option<String>,
    /// 按 nonce 升序
    nodes: Vec<Node>,
}

impl Fixture {
    fn next_nonce(&self) -> u64 {
        self.nodes
            .iter()
            .filter_map(|n| nonce_of(n))
            .max()
            .map_or(1, |n| n + 1)
    }
}

/// 可脚本化的 Mock 数据源
pub struct MockSource {
    processes: Arc<Mutex<HashMap<String, Fixture>>>,
    modules: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    page_size: usize,
    latency: Duration,
    /// 接下来 N 次拉取返回网络错误
    failures: Arc<AtomicUsize>,
    page_fetches: Arc<AtomicUsize>,
    message_fetches: Arc<AtomicUsize>,
    process_fetches: Arc<AtomicUsize>,
    module_fetches: Arc<AtomicUsize>,
}

impl Default for MockSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSource {
    pub fn new() -> Self {
        Self {
            processes: Arc::new(Mutex::new(HashMap::new())),
            modules: Arc::new(Mutex::new(HashMap::new())),
            page_size: 100,
            latency: Duration::ZERO,
            failures: Arc::new(AtomicUsize::new(0)),
            page_fetches: Arc::new(AtomicUsize::new(0)),
            message_fetches: Arc::new(AtomicUsize::new(0)),
            process_fetches: Arc::new(AtomicUsize::new(0)),
            module_fetches: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 部署一个进程：写入 nonce 0 的部署消息（id 即进程 id），
    /// 并在模块不存在时登记一份模块字节码
    pub fn with_process(self, process_id: &str, owner: &str, module_id: &str) -> Self {
        {
            let mut processes = self.processes.lock().unwrap();
            let fixture = processes.entry(process_id.to_string()).or_default();
            fixture.owner = owner.to_string();
            fixture.module_id = Some(module_id.to_string());
            fixture.nodes.insert(0, genesis_node(process_id, owner, module_id));
        }
        self.modules
            .lock()
            .unwrap()
            .entry(module_id.to_string())
            .or_insert_with(|| format!("module:{module_id}").into_bytes());
        self
    }

    pub fn with_module(self, module_id: &str, bytecode: Vec<u8>) -> Self {
        self.modules
            .lock()
            .unwrap()
            .insert(module_id.to_string(), bytecode);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// 每次拉取前的人为延迟
    pub fn with_latency_ms(mut self, ms: u64) -> Self {
        self.latency = Duration::from_millis(ms);
        self
    }

    /// 追加一条消息并返回分配的 nonce（从 1 开始）
    pub fn push_message(&self, process_id: &str, data: &str) -> u64 {
        let mut processes = self.processes.lock().unwrap();
        let fixture = processes
            .entry(process_id.to_string())
            .or_insert_with(|| Fixture {
                owner: "owner".to_string(),
                ..Fixture::default()
            });
        let nonce = fixture.next_nonce();
        fixture.nodes.push(message_node(process_id, nonce, data));
        nonce
    }

    /// 接下来 `n` 次拉取（任意类型）返回网络错误
    pub fn fail_next_fetches(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn page_fetches(&self) -> usize {
        self.page_fetches.load(Ordering::SeqCst)
    }

    pub fn message_fetches(&self) -> usize {
        self.message_fetches.load(Ordering::SeqCst)
    }

    pub fn process_fetches(&self) -> usize {
        self.process_fetches.load(Ordering::SeqCst)
    }

    pub fn module_fetches(&self) -> usize {
        self.module_fetches.load(Ordering::SeqCst)
    }

    async fn before_fetch(&self, counter: &AtomicUsize, what: &str) -> Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(FetchError::Network(format!("injected failure: {what}")).into());
        }
        Ok(())
    }
}

#[async_trait]
impl MessageSource for MockSource {
    async fn fetch_page(&self, process_id: &str, query: &PageQuery) -> Result<MessagePage> {
        self.before_fetch(&self.page_fetches, "page").await?;

        let from = query.from.as_deref().and_then(|f| f.parse::<u64>().ok());
        let processes = self.processes.lock().unwrap();
        let nodes: Vec<&Node> = processes
            .get(process_id)
            .map(|f| f.nodes.iter().collect())
            .unwrap_or_default();

        let mut matching = nodes.into_iter().filter(|n| {
            let ts = timestamp_of(n);
            from.is_none_or(|from| ts > from) && query.to.is_none_or(|to| ts <= to)
        });
        let edges: Vec<Edge> = matching
            .by_ref()
            .take(self.page_size)
            .map(|n| Edge {
                cursor: timestamp_of(n).to_string(),
                node: n.clone(),
            })
            .collect();
        let has_next_page = matching.next().is_some();

        Ok(MessagePage {
            edges,
            page_info: PageInfo { has_next_page },
        })
    }

    async fn fetch_message(&self, process_id: &str, message_id: &str) -> Result<Node> {
        self.before_fetch(&self.message_fetches, "message").await?;
        self.processes
            .lock()
            .unwrap()
            .get(process_id)
            .and_then(|f| f.nodes.iter().find(|n| n.message.id == message_id))
            .cloned()
            .ok_or_else(|| not_found(&format!("{message_id}?process-id={process_id}")))
    }
}

#[async_trait]
impl ArtifactSource for MockSource {
    async fn fetch_process(&self, process_id: &str) -> Result<RawProcess> {
        self.before_fetch(&self.process_fetches, "process").await?;
        let processes = self.processes.lock().unwrap();
        let fixture = processes
            .get(process_id)
            .ok_or_else(|| not_found(&format!("processes/{process_id}")))?;
        let module_id = fixture
            .module_id
            .clone()
            .ok_or_else(|| not_found(&format!("processes/{process_id}")))?;
        Ok(RawProcess {
            owner: Owner {
                address: fixture.owner.clone(),
            },
            tags: vec![
                Tag::new("Data-Protocol", "ao"),
                Tag::new("Type", "Process"),
                Tag::new("Module", module_id),
            ],
            block: 1000,
            timestamp: timestamp_for(0),
        })
    }

    async fn fetch_module(&self, module_id: &str) -> Result<Vec<u8>> {
        self.before_fetch(&self.module_fetches, "module").await?;
        self.modules
            .lock()
            .unwrap()
            .get(module_id)
            .cloned()
            .ok_or_else(|| not_found(module_id))
    }
}

fn not_found(path: &str) -> crate::error::CuError {
    FetchError::Status {
        url: format!("mock://{path}"),
        status: 404,
        message: "not found".to_string(),
    }
    .into()
}

fn assignment_tags(nonce: u64) -> Vec<Tag> {
    vec![
        Tag::new("Nonce", nonce.to_string()),
        Tag::new("Timestamp", timestamp_for(nonce).to_string()),
        Tag::new("Block-Height", (1000 + nonce).to_string()),
        Tag::new("Epoch", "0"),
    ]
}

fn genesis_node(process_id: &str, owner: &str, module_id: &str) -> Node {
    Node {
        message: RawMessage {
            id: process_id.to_string(),
            signature: None,
            owner: Owner {
                address: owner.to_string(),
            },
            data: None,
            tags: vec![Tag::new("Type", "Process"), Tag::new("Module", module_id)],
        },
        assignment: RawAssignment {
            tags: assignment_tags(0),
        },
    }
}

fn message_node(process_id: &str, nonce: u64, data: &str) -> Node {
    Node {
        message: RawMessage {
            id: format!("{process_id}-{nonce}"),
            signature: None,
            owner: Owner {
                address: "owner".to_string(),
            },
            data: Some(data.to_string()),
            tags: vec![Tag::new("Action", "Eval")],
        },
        assignment: RawAssignment {
            tags: assignment_tags(nonce),
        },
    }
}

fn nonce_of(node: &Node) -> Option<u64> {
    crate::types::tag_value(&node.assignment.tags, "Nonce").and_then(|n| n.parse().ok())
}

fn timestamp_of(node: &Node) -> u64 {
    crate::types::tag_value(&node.assignment.tags, "Timestamp")
        .and_then(|t| t.parse().ok())
        .unwrap_or(0)
}
