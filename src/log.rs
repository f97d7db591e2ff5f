//! 进程消息日志缓存
//!
//! 每个进程缓存一段从头开始、连续的消息前缀。区间读取优先命中缓存，
//! 缓存不足时从尾部继续向远端分页拉取，合并后再切片返回。
//!
//! ## nonce 与时间戳
//!
//! 对外所有区间都以 nonce 表达（checkpoint 的规范键）。远端分页按时间戳游标
//! 切分，换算只发生在这里：
//! - `from`：已缓存尾部消息的时间戳（空缓存时从头开始）
//! - `to`：若目标 nonce 的时间戳已知（[`MessageLogStore::fetch_message`] 见过它），
//!   作为上界传给远端；否则拉到当前为止
//!
//! 同一进程的拉取+合并被串行化，后到的调用者直接读到前者写入的缓存。

use crate::error::{LogCorruption, Result};
use crate::source::{MessagePage, MessageSource, PageQuery, parse_node};
use crate::types::Message;
use async_stream::try_stream;
use futures::{Stream, StreamExt, pin_mut};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info};

#[derive(Default)]
struct ProcessLog {
    messages: Vec<Message>,
    /// 见过但尚未进入缓存的消息：nonce → 时间戳
    timestamps: HashMap<u64, u64>,
}

impl ProcessLog {
    fn tail(&self) -> Option<&Message> {
        self.messages.last()
    }

    fn range(&self, from_exclusive: u64, to_inclusive: Option<u64>) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| m.nonce > from_exclusive && to_inclusive.is_none_or(|to| m.nonce <= to))
            .cloned()
            .collect()
    }

    /// 校验整批后再追加，任何一条违规则整批拒绝
    fn append(&mut self, process_id: &str, batch: Vec<Message>) -> Result<usize> {
        let mut previous = self.tail().map(|m| m.nonce);
        for msg in &batch {
            if let Some(prev) = previous {
                let next = msg.nonce;
                if next == prev {
                    return Err(LogCorruption::Duplicate {
                        process_id: process_id.to_string(),
                        nonce: next,
                    }
                    .into());
                }
                if next < prev {
                    return Err(LogCorruption::Decreasing {
                        process_id: process_id.to_string(),
                        previous: prev,
                        next,
                    }
                    .into());
                }
                if next != prev + 1 {
                    return Err(LogCorruption::Gap {
                        process_id: process_id.to_string(),
                        previous: prev,
                        next,
                    }
                    .into());
                }
            }
            previous = Some(msg.nonce);
        }
        let appended = batch.len();
        for msg in &batch {
            self.timestamps.remove(&msg.nonce);
        }
        self.messages.extend(batch);
        Ok(appended)
    }
}

type Slot = Arc<tokio::sync::Mutex<ProcessLog>>;

pub struct MessageLogStore {
    source: Arc<dyn MessageSource>,
    logs: Mutex<HashMap<String, Slot>>,
}

impl MessageLogStore {
    pub fn new(source: Arc<dyn MessageSource>) -> Self {
        Self {
            source,
            logs: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, process_id: &str) -> Slot {
        self.logs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(process_id.to_string())
            .or_default()
            .clone()
    }

    /// 返回 nonce 位于 `(from_exclusive, to_inclusive]` 的有序消息；
    /// `to_inclusive == None` 表示直到当前
    pub async fn load_range(
        &self,
        process_id: &str,
        from_exclusive: u64,
        to_inclusive: Option<u64>,
    ) -> Result<Vec<Message>> {
        let slot = self.slot(process_id);
        let mut log = slot.lock().await;

        let covered = match (to_inclusive, log.tail()) {
            (Some(to), Some(tail)) => tail.nonce >= to,
            _ => false,
        };
        if covered {
            debug!(process_id = %process_id, from = from_exclusive, to = ?to_inclusive, "消息区间命中缓存");
            return Ok(log.range(from_exclusive, to_inclusive));
        }

        let query = PageQuery {
            from: log.tail().map(|m| m.timestamp.to_string()),
            to: to_inclusive.and_then(|to| log.timestamps.get(&to).copied()),
        };
        let fetched = self.fetch_all(process_id, query).await?;
        log.append(process_id, fetched)?;

        if let Some(to) = to_inclusive {
            let tail = log.tail().map(|m| m.nonce).unwrap_or(0);
            if tail < to {
                return Err(LogCorruption::Gap {
                    process_id: process_id.to_string(),
                    previous: tail,
                    next: to,
                }
                .into());
            }
        }
        Ok(log.range(from_exclusive, to_inclusive))
    }

    /// 把新拉取的一批消息合并进缓存；重复、倒退或跳号都视为 [`LogCorruption`]
    pub async fn append_and_cache(&self, process_id: &str, messages: Vec<Message>) -> Result<usize> {
        let slot = self.slot(process_id);
        let mut log = slot.lock().await;
        log.append(process_id, messages)
    }

    /// 返回完整的缓存日志；从未缓存过时返回 `None`
    pub async fn get_cached(&self, process_id: &str) -> Option<Vec<Message>> {
        let slot = self.logs.lock().unwrap_or_else(|p| p.into_inner()).get(process_id).cloned()?;
        let log = slot.lock().await;
        if log.messages.is_empty() {
            None
        } else {
            Some(log.messages.clone())
        }
    }

    /// 拉取单条消息；进程部署消息返回 `None`
    pub async fn fetch_message(&self, process_id: &str, message_id: &str) -> Result<Option<Message>> {
        let started = Instant::now();
        let node = self.source.fetch_message(process_id, message_id).await?;
        let message = parse_node(&node, process_id)?;
        debug!(
            process_id = %process_id,
            message_id = %message_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "单条消息已拉取"
        );
        if let Some(msg) = &message {
            let slot = self.slot(process_id);
            let mut log = slot.lock().await;
            // 已在缓存里的消息不需要时间戳提示
            if log.tail().is_none_or(|tail| msg.nonce > tail.nonce) {
                log.timestamps.insert(msg.nonce, msg.timestamp);
            }
        }
        Ok(message)
    }

    /// 丢弃 nonce 不超过 `through` 的时间戳提示；checkpoint 越过之后它们不会再被用到
    pub async fn prune_hints(&self, process_id: &str, through: u64) {
        let Some(slot) = self.logs.lock().unwrap_or_else(|p| p.into_inner()).get(process_id).cloned() else {
            return;
        };
        slot.lock().await.timestamps.retain(|nonce, _| *nonce > through);
    }

    #[cfg(test)]
    pub(crate) async fn hint_count(&self, process_id: &str) -> usize {
        let slot = self.slot(process_id);
        let log = slot.lock().await;
        log.timestamps.len()
    }

    /// 丢弃某进程的缓存日志
    pub fn forget(&self, process_id: &str) {
        self.logs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(process_id);
    }

    /// 按游标逐页拉取，直到 `has_next_page == false`
    pub fn pages(
        &self,
        process_id: &str,
        query: PageQuery,
    ) -> impl Stream<Item = Result<MessagePage>> + Send + 'static {
        let source = self.source.clone();
        let process_id = process_id.to_string();
        try_stream! {
            let mut query = query;
            loop {
                let page = source.fetch_page(&process_id, &query).await?;
                let next = page.next_cursor().map(String::from);
                yield page;
                match next {
                    Some(cursor) => {
                        debug!(process_id = %process_id, cursor = %cursor, "继续拉取下一页");
                        query.from = Some(cursor);
                    }
                    None => break,
                }
            }
        }
    }

    async fn fetch_all(&self, process_id: &str, query: PageQuery) -> Result<Vec<Message>> {
        let started = Instant::now();
        info!(process_id = %process_id, from = ?query.from, to = ?query.to, "从调度器加载消息");

        let pages = self.pages(process_id, query);
        pin_mut!(pages);
        let mut messages = Vec::new();
        let mut page_count = 0usize;
        while let Some(page) = pages.next().await {
            page_count += 1;
            for edge in page?.edges {
                if let Some(msg) = parse_node(&edge.node, process_id)? {
                    messages.push(msg);
                }
            }
        }

        info!(
            process_id = %process_id,
            messages = messages.len(),
            pages = page_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "消息加载完成"
        );
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CuError;
    use crate::testing::{MockSource, test_message};

    fn source_with(n: u64, page_size: usize) -> Arc<MockSource> {
        let source = MockSource::new()
            .with_process("p", "owner", "mod")
            .with_page_size(page_size);
        for i in 1..=n {
            source.push_message("p", &format!("m{}", i));
        }
        Arc::new(source)
    }

    #[tokio::test]
    async fn test_pagination_completeness() {
        // 6 条消息，每页 2 条 → 3 页
        let source = MockSource::new().with_page_size(2);
        for i in 1..=6 {
            source.push_message("p", &format!("m{}", i));
        }
        let source = Arc::new(source);
        let store = MessageLogStore::new(source.clone());

        let msgs = store.load_range("p", 0, None).await.unwrap();
        let nonces: Vec<u64> = msgs.iter().map(|m| m.nonce).collect();
        assert_eq!(nonces, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(source.page_fetches(), 3);
    }

    #[tokio::test]
    async fn test_range_served_from_cache() {
        let source = source_with(5, 100);
        let store = MessageLogStore::new(source.clone());

        store.load_range("p", 0, None).await.unwrap();
        let fetches = source.page_fetches();

        let mid = store.load_range("p", 1, Some(4)).await.unwrap();
        assert_eq!(mid.iter().map(|m| m.nonce).collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(source.page_fetches(), fetches);
    }

    #[tokio::test]
    async fn test_incremental_fetch_from_tail() {
        let source = source_with(3, 100);
        let store = MessageLogStore::new(source.clone());
        assert_eq!(store.load_range("p", 0, None).await.unwrap().len(), 3);

        source.push_message("p", "m4");
        source.push_message("p", "m5");
        let fresh = store.load_range("p", 3, None).await.unwrap();
        assert_eq!(fresh.iter().map(|m| m.nonce).collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(store.get_cached("p").await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_bounded_range_beyond_log_is_gap() {
        let source = source_with(2, 100);
        let store = MessageLogStore::new(source);
        match store.load_range("p", 0, Some(5)).await {
            Err(CuError::LogCorruption(LogCorruption::Gap { previous, next, .. })) => {
                assert_eq!((previous, next), (2, 5))
            }
            other => panic!("超出日志末尾的区间应该失败: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_append_rejects_duplicates_and_gaps() {
        let store = MessageLogStore::new(Arc::new(MockSource::new()));
        store
            .append_and_cache("p", vec![test_message("p", 1, "a"), test_message("p", 2, "b")])
            .await
            .unwrap();

        let dup = store.append_and_cache("p", vec![test_message("p", 2, "b")]).await;
        assert!(matches!(
            dup,
            Err(CuError::LogCorruption(LogCorruption::Duplicate { nonce: 2, .. }))
        ));
        let back = store.append_and_cache("p", vec![test_message("p", 1, "a")]).await;
        assert!(matches!(
            back,
            Err(CuError::LogCorruption(LogCorruption::Decreasing { .. }))
        ));
        let gap = store.append_and_cache("p", vec![test_message("p", 4, "d")]).await;
        assert!(matches!(gap, Err(CuError::LogCorruption(LogCorruption::Gap { .. }))));

        // 被拒绝的批次不会部分写入
        let partial = store
            .append_and_cache("p", vec![test_message("p", 3, "c"), test_message("p", 3, "c")])
            .await;
        assert!(partial.is_err());
        assert_eq!(store.get_cached("p").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_get_cached_absent() {
        let store = MessageLogStore::new(Arc::new(MockSource::new()));
        assert!(store.get_cached("nobody").await.is_none());
    }

    #[tokio::test]
    async fn test_fetch_message_and_genesis() {
        let source = source_with(3, 100);
        let store = MessageLogStore::new(source);
        let msg = store.fetch_message("p", "p-2").await.unwrap().unwrap();
        assert_eq!(msg.nonce, 2);
        // 进程 id 即部署消息 id
        assert!(store.fetch_message("p", "p").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_timestamp_hints_are_bounded() {
        let store = MessageLogStore::new(source_with(5, 100));
        for i in 1..=5 {
            store.fetch_message("p", &format!("p-{}", i)).await.unwrap();
        }
        assert_eq!(store.hint_count("p").await, 5);

        store.load_range("p", 0, Some(2)).await.unwrap();
        assert_eq!(store.hint_count("p").await, 3);

        // 已缓存的消息不再记录提示
        store.fetch_message("p", "p-1").await.unwrap();
        assert_eq!(store.hint_count("p").await, 3);

        store.prune_hints("p", 4).await;
        assert_eq!(store.hint_count("p").await, 1);
        store.prune_hints("nobody", 4).await;
    }

    #[tokio::test]
    async fn test_fetch_failure_propagates() {
        let source = source_with(3, 1);
        source.fail_next_fetches(1);
        let store = MessageLogStore::new(source.clone());
        assert!(matches!(
            store.load_range("p", 0, None).await,
            Err(CuError::Fetch(_))
        ));
        assert!(store.get_cached("p").await.is_none());
        assert_eq!(store.load_range("p", 0, None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_forget() {
        let store = MessageLogStore::new(source_with(2, 100));
        store.load_range("p", 0, None).await.unwrap();
        store.forget("p");
        assert!(store.get_cached("p").await.is_none());
    }
}
