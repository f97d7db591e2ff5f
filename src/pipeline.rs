//! updater 与 resolver 共用的依赖与提交流程
//!
//! 两条路径都是「准备制品 → 取起点 → 求值 → 提交」，区别只在于消息区间
//! 怎么选。提交顺序固定：
//!
//! 1. 写快照 `(process_id, last_nonce)`
//! 2. 逐条结果写入持久化结果库（等待完成）
//! 3. checkpoint 比较后前进（[`ProcessRegistry::advance`]）
//! 4. 安排淘汰被取代的快照；提交落后时淘汰自己刚写的快照
//! 5. 推送给广播器
//!
//! 结果先于 checkpoint 落盘：一旦有人看到新的 checkpoint 并走 "already past"
//! 分支，对应的结果一定已经在结果库里。

use crate::artifact::ArtifactStore;
use crate::broadcast::{Broadcaster, ResultAnnouncement};
use crate::error::{CuError, Result};
use crate::eval::{Evaluation, Evaluator, MessageResult};
use crate::log::MessageLogStore;
use crate::registry::{Advance, Checkpoint, ProcessRegistry};
use crate::results::{ResultStore, StoredResult};
use crate::snapshot::MemorySnapshotStore;
use crate::types::{Memory, ProcessDefinition};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct Pipeline {
    pub artifacts: ArtifactStore,
    pub log: MessageLogStore,
    pub snapshots: MemorySnapshotStore,
    pub evaluator: Evaluator,
    pub registry: ProcessRegistry,
    pub results: Arc<dyn ResultStore>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub eviction_grace: Duration,
}

/// 求值的起点：checkpoint 及其快照
pub struct StartingPoint {
    pub checkpoint: Checkpoint,
    pub memory: Memory,
}

impl Pipeline {
    /// 进程定义与模块字节码
    pub async fn artifacts_for(&self, process_id: &str) -> Result<(Arc<ProcessDefinition>, Arc<[u8]>)> {
        let definition = self
            .artifacts
            .get_or_fetch_process_definition(process_id)
            .await?;
        let module = self.artifacts.get_or_fetch_module(&definition.module_id).await?;
        Ok((definition, module))
    }

    /// 读取 checkpoint 对应的快照；快照已不在缓存时返回 [`CuError::SnapshotMissing`]
    pub fn load_snapshot(&self, process_id: &str, checkpoint: Checkpoint) -> Result<StartingPoint> {
        match self.snapshots.get(process_id, checkpoint.nonce) {
            Some(memory) => Ok(StartingPoint { checkpoint, memory }),
            None => Err(CuError::SnapshotMissing {
                process_id: process_id.to_string(),
                nonce: checkpoint.nonce,
            }),
        }
    }

    /// 当前起点；快照丢失时清空 checkpoint，从创世开始
    pub fn starting_point(&self, process_id: &str) -> Option<StartingPoint> {
        let checkpoint = self.registry.checkpoint(process_id)?;
        match self.load_snapshot(process_id, checkpoint) {
            Ok(start) => Some(start),
            Err(e) => {
                self.heal(process_id, &e);
                None
            }
        }
    }

    /// 缓存一致性故障的自愈：仅当 checkpoint 仍指向丢失的快照时清空
    pub fn heal(&self, process_id: &str, error: &CuError) {
        if let CuError::SnapshotMissing { nonce, .. } = error {
            warn!(process_id = %process_id, nonce, "⚠️ checkpoint 快照缺失，重置后从创世重放");
            self.registry.reset(process_id, *nonce);
        }
    }

    pub async fn evaluate(
        &self,
        definition: &ProcessDefinition,
        module: &[u8],
        start: Option<&StartingPoint>,
        messages: &[crate::types::Message],
    ) -> Result<Evaluation> {
        self.evaluator
            .evaluate(
                &definition.module_id,
                module,
                start.map(|s| s.memory.clone()),
                messages,
                &definition.environment(),
            )
            .await
    }

    /// 提交一次求值；没有可用内存（从创世开始且全部失败）时只记录结果
    pub async fn commit(&self, process_id: &str, evaluation: &Evaluation) -> Option<Advance> {
        let tip = match (&evaluation.memory, evaluation.last()) {
            (Some(memory), Some(last)) => {
                self.snapshots.put(process_id, last.message.nonce, memory.clone());
                Some(last)
            }
            _ => None,
        };
        self.store_results(process_id, &evaluation.results).await;
        let advance = match tip {
            Some(last) => {
                let advance = self.advance(process_id, last);
                self.log.prune_hints(process_id, last.message.nonce).await;
                Some(advance)
            }
            None => None,
        };
        for r in &evaluation.results {
            self.broadcaster.publish(ResultAnnouncement::new(process_id, r));
        }
        advance
    }

    /// 快照已写入，推进 checkpoint 并安排淘汰
    fn advance(&self, process_id: &str, last: &MessageResult) -> Advance {
        let nonce = last.message.nonce;
        let outcome = self.registry.advance(
            process_id,
            Checkpoint {
                nonce,
                timestamp: last.message.timestamp,
                message_id: last.message.id.clone(),
                result: last.result.clone(),
            },
        );
        match outcome {
            Advance::Advanced {
                previous: Some(previous),
            } => self
                .snapshots
                .evict_after(process_id, previous, self.eviction_grace),
            Advance::Advanced { previous: None } => {}
            Advance::Stale { current } if current > nonce => {
                debug!(process_id = %process_id, nonce, current, "提交落后，淘汰本次快照");
                self.snapshots
                    .evict_after(process_id, nonce, self.eviction_grace);
            }
            // 同一 nonce 已由另一方提交，快照内容相同
            Advance::Stale { .. } => {}
        }
        outcome
    }

    async fn store_results(&self, process_id: &str, results: &[MessageResult]) {
        if results.is_empty() {
            return;
        }
        let records = results
            .iter()
            .map(|r| {
                StoredResult::new(
                    process_id,
                    &r.message.id,
                    r.result.clone(),
                    r.message.nonce,
                    r.message.timestamp,
                )
            })
            .collect();
        if let Err(e) = self.results.put_batch(records).await {
            warn!(process_id = %process_id, error = %e, "结果写入持久化库失败");
        }
    }

    /// 丢弃某进程的全部缓存
    pub fn forget(&self, process_id: &str) {
        self.snapshots.forget(process_id);
        self.log.forget(process_id);
    }
}

#[cfg(test)]
pub(crate) mod fixture {
    use super::*;
    use crate::eval::FailurePolicy;
    use crate::results::InMemoryResultStore;
    use crate::testing::{FoldEngine, MockSource, RecordingBroadcaster, SlowResultStore};

    /// 由内存替身组装的 pipeline，测试可以直接观察每个协作方
    pub struct Fixture {
        pub source: Arc<MockSource>,
        pub engine: Arc<FoldEngine>,
        pub results: Arc<InMemoryResultStore>,
        pub broadcaster: Arc<RecordingBroadcaster>,
        pub pipeline: Arc<Pipeline>,
    }

    impl Fixture {
        pub fn new(source: MockSource) -> Self {
            Self::with(source, FoldEngine::new(), FailurePolicy::Skip, Duration::ZERO)
        }

        pub fn with(
            source: MockSource,
            engine: FoldEngine,
            policy: FailurePolicy,
            eviction_grace: Duration,
        ) -> Self {
            Self::build(source, engine, policy, eviction_grace, Duration::ZERO)
        }

        /// 持久化写入每批延迟 `write_delay`
        pub fn with_slow_results(source: MockSource, write_delay: Duration) -> Self {
            Self::build(source, FoldEngine::new(), FailurePolicy::Skip, Duration::ZERO, write_delay)
        }

        fn build(
            source: MockSource,
            engine: FoldEngine,
            policy: FailurePolicy,
            eviction_grace: Duration,
            write_delay: Duration,
        ) -> Self {
            let source = Arc::new(source);
            let engine = Arc::new(engine);
            let results = Arc::new(InMemoryResultStore::new());
            let store: Arc<dyn ResultStore> = if write_delay.is_zero() {
                results.clone()
            } else {
                Arc::new(SlowResultStore::new(results.clone(), write_delay))
            };
            let broadcaster = Arc::new(RecordingBroadcaster::new());
            let pipeline = Arc::new(Pipeline {
                artifacts: ArtifactStore::new(source.clone()),
                log: MessageLogStore::new(source.clone()),
                snapshots: MemorySnapshotStore::new(),
                evaluator: Evaluator::new(engine.clone()).with_policy(policy),
                registry: ProcessRegistry::new(),
                results: store,
                broadcaster: broadcaster.clone(),
                eviction_grace,
            });
            Self {
                source,
                engine,
                results,
                broadcaster,
                pipeline,
            }
        }

        /// 部署进程 `p` 并写入 `n` 条消息 m1..mn
        pub fn process_with(n: u64) -> MockSource {
            let source = MockSource::new().with_process("p", "owner", "mod");
            for i in 1..=n {
                source.push_message("p", &format!("m{}", i));
            }
            source
        }

        pub fn checkpoint(&self) -> Option<u64> {
            self.pipeline.registry.checkpoint("p").map(|c| c.nonce)
        }

        pub fn snapshot(&self, nonce: u64) -> Option<Vec<u8>> {
            self.pipeline.snapshots.get("p", nonce).map(|m| m.to_vec())
        }

        /// m1..mn 的折叠结果
        pub fn fold(n: u64) -> Vec<u8> {
            let data: Vec<String> = (1..=n).map(|i| format!("m{}", i)).collect();
            FoldEngine::expected_memory(data.iter().map(String::as_str))
        }
    }
}
