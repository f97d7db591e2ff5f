//! 按需结果查询
//!
//! 回答「进程 P 的消息 M（nonce N）的执行结果是什么」。先拉取消息本身，
//! 然后持有进程锁，按当前 checkpoint `C` 分五种情况：
//!
//! | 情况 | 条件 | 动作 |
//! |------|------|------|
//! | exact replay | `C == N` | 原样返回 checkpoint 上缓存的结果 |
//! | single advance | `C == N-1` | 从缓存内存只执行这一条 |
//! | gap | `C < N-1` | 加载 `(C, N]` 并依次执行 |
//! | already past | `C > N` | 从持久化结果库按消息 id 读取，缺失即 [`CuError::ResultNotFound`] |
//! | no cache | 无 checkpoint | 加载 `(0, N]` 从创世执行 |
//!
//! 快照缺失时重置 checkpoint，按 no cache 重新走一遍。锁是 RAII guard，
//! 任何返回路径都会释放。

use crate::error::{CuError, LogCorruption, Result};
use crate::pipeline::{Pipeline, StartingPoint};
use crate::registry::ProcessState;
use crate::types::{EvaluationResult, Message};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// 命中的分支，用于日志与测试
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Genesis,
    ExactReplay,
    SingleAdvance,
    Gap,
    AlreadyPast,
    NoCache,
}

pub struct ResultResolver {
    pipeline: Arc<Pipeline>,
}

impl ResultResolver {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    pub async fn resolve(&self, process_id: &str, message_id: &str) -> Result<EvaluationResult> {
        self.resolve_traced(process_id, message_id)
            .await
            .map(|(result, _)| result)
    }

    /// 同 [`resolve`](Self::resolve)，额外返回命中的分支
    pub async fn resolve_traced(
        &self,
        process_id: &str,
        message_id: &str,
    ) -> Result<(EvaluationResult, Resolution)> {
        let started = Instant::now();
        let Some(message) = self.pipeline.log.fetch_message(process_id, message_id).await? else {
            debug!(process_id = %process_id, "部署消息，返回空结果");
            return Ok((EvaluationResult::empty(), Resolution::Genesis));
        };

        let guard = self.pipeline.registry.lock(process_id).await;
        let (result, resolution) = match self.reconcile(process_id, &message).await {
            Err(e @ CuError::SnapshotMissing { .. }) => {
                self.pipeline.heal(process_id, &e);
                self.reconcile(process_id, &message).await?
            }
            other => other?,
        };
        drop(guard);
        // 未注册的进程不保留锁表项
        if self.pipeline.registry.state(process_id) == ProcessState::Unregistered {
            self.pipeline.registry.release_lock(process_id);
        }

        info!(
            process_id = %process_id,
            message_id = %message_id,
            nonce = message.nonce,
            resolution = ?resolution,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "🔍 结果已解析"
        );
        Ok((result, resolution))
    }

    async fn reconcile(
        &self,
        process_id: &str,
        message: &Message,
    ) -> Result<(EvaluationResult, Resolution)> {
        let target = message.nonce;
        let checkpoint = self.pipeline.registry.checkpoint(process_id);

        let start = match checkpoint {
            Some(cp) if cp.nonce == target => {
                return Ok((cp.result, Resolution::ExactReplay));
            }
            Some(cp) if cp.nonce > target => {
                debug!(process_id = %process_id, checkpoint = cp.nonce, target, "目标已被超越，查询持久化结果库");
                return self
                    .already_past(process_id, message)
                    .await
                    .map(|r| (r, Resolution::AlreadyPast));
            }
            Some(cp) => Some(self.pipeline.load_snapshot(process_id, cp)?),
            None => None,
        };

        let (messages, resolution) = match &start {
            Some(s) if s.checkpoint.nonce + 1 == target => (vec![message.clone()], Resolution::SingleAdvance),
            Some(s) => (
                self.pipeline
                    .log
                    .load_range(process_id, s.checkpoint.nonce, Some(target))
                    .await?,
                Resolution::Gap,
            ),
            None => (
                self.pipeline.log.load_range(process_id, 0, Some(target)).await?,
                Resolution::NoCache,
            ),
        };
        let result = self.replay(process_id, start.as_ref(), &messages, target).await?;
        Ok((result, resolution))
    }

    async fn replay(
        &self,
        process_id: &str,
        start: Option<&StartingPoint>,
        messages: &[Message],
        target: u64,
    ) -> Result<EvaluationResult> {
        let from = start.map_or(0, |s| s.checkpoint.nonce);
        if messages.last().map(|m| m.nonce) != Some(target) {
            return Err(LogCorruption::Gap {
                process_id: process_id.to_string(),
                previous: messages.last().map_or(from, |m| m.nonce),
                next: target,
            }
            .into());
        }

        let (definition, module) = self.pipeline.artifacts_for(process_id).await?;
        let evaluation = self
            .pipeline
            .evaluate(&definition, &module, start, messages)
            .await?;
        self.pipeline.commit(process_id, &evaluation).await;

        evaluation
            .last()
            .map(|r| r.result.clone())
            .ok_or_else(|| CuError::Other(format!("no result produced for {}:{}", process_id, target)))
    }

    async fn already_past(&self, process_id: &str, message: &Message) -> Result<EvaluationResult> {
        let stored = match self
            .pipeline
            .results
            .get_by_message_id(process_id, &message.id)
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                warn!(process_id = %process_id, message_id = %message.id, error = %e, "持久化结果库读取失败");
                None
            }
        };
        stored.map(|s| s.result).ok_or_else(|| CuError::ResultNotFound {
            process_id: process_id.to_string(),
            message_id: message.id.clone(),
            nonce: message.nonce,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::FailurePolicy;
    use crate::pipeline::fixture::Fixture;
    use crate::registry::Checkpoint;
    use crate::results::ResultStore;
    use crate::testing::{FoldEngine, MockSource};
    use crate::updater::{CycleOutcome, ProcessUpdater};
    use futures::future::join_all;
    use std::time::Duration;

    fn resolver(fx: &Fixture) -> ResultResolver {
        ResultResolver::new(fx.pipeline.clone())
    }

    fn delayed(n: u64, delay_ms: u64) -> Fixture {
        Fixture::with(
            Fixture::process_with(n),
            FoldEngine::new().with_delay_ms(delay_ms),
            FailurePolicy::Skip,
            Duration::ZERO,
        )
    }

    #[tokio::test]
    async fn test_genesis_message_yields_empty_result() {
        let fx = Fixture::new(Fixture::process_with(2));
        let (result, resolution) = resolver(&fx).resolve_traced("p", "p").await.unwrap();
        assert_eq!(resolution, Resolution::Genesis);
        assert_eq!(result, EvaluationResult::empty());
        assert_eq!(fx.engine.handle_calls(), 0);
    }

    #[tokio::test]
    async fn test_no_cache_replays_from_genesis() {
        let fx = Fixture::new(Fixture::process_with(5));
        let (result, resolution) = resolver(&fx).resolve_traced("p", "p-3").await.unwrap();

        assert_eq!(resolution, Resolution::NoCache);
        assert_eq!(result.output["nonce"], 3);
        assert_eq!(result.output["data"], "m3");
        assert_eq!(fx.checkpoint(), Some(3));
        assert_eq!(fx.snapshot(3), Some(Fixture::fold(3)));
        assert_eq!(fx.engine.handle_calls(), 3);
        assert_eq!(fx.pipeline.registry.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_exact_replay_is_idempotent() {
        let fx = Fixture::new(Fixture::process_with(5));
        let resolver = resolver(&fx);
        let (first, _) = resolver.resolve_traced("p", "p-3").await.unwrap();
        let (second, resolution) = resolver.resolve_traced("p", "p-3").await.unwrap();

        assert_eq!(resolution, Resolution::ExactReplay);
        assert_eq!(first, second);
        assert_eq!(fx.engine.handle_calls(), 3);
        assert_eq!(fx.checkpoint(), Some(3));
    }

    #[tokio::test]
    async fn test_single_advance_skips_log_fetch() {
        let fx = Fixture::new(Fixture::process_with(5));
        let resolver = resolver(&fx);
        resolver.resolve("p", "p-3").await.unwrap();
        let pages = fx.source.page_fetches();

        let (result, resolution) = resolver.resolve_traced("p", "p-4").await.unwrap();
        assert_eq!(resolution, Resolution::SingleAdvance);
        assert_eq!(result.output["nonce"], 4);
        assert_eq!(fx.source.page_fetches(), pages);
        assert_eq!(fx.engine.handle_calls(), 4);
        assert_eq!(fx.snapshot(4), Some(Fixture::fold(4)));
    }

    #[tokio::test]
    async fn test_single_advances_leave_no_timestamp_hints() {
        let fx = Fixture::new(Fixture::process_with(5));
        let resolver = resolver(&fx);
        for i in 1..=5 {
            resolver.resolve("p", &format!("p-{}", i)).await.unwrap();
        }
        assert_eq!(fx.checkpoint(), Some(5));
        assert_eq!(fx.pipeline.log.hint_count("p").await, 0);
    }

    #[tokio::test]
    async fn test_gap_fill_matches_fresh_replay() {
        let fx = Fixture::new(Fixture::process_with(8));
        let resolver = resolver(&fx);
        resolver.resolve("p", "p-3").await.unwrap();
        let (gap, resolution) = resolver.resolve_traced("p", "p-7").await.unwrap();
        assert_eq!(resolution, Resolution::Gap);

        let fresh = Fixture::new(Fixture::process_with(8));
        let (full, resolution) = ResultResolver::new(fresh.pipeline.clone())
            .resolve_traced("p", "p-7")
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::NoCache);

        assert_eq!(gap, full);
        assert_eq!(fx.snapshot(7), fresh.snapshot(7));
        assert_eq!(fx.snapshot(7), Some(Fixture::fold(7)));
        assert_eq!(fx.engine.handle_calls(), 7);
    }

    #[tokio::test]
    async fn test_already_past_reads_result_store() {
        let fx = Fixture::new(Fixture::process_with(5));
        let resolver = resolver(&fx);
        resolver.resolve("p", "p-5").await.unwrap();

        let (result, resolution) = resolver.resolve_traced("p", "p-2").await.unwrap();
        assert_eq!(resolution, Resolution::AlreadyPast);
        let stored = fx.results.get_by_message_id("p", "p-2").await.unwrap().unwrap();
        assert_eq!(result, stored.result);
        assert_eq!(fx.engine.handle_calls(), 5);
        assert_eq!(fx.checkpoint(), Some(5));
    }

    #[tokio::test]
    async fn test_already_past_without_stored_result() {
        let fx = Fixture::new(Fixture::process_with(5));
        fx.pipeline.registry.advance(
            "p",
            Checkpoint {
                nonce: 5,
                timestamp: 0,
                message_id: "p-5".to_string(),
                result: EvaluationResult::empty(),
            },
        );

        match resolver(&fx).resolve("p", "p-2").await {
            Err(CuError::ResultNotFound { nonce, message_id, .. }) => {
                assert_eq!(nonce, 2);
                assert_eq!(message_id, "p-2");
            }
            other => panic!("应该返回 ResultNotFound: {:?}", other),
        }
        assert_eq!(fx.engine.handle_calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_snapshot_heals_and_replays() {
        let fx = Fixture::new(Fixture::process_with(5));
        let resolver = resolver(&fx);
        resolver.resolve("p", "p-3").await.unwrap();
        fx.pipeline.snapshots.forget("p");

        let (result, resolution) = resolver.resolve_traced("p", "p-4").await.unwrap();
        assert_eq!(resolution, Resolution::NoCache);
        assert_eq!(result.output["nonce"], 4);
        assert_eq!(fx.snapshot(4), Some(Fixture::fold(4)));
    }

    #[tokio::test]
    async fn test_fetch_failure_propagates() {
        let fx = Fixture::new(Fixture::process_with(3));
        fx.source.fail_next_fetches(1);
        assert!(matches!(
            resolver(&fx).resolve("p", "p-2").await,
            Err(CuError::Fetch(_))
        ));
        assert_eq!(fx.checkpoint(), None);
    }

    #[tokio::test]
    async fn test_lock_released_after_failure() {
        let fx = Fixture::with(
            Fixture::process_with(3),
            FoldEngine::new(),
            FailurePolicy::Abort,
            Duration::ZERO,
        );
        let resolver = resolver(&fx);
        fx.engine.fail_next(1);
        assert!(resolver.resolve("p", "p-3").await.is_err());
        assert_eq!(fx.checkpoint(), None);

        let retry = tokio::time::timeout(Duration::from_secs(1), resolver.resolve("p", "p-3"))
            .await
            .expect("失败后进程锁应该已经释放");
        assert_eq!(retry.unwrap().output["nonce"], 3);
    }

    #[tokio::test]
    async fn test_same_process_requests_are_serialized() {
        let fx = delayed(5, 5);
        let resolver = resolver(&fx);

        let results = join_all((0..5).map(|_| resolver.resolve_traced("p", "p-5"))).await;
        let resolutions: Vec<Resolution> = results.into_iter().map(|r| r.unwrap().1).collect();

        // 只有第一个请求执行，其余命中 checkpoint
        assert_eq!(fx.engine.handle_calls(), 5);
        assert_eq!(
            resolutions.iter().filter(|r| **r == Resolution::NoCache).count(),
            1
        );
        assert_eq!(
            resolutions.iter().filter(|r| **r == Resolution::ExactReplay).count(),
            4
        );
    }

    #[tokio::test]
    async fn test_different_processes_run_in_parallel() {
        let source = MockSource::new()
            .with_process("a", "owner", "mod")
            .with_process("b", "owner", "mod");
        for pid in ["a", "b"] {
            source.push_message(pid, "x");
            source.push_message(pid, "y");
        }
        let fx = Fixture::with(
            source,
            FoldEngine::new().with_delay_ms(100),
            FailurePolicy::Skip,
            Duration::ZERO,
        );
        let resolver = resolver(&fx);

        let started = std::time::Instant::now();
        let (a, b) = tokio::join!(resolver.resolve("a", "a-2"), resolver.resolve("b", "b-2"));
        a.unwrap();
        b.unwrap();
        // 串行需要 ~400ms
        assert!(started.elapsed() < Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_superseded_snapshot_outlives_in_flight_update() {
        let fx = delayed(5, 30);
        let resolver = resolver(&fx);
        let updater = ProcessUpdater::new(fx.pipeline.clone(), Duration::from_secs(3600));
        resolver.resolve("p", "p-3").await.unwrap();

        // resolver 从 C=3 补齐到 5 并立即淘汰 3；updater 此时已拿到 3 的快照
        let (resolved, cycle) = tokio::join!(resolver.resolve_traced("p", "p-5"), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            updater.run_cycle("p").await
        });

        assert_eq!(resolved.unwrap().1, Resolution::Gap);
        assert_eq!(
            cycle.unwrap(),
            CycleOutcome::Evaluated {
                from: 3,
                to: 5,
                messages: 2,
                advanced: false
            }
        );
        assert_eq!(fx.checkpoint(), Some(5));
        assert_eq!(fx.snapshot(5), Some(Fixture::fold(5)));
        assert_eq!(fx.snapshot(3), None);
    }

    #[tokio::test]
    async fn test_already_past_waits_for_in_flight_write() {
        let fx = Fixture::with_slow_results(Fixture::process_with(5), Duration::from_millis(100));
        let resolver = resolver(&fx);
        let updater = ProcessUpdater::new(fx.pipeline.clone(), Duration::from_secs(3600));

        // updater 正在写 1..5 的结果时查询 3
        let (cycle, resolved) = tokio::join!(updater.run_cycle("p"), async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            resolver.resolve_traced("p", "p-3").await
        });

        cycle.unwrap();
        let (result, resolution) = resolved.unwrap();
        assert_ne!(resolution, Resolution::AlreadyPast);
        assert_eq!(result.output["nonce"], 3);
        assert_eq!(result.output["data"], "m3");
        assert_eq!(fx.checkpoint(), Some(5));
        assert_eq!(fx.snapshot(5), Some(Fixture::fold(5)));
    }
}
