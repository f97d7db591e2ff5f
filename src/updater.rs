//! 后台进程更新循环
//!
//! ```text
//! Unregistered ──register──▶ Registering ──首轮成功──▶ Active ──unregister──▶ Unregistered
//!                                  │
//!                                  └──首轮失败──▶ Unregistered（返回错误）
//! ```
//!
//! 每个 Active 进程一个任务：冷却 → 一轮更新 → 冷却 → …，直到取消令牌触发。
//! 单轮失败只记录日志，不会结束循环。updater 不持有进程锁，提交通过
//! checkpoint 的比较后前进与 resolver 协调。

use crate::error::{CuError, Result};
use crate::pipeline::Pipeline;
use crate::registry::{Advance, Registration};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// 单轮更新的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// 没有新消息
    Idle,
    /// 处理了 `(from, to]` 区间的 `messages` 条消息
    Evaluated {
        from: u64,
        to: u64,
        messages: usize,
        advanced: bool,
    },
}

pub struct ProcessUpdater {
    pipeline: Arc<Pipeline>,
    cooldown: Duration,
    tasks: TaskTracker,
}

impl ProcessUpdater {
    pub fn new(pipeline: Arc<Pipeline>, cooldown: Duration) -> Self {
        Self {
            pipeline,
            cooldown,
            tasks: TaskTracker::new(),
        }
    }

    /// 注册进程并启动后台循环；已注册时直接返回。
    ///
    /// 返回前同步跑完第一轮更新：返回 `Ok` 时第一个 checkpoint 已经存在（或日志为空）。
    pub async fn register(&self, process_id: &str) -> Result<()> {
        let token = match self.pipeline.registry.begin_registration(process_id) {
            Registration::AlreadyActive => {
                debug!(process_id = %process_id, "进程已注册，忽略");
                return Ok(());
            }
            Registration::InProgress(mut ready) => {
                debug!(process_id = %process_id, "等待进行中的注册完成");
                return ready.wait_for(|active| *active).await.map(|_| ()).map_err(|_| {
                    CuError::Registration(format!("registration of {} did not complete", process_id))
                });
            }
            Registration::Started(token) => token,
        };

        info!(process_id = %process_id, "📝 注册进程，执行首轮更新");
        if let Err(e) = run_cycle(&self.pipeline, process_id).await {
            warn!(process_id = %process_id, error = %e, "首轮更新失败，注册取消");
            self.pipeline.registry.abort_registration(process_id);
            return Err(e);
        }
        self.pipeline.registry.activate(process_id);

        if token.is_cancelled() {
            debug!(process_id = %process_id, "注册期间已被注销，不启动循环");
            return Ok(());
        }
        self.tasks.spawn(update_loop(
            self.pipeline.clone(),
            process_id.to_string(),
            token,
            self.cooldown,
        ));
        Ok(())
    }

    /// 停止后台循环并释放该进程的锁、checkpoint、快照与日志缓存
    pub fn unregister(&self, process_id: &str) -> bool {
        let removed = self.pipeline.registry.unregister(process_id);
        if removed {
            self.pipeline.forget(process_id);
        }
        removed
    }

    /// 手动执行一轮更新（不经过后台循环）
    pub async fn run_cycle(&self, process_id: &str) -> Result<CycleOutcome> {
        run_cycle(&self.pipeline, process_id).await
    }

    /// 等待所有后台循环退出；调用前应先取消注册表的根令牌
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        info!("所有更新循环已停止");
    }
}

async fn update_loop(
    pipeline: Arc<Pipeline>,
    process_id: String,
    token: CancellationToken,
    cooldown: Duration,
) {
    info!(process_id = %process_id, cooldown_ms = cooldown.as_millis() as u64, "🔁 更新循环已启动");
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(cooldown) => {}
        }
        let outcome = tokio::select! {
            _ = token.cancelled() => break,
            outcome = run_cycle(&pipeline, &process_id) => outcome,
        };
        if let Err(e) = outcome {
            warn!(process_id = %process_id, error = %e, "更新失败，冷却后重试");
        }
    }
    info!(process_id = %process_id, "更新循环已停止");
}

async fn run_cycle(pipeline: &Pipeline, process_id: &str) -> Result<CycleOutcome> {
    let started = Instant::now();
    let (definition, module) = pipeline.artifacts_for(process_id).await?;

    let start = pipeline.starting_point(process_id);
    let from = start.as_ref().map_or(0, |s| s.checkpoint.nonce);

    let messages = pipeline.log.load_range(process_id, from, None).await?;
    if messages.is_empty() {
        debug!(process_id = %process_id, checkpoint = from, "没有新消息");
        return Ok(CycleOutcome::Idle);
    }

    let evaluation = pipeline
        .evaluate(&definition, &module, start.as_ref(), &messages)
        .await?;
    let to = messages.last().map_or(from, |m| m.nonce);
    let advanced = matches!(
        pipeline.commit(process_id, &evaluation).await,
        Some(Advance::Advanced { .. })
    );

    info!(
        process_id = %process_id,
        from,
        to,
        messages = messages.len(),
        advanced,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "🔄 更新完成"
    );
    Ok(CycleOutcome::Evaluated {
        from,
        to,
        messages: messages.len(),
        advanced,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::FailurePolicy;
    use crate::pipeline::fixture::Fixture;
    use crate::registry::ProcessState;
    use crate::results::ResultStore;
    use crate::testing::FoldEngine;

    fn updater(fx: &Fixture, cooldown_ms: u64) -> Arc<ProcessUpdater> {
        Arc::new(ProcessUpdater::new(
            fx.pipeline.clone(),
            Duration::from_millis(cooldown_ms),
        ))
    }

    async fn stop(fx: &Fixture, updater: &ProcessUpdater) {
        fx.pipeline.registry.shutdown();
        updater.shutdown().await;
    }

    #[tokio::test]
    async fn test_register_runs_first_cycle() {
        let fx = Fixture::new(Fixture::process_with(5));
        let updater = updater(&fx, 3_600_000);

        updater.register("p").await.unwrap();

        assert_eq!(fx.pipeline.registry.state("p"), ProcessState::Active);
        assert_eq!(fx.checkpoint(), Some(5));
        assert_eq!(fx.snapshot(5), Some(Fixture::fold(5)));
        assert_eq!(fx.results.len().await, 5);
        assert_eq!(fx.broadcaster.nonces("p"), vec![1, 2, 3, 4, 5]);
        stop(&fx, &updater).await;
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let fx = Fixture::new(Fixture::process_with(3));
        let updater = updater(&fx, 3_600_000);

        updater.register("p").await.unwrap();
        updater.register("p").await.unwrap();

        assert_eq!(fx.engine.instantiations(), 1);
        assert_eq!(fx.engine.handle_calls(), 3);
        stop(&fx, &updater).await;
    }

    #[tokio::test]
    async fn test_concurrent_register_runs_one_cycle() {
        let fx = Fixture::with(
            Fixture::process_with(3),
            FoldEngine::new().with_delay_ms(10),
            FailurePolicy::Skip,
            Duration::ZERO,
        );
        let updater = updater(&fx, 3_600_000);

        let (a, b) = tokio::join!(updater.register("p"), updater.register("p"));
        a.unwrap();
        b.unwrap();

        // 第二个调用者等待第一个完成，返回时 checkpoint 已存在
        assert_eq!(fx.checkpoint(), Some(3));
        assert_eq!(fx.engine.instantiations(), 1);
        stop(&fx, &updater).await;
    }

    #[tokio::test]
    async fn test_failed_register_can_be_retried() {
        let fx = Fixture::new(Fixture::process_with(2));
        let updater = updater(&fx, 3_600_000);

        fx.source.fail_next_fetches(1);
        assert!(updater.register("p").await.is_err());
        assert_eq!(fx.pipeline.registry.state("p"), ProcessState::Unregistered);
        assert_eq!(fx.checkpoint(), None);

        updater.register("p").await.unwrap();
        assert_eq!(fx.checkpoint(), Some(2));
        stop(&fx, &updater).await;
    }

    #[tokio::test]
    async fn test_cycle_is_idle_without_new_messages() {
        let fx = Fixture::new(Fixture::process_with(2));
        let updater = updater(&fx, 3_600_000);

        let first = updater.run_cycle("p").await.unwrap();
        assert_eq!(
            first,
            CycleOutcome::Evaluated {
                from: 0,
                to: 2,
                messages: 2,
                advanced: true
            }
        );
        assert_eq!(updater.run_cycle("p").await.unwrap(), CycleOutcome::Idle);
        assert_eq!(fx.engine.handle_calls(), 2);
    }

    #[tokio::test]
    async fn test_checkpoints_only_move_forward() {
        let fx = Fixture::new(Fixture::process_with(2));
        let updater = updater(&fx, 3_600_000);

        let mut seen = Vec::new();
        updater.run_cycle("p").await.unwrap();
        seen.push(fx.checkpoint());
        for batch in [2, 1, 3] {
            for i in 0..batch {
                fx.source.push_message("p", &format!("x{}", i));
            }
            updater.run_cycle("p").await.unwrap();
            seen.push(fx.checkpoint());
        }

        assert_eq!(seen, vec![Some(2), Some(4), Some(5), Some(8)]);
        assert_eq!(fx.pipeline.snapshots.checkpoints("p"), vec![8]);
        // 增量执行：每条消息只执行一次
        assert_eq!(fx.engine.handle_calls(), 8);
    }

    #[tokio::test]
    async fn test_missing_snapshot_replays_from_genesis() {
        let fx = Fixture::new(Fixture::process_with(3));
        let updater = updater(&fx, 3_600_000);
        updater.run_cycle("p").await.unwrap();

        fx.pipeline.snapshots.forget("p");
        fx.source.push_message("p", "m4");
        let outcome = updater.run_cycle("p").await.unwrap();

        assert_eq!(
            outcome,
            CycleOutcome::Evaluated {
                from: 0,
                to: 4,
                messages: 4,
                advanced: true
            }
        );
        assert_eq!(fx.snapshot(4), Some(Fixture::fold(4)));
    }

    #[tokio::test]
    async fn test_loop_survives_fetch_failure() {
        let fx = Fixture::new(Fixture::process_with(1));
        let updater = updater(&fx, 10);
        updater.register("p").await.unwrap();

        fx.source.push_message("p", "m2");
        fx.source.fail_next_fetches(2);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(fx.checkpoint(), Some(2));
        assert_eq!(fx.snapshot(2), Some(Fixture::fold(2)));
        stop(&fx, &updater).await;
    }

    #[tokio::test]
    async fn test_engine_error_under_skip_policy_commits_nothing() {
        let fx = Fixture::new(Fixture::process_with(1));
        let updater = updater(&fx, 3_600_000);
        updater.run_cycle("p").await.unwrap();

        fx.source.push_message("p", "m2");
        fx.engine.fail_next(1);
        assert!(updater.run_cycle("p").await.is_err());
        assert_eq!(fx.checkpoint(), Some(1));
        assert!(fx.results.get_by_message_id("p", "p-2").await.unwrap().is_none());

        assert_eq!(
            updater.run_cycle("p").await.unwrap(),
            CycleOutcome::Evaluated {
                from: 1,
                to: 2,
                messages: 1,
                advanced: true
            }
        );
        assert_eq!(fx.checkpoint(), Some(2));
        assert_eq!(fx.snapshot(2), Some(Fixture::fold(2)));
        let stored = fx.results.get_by_message_id("p", "p-2").await.unwrap().unwrap();
        assert!(!stored.result.is_error());
    }

    #[tokio::test]
    async fn test_abort_policy_retries_whole_range() {
        let fx = Fixture::with(
            Fixture::process_with(1),
            FoldEngine::new(),
            FailurePolicy::Abort,
            Duration::ZERO,
        );
        let updater = updater(&fx, 10);
        updater.register("p").await.unwrap();

        fx.source.push_message("p", "m2");
        fx.source.push_message("p", "m3");
        fx.engine.fail_next(1);
        tokio::time::sleep(Duration::from_millis(200)).await;

        // 失败的那一轮不提交任何东西，下一轮从 checkpoint 1 重新开始
        assert_eq!(fx.checkpoint(), Some(3));
        assert_eq!(fx.snapshot(3), Some(Fixture::fold(3)));
        let stored = fx.results.get_by_message_id("p", "p-2").await.unwrap().unwrap();
        assert!(!stored.result.is_error());
        stop(&fx, &updater).await;
    }

    #[tokio::test]
    async fn test_unregister_stops_loop() {
        let fx = Fixture::new(Fixture::process_with(1));
        let updater = updater(&fx, 10);
        updater.register("p").await.unwrap();

        assert!(updater.unregister("p"));
        assert!(!updater.unregister("p"));
        assert_eq!(fx.checkpoint(), None);
        assert!(fx.pipeline.snapshots.checkpoints("p").is_empty());

        fx.source.push_message("p", "m2");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fx.engine.handle_calls(), 1);
        stop(&fx, &updater).await;
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_loops() {
        let fx = Fixture::new(Fixture::process_with(1));
        let updater = updater(&fx, 10);
        updater.register("p").await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), stop(&fx, &updater))
            .await
            .expect("shutdown 应在取消后立即完成");
        assert!(fx.pipeline.registry.registered().is_empty());
        assert_eq!(fx.checkpoint(), None);
    }
}
