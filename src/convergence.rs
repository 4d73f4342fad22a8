//! 収束ループ
//!
//! 抽出 → マージ → 描画 → 比較 → 解析 → ロック更新 → 継続判定 を
//! 目標精度・ラウンド上限・予算のいずれかに達するまで繰り返す。
//!
//! ラウンドは直列に実行する（前ラウンドの解析が次ラウンドの指示になるため）。
//! ラウンド内の棚ごとの再抽出だけは並列に投げる。

use crate::collaborators::{
    Escalation, ExtractionOutput, ExtractionProvider, VisualComparator, VisualRenderer,
};
use crate::config::ConvergenceConfig;
use crate::cost::CostTracker;
use crate::error::{Result, ShelfAiError};
use crate::job::{ExtractionJob, IterationRecord, RunState, RunStatus};
use futures::future::join_all;
use shelf_ai_common::{
    merge_entities, AccuracyAnalysis, AccuracyAnalyzer, ComparisonResult, Entity,
    ExtractionFocus, GridShape, IterationStateManager,
};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};

/// ランの中断要求
///
/// ラウンド開始前に確認し、実行中のラウンドでは抽出・比較の待機を打ち切る。
/// 打ち切られた呼び出しの future は破棄される（CLI子プロセスは kill_on_drop で終了）。
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<CancelState>);

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// 中断されるまで待つ
    pub async fn cancelled(&self) {
        let notified = self.0.notify.notified();
        tokio::pin!(notified);
        // 登録してからフラグを見る（通知の取りこぼし防止）
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Initializing,
    /// 初回ラウンドで棚構造が確定した
    StructureLocked,
    RoundActive,
    Converged,
    Exhausted,
    Failed,
}

/// 1ラウンド分の抽出結果
#[derive(Debug, Default)]
struct RoundExtraction {
    entities: Vec<Entity>,
    cost: f64,
    grid: Option<GridShape>,
    fallback_shelves: Vec<u32>,
}

pub struct ConvergenceLoop {
    provider: Arc<dyn ExtractionProvider>,
    renderer: Arc<dyn VisualRenderer>,
    comparator: Arc<dyn VisualComparator>,
    escalation: Arc<dyn Escalation>,
    config: ConvergenceConfig,
}

impl ConvergenceLoop {
    pub fn new(
        provider: Arc<dyn ExtractionProvider>,
        renderer: Arc<dyn VisualRenderer>,
        comparator: Arc<dyn VisualComparator>,
        escalation: Arc<dyn Escalation>,
        config: ConvergenceConfig,
    ) -> Self {
        Self {
            provider,
            renderer,
            comparator,
            escalation,
            config,
        }
    }

    pub fn config(&self) -> &ConvergenceConfig {
        &self.config
    }

    /// ジョブを収束するまで実行する
    ///
    /// 目標に届かなかっただけならエラーにせず、EXHAUSTED の状態を返す。
    /// 予算切れ・プロバイダ障害は `RunAborted`（中断時点の状態付き）で返す。
    pub async fn run(&self, job: &ExtractionJob) -> Result<RunState> {
        let config = self.config.for_job(job);
        let tracker = CostTracker::new(config.budget);
        self.run_with(job, &tracker, &CancelHandle::new()).await
    }

    /// 台帳と中断ハンドルを呼び出し側が持つ版
    pub async fn run_with(
        &self,
        job: &ExtractionJob,
        tracker: &CostTracker,
        cancel: &CancelHandle,
    ) -> Result<RunState> {
        let config = self.config.for_job(job);
        config.validate()?;

        let analyzer = AccuracyAnalyzer::new(config.analyzer.clone());
        let mut manager = IterationStateManager::new(config.lock_policy.clone());
        let mut state = RunState::new(&job.job_id);
        let mut phase = LoopPhase::Initializing;

        // 既知の棚構造（ジョブ指定 or 初回ラウンドで確定）
        let mut known_grid = job.grid;
        let mut estimated_grid: Option<GridShape> = None;
        let mut focus = ExtractionFocus::initial();
        let mut previous_entities: Vec<Entity> = Vec::new();
        let mut previous_analysis: Option<AccuracyAnalysis> = None;

        info!(
            job = %job.job_id,
            target = config.target_accuracy,
            max_rounds = config.max_rounds,
            budget = tracker.budget(),
            "ラン開始"
        );

        for round in 1..=config.max_rounds {
            if cancel.is_cancelled() {
                return Ok(self.finish_cancelled(state, &manager, tracker, round));
            }

            if let Err(e) = check_budget(tracker, &config) {
                return self
                    .abort(state, &manager, tracker, round, RunStatus::Exhausted, e)
                    .await;
            }

            transition(&mut phase, LoopPhase::RoundActive, round);
            let started = Instant::now();
            let locked = manager.materialize_locked_entities();

            // 1. 抽出
            let extracted = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.extract_round(job, round, &focus, &locked, &previous_entities, tracker, &config) => Some(result),
            };
            let extraction = match extracted {
                None => return Ok(self.finish_cancelled(state, &manager, tracker, round)),
                Some(Ok(extraction)) => extraction,
                Some(Err(e)) => {
                    let status = match e {
                        ShelfAiError::BudgetExceeded { .. } => RunStatus::Exhausted,
                        _ => RunStatus::Failed,
                    };
                    return self.abort(state, &manager, tracker, round, status, e).await;
                }
            };

            if round == 1 {
                if let Some(grid) = extraction.grid {
                    if known_grid.is_none() && grid.confidence >= config.structure_lock_confidence {
                        info!(
                            job = %job.job_id,
                            shelves = grid.shelf_count,
                            slots = grid.max_slots,
                            confidence = grid.confidence,
                            "棚構造をロック"
                        );
                        known_grid = Some(grid);
                        state.structure_locked = true;
                        transition(&mut phase, LoopPhase::StructureLocked, round);
                    } else {
                        estimated_grid = Some(grid);
                    }
                }
            }

            // 2. マージ（ロック済み優先）
            let merged = merge_entities(&locked, &extraction.entities);
            let render_grid = match known_grid {
                Some(grid) => grid,
                None => {
                    let inferred = GridShape::infer(&merged);
                    estimated_grid.map_or(inferred, |g| g.union(&inferred))
                }
            };

            // 3-4. 描画・比較・解析
            let compared = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.compare_round(job, &merged, &render_grid, &config) => Some(result),
            };
            let Some(compared) = compared else {
                return Ok(self.finish_cancelled(state, &manager, tracker, round));
            };
            let analysis = match compared {
                Ok(comparison) => analyzer.analyze(
                    round,
                    &comparison,
                    known_grid.as_ref(),
                    previous_analysis.as_ref(),
                ),
                Err(e) => {
                    warn!(job = %job.job_id, round, error = %e, "比較不能のため精度0として継続");
                    analyzer.analyze_unavailable(round, &merged, previous_analysis.as_ref())
                }
            };

            // 5. ロック更新と次ラウンドの指示
            let mut next_focus =
                manager.evaluate_round(round, &merged, &analysis, known_grid.as_ref());
            next_focus.grid = known_grid;

            // 6. ベスト更新
            if state.record_best(round, analysis.overall_accuracy, &merged) {
                debug!(job = %job.job_id, round, accuracy = analysis.overall_accuracy, "ベスト更新");
            }

            info!(
                job = %job.job_id,
                round,
                accuracy = analysis.overall_accuracy,
                locks = manager.lock_count(),
                failures = analysis.total_failures,
                next_targets = next_focus.reextract_positions().len(),
                trend = ?analysis.delta.as_ref().map(|d| d.trend),
                "ラウンド完了"
            );

            let accuracy = analysis.overall_accuracy;
            state.history.push(IterationRecord {
                round,
                analysis: analysis.clone(),
                entities: merged.clone(),
                cost: extraction.cost,
                duration_ms: started.elapsed().as_millis() as u64,
                fallback_shelves: extraction.fallback_shelves,
            });
            self.snapshot(&mut state, &manager, tracker);

            // 7. 継続判定
            if accuracy >= config.target_accuracy {
                transition(&mut phase, LoopPhase::Converged, round);
                state.finish(RunStatus::Converged, None);
                info!(job = %job.job_id, round, accuracy, "収束");
                return Ok(state);
            }

            if round == config.max_rounds {
                break;
            }

            previous_entities = merged;
            previous_analysis = Some(analysis);
            focus = next_focus;
        }

        transition(&mut phase, LoopPhase::Exhausted, state.rounds());
        state.finish(RunStatus::Exhausted, None);
        warn!(
            job = %job.job_id,
            rounds = state.rounds(),
            best = state.best_accuracy,
            "ラウンド上限に到達（未収束）"
        );
        self.escalate(&state).await;
        Ok(state)
    }

    async fn extract_round(
        &self,
        job: &ExtractionJob,
        round: u32,
        focus: &ExtractionFocus,
        locked: &[Entity],
        previous: &[Entity],
        tracker: &CostTracker,
        config: &ConvergenceConfig,
    ) -> Result<RoundExtraction> {
        let timeout = config.request_timeout();

        // 初回（またはシェルフ指定なし）は画像全体を1リクエストで
        if focus.is_initial() || focus.reextract.is_empty() {
            let output = self.request(&job.image, focus, locked, timeout).await?;
            tracker.add_cost(&format!("round-{}/extract", round), output.cost)?;
            return Ok(RoundExtraction {
                entities: stamp(output.entities, round),
                cost: output.cost,
                grid: output.grid,
                fallback_shelves: Vec::new(),
            });
        }

        let limiter = Semaphore::new(config.shelf_concurrency);
        let mut requests = Vec::new();
        for shelf in focus.shelves() {
            let shelf_focus = focus.for_shelf(shelf);
            let shelf_locked: Vec<Entity> = locked
                .iter()
                .filter(|e| e.position.shelf == shelf)
                .cloned()
                .collect();
            let limiter = &limiter;
            requests.push(async move {
                let _permit = limiter.acquire().await;
                let result = self
                    .request(&job.image, &shelf_focus, &shelf_locked, timeout)
                    .await;
                (shelf, result)
            });
        }

        let mut results = join_all(requests).await;
        results.sort_by_key(|(shelf, _)| *shelf);

        let total = results.len();
        let mut extraction = RoundExtraction::default();
        for (shelf, result) in results {
            match result {
                Ok(output) => {
                    tracker.add_cost(&format!("round-{}/shelf-{}", round, shelf), output.cost)?;
                    extraction.cost += output.cost;
                    extraction.entities.extend(
                        stamp(output.entities, round)
                            .into_iter()
                            .filter(|e| e.position.shelf == shelf),
                    );
                }
                Err(e) => {
                    warn!(job = %job.job_id, round, shelf, error = %e, "棚の抽出に失敗、前ラウンドの値を引き継ぐ");
                    extraction.fallback_shelves.push(shelf);
                }
            }
        }

        if extraction.fallback_shelves.len() == total {
            return Err(ShelfAiError::Provider(format!(
                "ラウンド{}の全{}棚で抽出に失敗",
                round, total
            )));
        }

        if !extraction.fallback_shelves.is_empty() {
            let partial = ShelfAiError::PartialExtraction {
                shelves: extraction.fallback_shelves.clone(),
            };
            warn!(job = %job.job_id, round, "{}", partial);
            extraction.entities.extend(
                previous
                    .iter()
                    .filter(|e| extraction.fallback_shelves.contains(&e.position.shelf))
                    .cloned(),
            );
        }

        Ok(extraction)
    }

    async fn request(
        &self,
        image: &Path,
        focus: &ExtractionFocus,
        locked: &[Entity],
        timeout: Option<Duration>,
    ) -> Result<ExtractionOutput> {
        with_timeout(timeout, "抽出", self.provider.extract(image, focus, locked)).await
    }

    async fn compare_round(
        &self,
        job: &ExtractionJob,
        entities: &[Entity],
        grid: &GridShape,
        config: &ConvergenceConfig,
    ) -> Result<ComparisonResult> {
        let timeout = config.request_timeout();
        let artifact = with_timeout(timeout, "描画", self.renderer.render(entities, grid))
            .await
            .map_err(|e| ShelfAiError::ComparisonUnavailable(format!("描画失敗: {}", e)))?;
        with_timeout(timeout, "比較", self.comparator.compare(&job.image, &artifact))
            .await
            .map_err(|e| ShelfAiError::ComparisonUnavailable(format!("比較失敗: {}", e)))
    }

    /// 中断で終わったラン。実行中だったラウンドは履歴に残さない
    fn finish_cancelled(
        &self,
        mut state: RunState,
        manager: &IterationStateManager,
        tracker: &CostTracker,
        round: u32,
    ) -> RunState {
        info!(job = %state.job_id, round, "中断要求によりラン停止");
        self.snapshot(&mut state, manager, tracker);
        state.finish(RunStatus::Failed, Some("cancelled".into()));
        state
    }

    fn snapshot(&self, state: &mut RunState, manager: &IterationStateManager, tracker: &CostTracker) {
        state.locked_positions = manager.locked_positions().values().cloned().collect();
        state.total_cost = tracker.total_charged();
    }

    async fn abort(
        &self,
        mut state: RunState,
        manager: &IterationStateManager,
        tracker: &CostTracker,
        round: u32,
        status: RunStatus,
        source: ShelfAiError,
    ) -> Result<RunState> {
        self.snapshot(&mut state, manager, tracker);
        state.finish(status, Some(source.to_string()));
        error!(job = %state.job_id, round, ?status, error = %source, "ラン中断");
        self.escalate(&state).await;
        Err(ShelfAiError::RunAborted {
            round,
            source: Box::new(source),
            state: Box::new(state),
        })
    }

    async fn escalate(&self, state: &RunState) {
        if let Err(e) = self.escalation.notify(state).await {
            warn!(job = %state.job_id, error = %e, "エスカレーション通知に失敗");
        }
    }
}

/// ラウンド開始前の残予算確認
fn check_budget(tracker: &CostTracker, config: &ConvergenceConfig) -> Result<()> {
    let remaining = tracker.remaining_budget();
    if remaining <= 0.0 || remaining < config.estimated_round_cost {
        return Err(ShelfAiError::BudgetExceeded {
            requested: config.estimated_round_cost,
            remaining,
        });
    }
    Ok(())
}

/// プロバイダ出力に生成ラウンドを記録する
fn stamp(entities: Vec<Entity>, round: u32) -> Vec<Entity> {
    entities
        .into_iter()
        .map(|mut e| {
            e.round = round;
            e.locked_round = None;
            e.confidence = e.confidence.clamp(0.0, 1.0);
            e
        })
        .collect()
}

async fn with_timeout<T>(
    timeout: Option<Duration>,
    label: &str,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
            ShelfAiError::Timeout(format!("{}が{}秒以内に終わりません", label, limit.as_secs()))
        })?,
        None => call.await,
    }
}

fn transition(phase: &mut LoopPhase, next: LoopPhase, round: u32) {
    if *phase != next {
        debug!(round, from = ?*phase, to = ?next, "フェーズ遷移");
        *phase = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_handle_shared() {
        let handle = CancelHandle::new();
        let clone = handle.clone();
        assert!(!handle.is_cancelled());
        clone.cancel();
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let handle = CancelHandle::new();
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("中断で起きるはず")
            .unwrap();

        // 中断済みなら即座に返る
        tokio::time::timeout(Duration::from_millis(100), handle.cancelled())
            .await
            .expect("即座に返るはず");
    }

    #[test]
    fn test_check_budget() {
        let config = ConvergenceConfig {
            estimated_round_cost: 0.3,
            ..Default::default()
        };
        let tracker = CostTracker::new(1.0);
        assert!(check_budget(&tracker, &config).is_ok());

        tracker.add_cost("x", 0.8).unwrap();
        let err = check_budget(&tracker, &config).unwrap_err();
        assert!(matches!(err, ShelfAiError::BudgetExceeded { .. }));
    }

    #[test]
    fn test_stamp_sets_round() {
        let mut entity = Entity::new(shelf_ai_common::Position::new(1, 1), 0.5);
        entity.locked_round = Some(1);
        entity.confidence = 1.5;
        let stamped = stamp(vec![entity], 3);
        assert_eq!(stamped[0].round, 3);
        assert_eq!(stamped[0].locked_round, None);
        assert_eq!(stamped[0].confidence, 1.0);
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, ShelfAiError>(1)
        };
        let err = with_timeout(Some(Duration::from_millis(10)), "テスト", slow)
            .await
            .unwrap_err();
        assert!(matches!(err, ShelfAiError::Timeout(_)));
    }
}
