//! 精度解析
//!
//! 比較器の差分（一致・不一致・欠落・余剰）を位置ごとの信頼度表に変換し、
//! ロック候補と再抽出すべき失敗箇所を決める。
//!
//! 全体精度は比較器の類似度をそのまま採用し、ここでは再計算しない。

use crate::types::{
    AccuracyAnalysis, ComparisonItem, ComparisonResult, Entity, ErrorCategory, Evidence,
    FailureArea, GridShape, LockCandidate, LockReason, Position, PositionConfidence, RoundDelta,
    Trend,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// 解析の閾値
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalyzerConfig {
    /// これ以上でロック候補
    pub lock_threshold: f64,
    /// これ未満で失敗箇所
    pub failure_threshold: f64,
    /// 次ラウンドへ渡す失敗箇所の上限
    pub max_failure_areas: usize,
    /// トレンド判定のヒステリシス幅
    pub trend_band: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            lock_threshold: 0.95,
            failure_threshold: 0.75,
            max_failure_areas: 10,
            trend_band: 0.1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AccuracyAnalyzer {
    config: AnalyzerConfig,
}

impl AccuracyAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// 比較結果からラウンドの精度解析を作る
    ///
    /// # Arguments
    /// * `round` - ラウンド番号
    /// * `comparison` - 比較器の出力
    /// * `grid` - 棚構造。範囲外の位置は捨てる
    /// * `previous` - 前ラウンドの解析（差分計算用）
    pub fn analyze(
        &self,
        round: u32,
        comparison: &ComparisonResult,
        grid: Option<&GridShape>,
        previous: Option<&AccuracyAnalysis>,
    ) -> AccuracyAnalysis {
        let mut table: BTreeMap<Position, PositionConfidence> = BTreeMap::new();

        let lists: [(&[ComparisonItem], Evidence, ErrorCategory); 4] = [
            (comparison.matches.as_slice(), Evidence::Match, ErrorCategory::Unknown),
            (comparison.mismatches.as_slice(), Evidence::Mismatch, ErrorCategory::Unknown),
            (comparison.missing.as_slice(), Evidence::Missing, ErrorCategory::MissingProduct),
            (comparison.extra.as_slice(), Evidence::Extra, ErrorCategory::PositionUncertain),
        ];

        for (items, source, default_category) in lists {
            for item in items {
                if let Some(grid) = grid {
                    if grid.shelf_count > 0 && !grid.contains(item.position) {
                        debug!(position = %item.position, "グリッド範囲外の比較結果を無視");
                        continue;
                    }
                }

                let entry = match source {
                    Evidence::Missing => PositionConfidence {
                        position: item.position,
                        confidence: 0.0,
                        category: ErrorCategory::MissingProduct,
                        source,
                        evidence: item.evidence.clone(),
                    },
                    _ => PositionConfidence {
                        position: item.position,
                        confidence: item.confidence.clamp(0.0, 1.0),
                        category: item.category.unwrap_or(default_category),
                        source,
                        evidence: item.evidence.clone(),
                    },
                };

                // 同じ位置が複数回報告された場合は低い方を採用
                match table.get(&item.position) {
                    Some(existing) if existing.confidence <= entry.confidence => {}
                    _ => {
                        table.insert(item.position, entry);
                    }
                }
            }
        }

        self.build(round, comparison.overall_similarity, table, previous)
    }

    /// 比較不能（描画・比較失敗）時の解析
    ///
    /// 全体精度を0として次ラウンドを強制する。位置ごとの信頼度は
    /// プロバイダの自己申告をそのまま使う。
    pub fn analyze_unavailable(
        &self,
        round: u32,
        entities: &[Entity],
        previous: Option<&AccuracyAnalysis>,
    ) -> AccuracyAnalysis {
        let table = entities
            .iter()
            .map(|e| {
                (
                    e.position,
                    PositionConfidence {
                        position: e.position,
                        confidence: e.confidence.clamp(0.0, 1.0),
                        category: ErrorCategory::Unknown,
                        source: Evidence::Provider,
                        evidence: "comparison unavailable".to_string(),
                    },
                )
            })
            .collect();

        self.build(round, 0.0, table, previous)
    }

    fn build(
        &self,
        round: u32,
        overall_similarity: f64,
        table: BTreeMap<Position, PositionConfidence>,
        previous: Option<&AccuracyAnalysis>,
    ) -> AccuracyAnalysis {
        let lock_candidates: Vec<LockCandidate> = table
            .values()
            .filter(|p| p.confidence >= self.config.lock_threshold)
            .map(|p| LockCandidate {
                position: p.position,
                confidence: p.confidence,
                reason: LockReason::HighConfidence,
            })
            .collect();

        let mut failure_areas: Vec<FailureArea> = table
            .values()
            .filter(|p| p.confidence < self.config.failure_threshold)
            .map(|p| FailureArea {
                position: p.position,
                category: p.category,
                confidence: p.confidence,
                evidence: p.evidence.clone(),
                strategy: p.category.strategy(),
                priority: (1.0 - p.confidence) * 100.0,
            })
            .collect();

        failure_areas.sort_by(|a, b| {
            b.priority
                .total_cmp(&a.priority)
                .then_with(|| a.position.cmp(&b.position))
        });
        let total_failures = failure_areas.len();
        failure_areas.truncate(self.config.max_failure_areas);

        let mut analysis = AccuracyAnalysis {
            round,
            overall_accuracy: overall_similarity.clamp(0.0, 1.0),
            position_confidence: table.into_values().collect(),
            lock_candidates,
            failure_areas,
            total_failures,
            delta: None,
        };

        if let Some(previous) = previous {
            analysis.delta = Some(self.delta(previous, &analysis));
        }

        debug!(
            round,
            accuracy = analysis.overall_accuracy,
            candidates = analysis.lock_candidates.len(),
            failures = analysis.total_failures,
            "精度解析完了"
        );

        analysis
    }

    /// 前ラウンドとの差分とトレンド
    pub fn delta(&self, previous: &AccuracyAnalysis, current: &AccuracyAnalysis) -> RoundDelta {
        let accuracy_change = current.overall_accuracy - previous.overall_accuracy;
        let trend = if accuracy_change > self.config.trend_band {
            Trend::Improving
        } else if accuracy_change < -self.config.trend_band {
            Trend::Declining
        } else {
            Trend::Stable
        };

        RoundDelta {
            accuracy_change,
            candidate_change: current.lock_candidates.len() as i64
                - previous.lock_candidates.len() as i64,
            failure_change: current.total_failures as i64 - previous.total_failures as i64,
            trend,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(shelf: u32, slot: u32, confidence: f64) -> ComparisonItem {
        ComparisonItem::new(Position::new(shelf, slot), confidence)
    }

    fn analyzer() -> AccuracyAnalyzer {
        AccuracyAnalyzer::default()
    }

    #[test]
    fn test_confidence_table_by_evidence() {
        let comparison = ComparisonResult {
            matches: vec![item(1, 1, 0.98)],
            mismatches: vec![item(1, 2, 0.6).with_category(ErrorCategory::PriceUnclear)],
            missing: vec![item(1, 3, 0.9)],
            extra: vec![item(2, 1, 0.5)],
            overall_similarity: 0.7,
        };

        let analysis = analyzer().analyze(1, &comparison, None, None);

        assert_eq!(analysis.position_confidence.len(), 4);
        let matched = analysis.confidence_at(Position::new(1, 1)).unwrap();
        assert_eq!(matched.confidence, 0.98);
        assert_eq!(matched.source, Evidence::Match);

        let mismatched = analysis.confidence_at(Position::new(1, 2)).unwrap();
        assert_eq!(mismatched.category, ErrorCategory::PriceUnclear);

        // 欠落は信頼度0・missing_product
        let missing = analysis.confidence_at(Position::new(1, 3)).unwrap();
        assert_eq!(missing.confidence, 0.0);
        assert_eq!(missing.category, ErrorCategory::MissingProduct);

        let extra = analysis.confidence_at(Position::new(2, 1)).unwrap();
        assert_eq!(extra.category, ErrorCategory::PositionUncertain);
    }

    #[test]
    fn test_overall_accuracy_is_comparator_score() {
        // 全位置一致でも類似度を再計算しない
        let comparison = ComparisonResult {
            matches: vec![item(1, 1, 0.99), item(1, 2, 0.99)],
            overall_similarity: 0.42,
            ..Default::default()
        };
        let analysis = analyzer().analyze(1, &comparison, None, None);
        assert_eq!(analysis.overall_accuracy, 0.42);
    }

    #[test]
    fn test_lock_and_failure_thresholds() {
        let comparison = ComparisonResult {
            matches: vec![item(1, 1, 0.95), item(1, 2, 0.94), item(1, 3, 0.75)],
            mismatches: vec![item(1, 4, 0.7499)],
            overall_similarity: 0.8,
            ..Default::default()
        };
        let analysis = analyzer().analyze(1, &comparison, None, None);

        assert_eq!(analysis.lock_candidates.len(), 1);
        assert_eq!(analysis.lock_candidates[0].position, Position::new(1, 1));
        assert_eq!(analysis.lock_candidates[0].reason, LockReason::HighConfidence);

        assert_eq!(analysis.failure_areas.len(), 1);
        assert_eq!(analysis.failure_areas[0].position, Position::new(1, 4));
        assert_eq!(analysis.failure_areas[0].strategy, ErrorCategory::Unknown.strategy());
    }

    #[test]
    fn test_failure_ranking_and_cap() {
        let mismatches: Vec<ComparisonItem> = (1..=15)
            .map(|slot| item(1, slot, slot as f64 * 0.04))
            .collect();
        let comparison = ComparisonResult {
            mismatches,
            overall_similarity: 0.3,
            ..Default::default()
        };
        let analysis = analyzer().analyze(1, &comparison, None, None);

        assert_eq!(analysis.total_failures, 15);
        assert_eq!(analysis.failure_areas.len(), 10);
        // 信頼度が低いほど優先度が高い
        assert_eq!(analysis.failure_areas[0].position, Position::new(1, 1));
        assert!((analysis.failure_areas[0].priority - 96.0).abs() < 1e-9);
        let priorities: Vec<f64> = analysis.failure_areas.iter().map(|f| f.priority).collect();
        assert!(priorities.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_duplicate_position_keeps_lowest_confidence() {
        let comparison = ComparisonResult {
            matches: vec![item(1, 1, 0.97)],
            mismatches: vec![item(1, 1, 0.4).with_category(ErrorCategory::BrandUnclear)],
            overall_similarity: 0.6,
            ..Default::default()
        };
        let analysis = analyzer().analyze(1, &comparison, None, None);
        let entry = analysis.confidence_at(Position::new(1, 1)).unwrap();
        assert_eq!(entry.confidence, 0.4);
        assert_eq!(entry.category, ErrorCategory::BrandUnclear);
        assert!(analysis.lock_candidates.is_empty());
    }

    #[test]
    fn test_positions_outside_grid_are_dropped() {
        let comparison = ComparisonResult {
            matches: vec![item(1, 1, 0.99), item(5, 1, 0.99)],
            overall_similarity: 0.9,
            ..Default::default()
        };
        let grid = GridShape::new(3, 4);
        let analysis = analyzer().analyze(1, &comparison, Some(&grid), None);
        assert_eq!(analysis.position_confidence.len(), 1);
    }

    #[test]
    fn test_delta_trend_hysteresis() {
        let analyzer = analyzer();
        let at = |round, similarity| {
            analyzer.analyze(
                round,
                &ComparisonResult {
                    overall_similarity: similarity,
                    ..Default::default()
                },
                None,
                None,
            )
        };

        let base = at(1, 0.5);
        assert_eq!(analyzer.delta(&base, &at(2, 0.65)).trend, Trend::Improving);
        assert_eq!(analyzer.delta(&base, &at(2, 0.35)).trend, Trend::Declining);
        // ±0.1以内はノイズ扱い
        assert_eq!(analyzer.delta(&base, &at(2, 0.58)).trend, Trend::Stable);
        assert_eq!(analyzer.delta(&base, &at(2, 0.44)).trend, Trend::Stable);
    }

    #[test]
    fn test_delta_counts() {
        let analyzer = analyzer();
        let first = analyzer.analyze(
            1,
            &ComparisonResult {
                mismatches: vec![item(1, 1, 0.3), item(1, 2, 0.3)],
                overall_similarity: 0.4,
                ..Default::default()
            },
            None,
            None,
        );
        let second = analyzer.analyze(
            2,
            &ComparisonResult {
                matches: vec![item(1, 1, 0.99)],
                mismatches: vec![item(1, 2, 0.3)],
                overall_similarity: 0.7,
                ..Default::default()
            },
            None,
            Some(&first),
        );

        let delta = second.delta.expect("差分なし");
        assert_eq!(delta.candidate_change, 1);
        assert_eq!(delta.failure_change, -1);
        assert_eq!(delta.trend, Trend::Improving);
    }

    #[test]
    fn test_analyze_unavailable() {
        let entities = vec![
            Entity::new(Position::new(1, 1), 0.97),
            Entity::new(Position::new(1, 2), 0.5),
        ];
        let analysis = analyzer().analyze_unavailable(3, &entities, None);

        assert_eq!(analysis.overall_accuracy, 0.0);
        assert_eq!(analysis.lock_candidates.len(), 1);
        assert_eq!(analysis.total_failures, 1);
        assert_eq!(
            analysis.confidence_at(Position::new(1, 2)).unwrap().source,
            Evidence::Provider
        );
    }
}
