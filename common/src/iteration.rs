//! ラウンド間の状態管理
//!
//! ランごとに1つ作り、ラウンドの解析結果からロックを更新して
//! 次ラウンドの再抽出指示（ExtractionFocus）を組み立てる。
//!
//! - ロックは追加のみ。後のラウンドで矛盾する証拠が出ても解除しない
//! - 履歴は追記のみ

use crate::types::{
    AccuracyAnalysis, Entity, ErrorCategory, ExtractionFocus, FocusRecord, FocusTarget,
    GridShape, LockReason, LockedPosition, Position, ShelfFocus, StrategyHint,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// ロック判定のポリシー
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockPolicy {
    /// エンティティ信頼度がこれ以上ならロック
    pub lock_threshold: f64,
    /// 同一内容がこのラウンド数連続したらロック
    pub stable_rounds: u32,
    /// 連続一致ロックに必要な最低信頼度
    pub stable_min_confidence: f64,
    /// 同一性の判定に使う属性
    pub identity_fields: Vec<String>,
    /// 数値属性（価格など）の許容誤差
    pub price_tolerance: f64,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            lock_threshold: 0.95,
            stable_rounds: 2,
            stable_min_confidence: 0.75,
            identity_fields: vec!["name".into(), "brand".into(), "price".into()],
            price_tolerance: 0.01,
        }
    }
}

impl LockPolicy {
    /// 2つのエンティティが同じ商品を指しているか
    pub fn same_identity(&self, a: &Entity, b: &Entity) -> bool {
        if a.facings != b.facings {
            return false;
        }

        self.identity_fields.iter().all(|field| {
            match (a.attributes.get(field), b.attributes.get(field)) {
                (None, None) => true,
                (Some(x), Some(y)) => self.values_equal(x, y),
                _ => false,
            }
        })
    }

    fn values_equal(&self, a: &Value, b: &Value) -> bool {
        if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
            return (x - y).abs() <= self.price_tolerance + f64::EPSILON;
        }
        match (a, b) {
            (Value::String(x), Value::String(y)) => {
                x.trim().to_lowercase() == y.trim().to_lowercase()
            }
            _ => a == b,
        }
    }
}

/// 数値、または "$3.49" "¥198" のような価格文字列を数値化
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s
                .trim()
                .trim_start_matches(['$', '€', '£', '¥', '￥'])
                .trim_end_matches('円')
                .chars()
                .filter(|c| *c != ',')
                .collect();
            if cleaned.is_empty() || !cleaned.chars().any(|c| c.is_ascii_digit()) {
                return None;
            }
            cleaned.trim().parse().ok()
        }
        _ => None,
    }
}

/// ロック済みエントリを優先して新しい抽出結果とマージする
///
/// - ロック済み位置のプロバイダ出力は捨てる
/// - 同じ位置に複数の出力があれば信頼度の高い方
/// - 結果は位置順
pub fn merge_entities(locked: &[Entity], fresh: &[Entity]) -> Vec<Entity> {
    let mut merged: BTreeMap<Position, Entity> = BTreeMap::new();

    for entity in fresh {
        match merged.get(&entity.position) {
            Some(existing) if existing.confidence >= entity.confidence => {}
            _ => {
                merged.insert(entity.position, entity.clone());
            }
        }
    }

    for entity in locked {
        merged.insert(entity.position, entity.clone());
    }

    merged.into_values().collect()
}

#[derive(Debug, Clone)]
struct Streak {
    entity: Entity,
    rounds: u32,
}

/// ランごとのロック状態と履歴
#[derive(Debug, Clone, Default)]
pub struct IterationStateManager {
    policy: LockPolicy,
    locked: BTreeMap<Position, LockedPosition>,
    streaks: BTreeMap<Position, Streak>,
    history: Vec<FocusRecord>,
}

impl IterationStateManager {
    pub fn new(policy: LockPolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    pub fn locked_positions(&self) -> &BTreeMap<Position, LockedPosition> {
        &self.locked
    }

    pub fn lock_count(&self) -> usize {
        self.locked.len()
    }

    pub fn is_locked(&self, position: Position) -> bool {
        self.locked.contains_key(&position)
    }

    pub fn history(&self) -> &[FocusRecord] {
        &self.history
    }

    /// ロック済みスナップショット（ロックラウンド付き）
    pub fn materialize_locked_entities(&self) -> Vec<Entity> {
        self.locked
            .values()
            .map(|lock| {
                let mut entity = lock.entity.clone();
                entity.locked_round = Some(lock.locked_round);
                entity
            })
            .collect()
    }

    /// ラウンド結果を評価してロックを更新し、次ラウンドの指示を返す
    ///
    /// # Arguments
    /// * `round` - 評価するラウンド
    /// * `entities` - このラウンドのマージ済みエンティティ
    /// * `analysis` - このラウンドの精度解析
    /// * `grid` - 棚構造。範囲外の再抽出対象は出さない
    pub fn evaluate_round(
        &mut self,
        round: u32,
        entities: &[Entity],
        analysis: &AccuracyAnalysis,
        grid: Option<&GridShape>,
    ) -> ExtractionFocus {
        let mut by_position: BTreeMap<Position, &Entity> = BTreeMap::new();
        for entity in entities.iter().filter(|e| e.position.within_limits()) {
            match by_position.get(&entity.position) {
                Some(existing) if existing.confidence >= entity.confidence => {}
                _ => {
                    by_position.insert(entity.position, entity);
                }
            }
        }

        self.update_streaks(&by_position);
        let newly_locked = self.lock_new_positions(round, &by_position, analysis);
        if newly_locked > 0 {
            info!(round, newly_locked, total = self.locked.len(), "位置をロック");
        }

        let mut targets: BTreeMap<Position, FocusTarget> = BTreeMap::new();

        for entity in by_position.values() {
            if self.is_locked(entity.position) {
                continue;
            }
            let target = match analysis.confidence_at(entity.position) {
                Some(entry) => FocusTarget {
                    position: entity.position,
                    category: entry.category,
                    strategy: entry.category.strategy(),
                    confidence: entry.confidence,
                    evidence: entry.evidence.clone(),
                },
                None => FocusTarget {
                    position: entity.position,
                    category: ErrorCategory::Unknown,
                    strategy: ErrorCategory::Unknown.strategy(),
                    confidence: entity.confidence,
                    evidence: String::new(),
                },
            };
            targets.insert(entity.position, target);
        }

        // 比較器だけが報告した位置（欠落・余剰）
        for entry in &analysis.position_confidence {
            if self.is_locked(entry.position) || targets.contains_key(&entry.position) {
                continue;
            }
            targets.insert(
                entry.position,
                FocusTarget {
                    position: entry.position,
                    category: entry.category,
                    strategy: entry.category.strategy(),
                    confidence: entry.confidence,
                    evidence: entry.evidence.clone(),
                },
            );
        }

        for position in detect_gaps(&by_position, grid) {
            if self.is_locked(position) || targets.contains_key(&position) {
                continue;
            }
            debug!(round, %position, "スパン内の空きスロットを欠落扱い");
            targets.insert(
                position,
                FocusTarget {
                    position,
                    category: ErrorCategory::MissingProduct,
                    strategy: ErrorCategory::MissingProduct.strategy(),
                    confidence: 0.0,
                    evidence: "gap inside observed shelf span".to_string(),
                },
            );
        }

        targets.retain(|position, _| position.within_limits());
        if let Some(grid) = grid.filter(|g| g.shelf_count > 0) {
            targets.retain(|position, _| grid.contains(*position));
        }

        let focus = self.build_focus(round + 1, targets);
        self.history.push(FocusRecord {
            round,
            focus: focus.clone(),
            lock_count: self.locked.len(),
        });

        focus
    }

    fn update_streaks(&mut self, by_position: &BTreeMap<Position, &Entity>) {
        // 連続しない位置はリセット
        self.streaks.retain(|position, _| by_position.contains_key(position));

        for (position, entity) in by_position {
            if self.locked.contains_key(position) {
                continue;
            }
            let same = self
                .streaks
                .get(position)
                .map(|s| self.policy.same_identity(&s.entity, entity))
                .unwrap_or(false);
            let rounds = if same {
                self.streaks.get(position).map(|s| s.rounds + 1).unwrap_or(1)
            } else {
                1
            };
            self.streaks.insert(
                *position,
                Streak {
                    entity: (*entity).clone(),
                    rounds,
                },
            );
        }
    }

    fn lock_new_positions(
        &mut self,
        round: u32,
        by_position: &BTreeMap<Position, &Entity>,
        analysis: &AccuracyAnalysis,
    ) -> usize {
        let mut count = 0;

        for (position, entity) in by_position {
            if self.locked.contains_key(position) {
                continue;
            }

            let candidate = analysis
                .lock_candidates
                .iter()
                .find(|c| c.position == *position);
            let streak = self.streaks.get(position).map(|s| s.rounds).unwrap_or(0);

            let lock = if entity.confidence >= self.policy.lock_threshold {
                Some((LockReason::HighConfidence, entity.confidence))
            } else if let Some(candidate) = candidate {
                // エンティティ自身は閾値未満で、比較器だけが裏付けた
                let reason = match candidate.reason {
                    LockReason::HighConfidence => LockReason::VisualConfirmation,
                    other => other,
                };
                Some((reason, candidate.confidence))
            } else if streak >= self.policy.stable_rounds
                && entity.confidence >= self.policy.stable_min_confidence
            {
                Some((LockReason::StableAcrossRounds, entity.confidence))
            } else {
                None
            };

            if let Some((reason, confidence)) = lock {
                debug!(round, %position, ?reason, confidence, "ロック");
                self.locked.insert(
                    *position,
                    LockedPosition {
                        position: *position,
                        entity: (*entity).clone(),
                        confidence,
                        locked_round: round,
                        reason,
                    },
                );
                self.streaks.remove(position);
                count += 1;
            }
        }

        count
    }

    fn build_focus(&self, round: u32, targets: BTreeMap<Position, FocusTarget>) -> ExtractionFocus {
        let mut shelves: BTreeMap<u32, Vec<FocusTarget>> = BTreeMap::new();
        let mut categories: BTreeSet<ErrorCategory> = BTreeSet::new();

        for (position, target) in targets {
            categories.insert(target.category);
            shelves.entry(position.shelf).or_default().push(target);
        }

        ExtractionFocus {
            round,
            preserve_exact: self.locked.keys().copied().collect(),
            reextract: shelves
                .into_iter()
                .map(|(shelf, targets)| ShelfFocus { shelf, targets })
                .collect(),
            enhancement_strategies: categories
                .into_iter()
                .map(|category| StrategyHint {
                    category,
                    strategy: category.strategy(),
                    hint: category.strategy().hint().to_string(),
                })
                .collect(),
            grid: None,
        }
    }
}

/// 棚ごとに観測スパン [min, max] 内の空きスロットを返す
///
/// スパンの上端は棚構造の最大スロット（未確定なら上限値）で打ち切る
fn detect_gaps(by_position: &BTreeMap<Position, &Entity>, grid: Option<&GridShape>) -> Vec<Position> {
    let slot_limit = grid
        .filter(|g| g.shelf_count > 0)
        .map_or(GridShape::MAX_SLOTS, |g| g.max_slots.min(GridShape::MAX_SLOTS));

    let mut spans: BTreeMap<u32, (u32, u32)> = BTreeMap::new();
    for position in by_position.keys().filter(|p| p.slot <= slot_limit) {
        let span = spans
            .entry(position.shelf)
            .or_insert((position.slot, position.slot));
        span.0 = span.0.min(position.slot);
        span.1 = span.1.max(position.slot);
    }

    spans
        .into_iter()
        .flat_map(|(shelf, (min, max))| (min..=max).map(move |slot| Position::new(shelf, slot)))
        .filter(|position| !by_position.contains_key(position))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accuracy::AccuracyAnalyzer;
    use crate::types::{ComparisonItem, ComparisonResult};

    fn product(shelf: u32, slot: u32, confidence: f64, name: &str) -> Entity {
        Entity::new(Position::new(shelf, slot), confidence)
            .with_attribute("name", name)
            .with_attribute("price", 2.99)
    }

    fn empty_analysis(round: u32) -> AccuracyAnalysis {
        AccuracyAnalyzer::default().analyze(round, &ComparisonResult::default(), None, None)
    }

    fn mismatch_all(round: u32, entities: &[Entity], confidence: f64) -> AccuracyAnalysis {
        let comparison = ComparisonResult {
            mismatches: entities
                .iter()
                .map(|e| ComparisonItem::new(e.position, confidence))
                .collect(),
            overall_similarity: 0.5,
            ..Default::default()
        };
        AccuracyAnalyzer::default().analyze(round, &comparison, None, None)
    }

    #[test]
    fn test_high_confidence_entities_lock_unmodified() {
        let mut manager = IterationStateManager::default();
        let entities = vec![product(1, 1, 0.97, "Cola"), product(1, 2, 0.6, "Soda")];

        let focus = manager.evaluate_round(1, &entities, &empty_analysis(1), None);

        assert_eq!(manager.lock_count(), 1);
        let lock = &manager.locked_positions()[&Position::new(1, 1)];
        assert_eq!(lock.entity, entities[0]);
        assert_eq!(lock.reason, LockReason::HighConfidence);
        assert_eq!(lock.locked_round, 1);

        assert_eq!(focus.round, 2);
        assert_eq!(focus.preserve_exact, vec![Position::new(1, 1)]);
        assert_eq!(
            focus.reextract_positions(),
            BTreeSet::from([Position::new(1, 2)])
        );
    }

    #[test]
    fn test_locks_are_never_revoked() {
        let mut manager = IterationStateManager::default();
        manager.evaluate_round(1, &[product(1, 1, 0.99, "Cola")], &empty_analysis(1), None);

        // 矛盾する証拠（低信頼度・不一致）でも解除しない
        let contradicting = vec![product(1, 1, 0.1, "Water")];
        let analysis = mismatch_all(2, &contradicting, 0.1);
        let focus = manager.evaluate_round(2, &contradicting, &analysis, None);

        let lock = &manager.locked_positions()[&Position::new(1, 1)];
        assert_eq!(lock.entity.label(), "Cola");
        assert_eq!(lock.confidence, 0.99);
        assert!(focus.reextract.is_empty());
    }

    #[test]
    fn test_monotonic_lock_set() {
        let mut manager = IterationStateManager::default();
        let rounds = vec![
            vec![product(1, 1, 0.99, "A"), product(1, 2, 0.5, "B"), product(1, 3, 0.5, "C")],
            vec![product(1, 1, 0.2, "A"), product(1, 2, 0.96, "B"), product(1, 3, 0.4, "X")],
            vec![product(1, 1, 0.2, "Z"), product(1, 2, 0.1, "Z"), product(1, 3, 0.97, "C")],
        ];

        let mut previous: BTreeSet<Position> = BTreeSet::new();
        for (index, entities) in rounds.iter().enumerate() {
            let round = index as u32 + 1;
            manager.evaluate_round(round, entities, &mismatch_all(round, entities, 0.3), None);
            let current: BTreeSet<Position> = manager.locked_positions().keys().copied().collect();
            assert!(previous.is_subset(&current));
            previous = current;
        }
        assert_eq!(previous.len(), 3);
    }

    #[test]
    fn test_visual_confirmation_lock() {
        let mut manager = IterationStateManager::default();
        let entities = vec![product(2, 1, 0.8, "Chips")];
        let comparison = ComparisonResult {
            matches: vec![ComparisonItem::new(Position::new(2, 1), 0.98)],
            overall_similarity: 0.9,
            ..Default::default()
        };
        let analysis = AccuracyAnalyzer::default().analyze(1, &comparison, None, None);

        manager.evaluate_round(1, &entities, &analysis, None);

        let lock = &manager.locked_positions()[&Position::new(2, 1)];
        assert_eq!(lock.reason, LockReason::VisualConfirmation);
        assert_eq!(lock.confidence, 0.98);
    }

    #[test]
    fn test_lock_candidate_without_entity_is_ignored() {
        let mut manager = IterationStateManager::default();
        let comparison = ComparisonResult {
            matches: vec![ComparisonItem::new(Position::new(1, 5), 0.99)],
            overall_similarity: 0.9,
            ..Default::default()
        };
        let analysis = AccuracyAnalyzer::default().analyze(1, &comparison, None, None);
        manager.evaluate_round(1, &[], &analysis, None);
        assert_eq!(manager.lock_count(), 0);
    }

    #[test]
    fn test_stable_across_rounds_lock() {
        let mut manager = IterationStateManager::default();
        let round1 = vec![product(1, 1, 0.8, "Cola"), product(1, 2, 0.8, "Soda")];
        let round2 = vec![
            product(1, 1, 0.85, "cola "),
            product(1, 2, 0.8, "Soda").with_facings(3),
        ];

        manager.evaluate_round(1, &round1, &empty_analysis(1), None);
        assert_eq!(manager.lock_count(), 0);

        manager.evaluate_round(2, &round2, &empty_analysis(2), None);
        assert_eq!(manager.lock_count(), 1);
        let lock = &manager.locked_positions()[&Position::new(1, 1)];
        assert_eq!(lock.reason, LockReason::StableAcrossRounds);
        assert_eq!(lock.locked_round, 2);
        // フェイス数が変わった位置はリセット
        assert!(!manager.is_locked(Position::new(1, 2)));
    }

    #[test]
    fn test_stable_lock_requires_minimum_confidence() {
        let mut manager = IterationStateManager::default();
        let entities = vec![product(1, 1, 0.6, "Cola")];
        manager.evaluate_round(1, &entities, &empty_analysis(1), None);
        manager.evaluate_round(2, &entities, &empty_analysis(2), None);
        manager.evaluate_round(3, &entities, &empty_analysis(3), None);
        assert_eq!(manager.lock_count(), 0);
    }

    #[test]
    fn test_streak_resets_when_position_disappears() {
        let mut manager = IterationStateManager::default();
        let present = vec![product(1, 1, 0.8, "Cola"), product(1, 2, 0.5, "x")];
        let absent = vec![product(1, 2, 0.5, "y")];
        manager.evaluate_round(1, &present, &empty_analysis(1), None);
        manager.evaluate_round(2, &absent, &empty_analysis(2), None);
        manager.evaluate_round(3, &present, &empty_analysis(3), None);
        assert!(!manager.is_locked(Position::new(1, 1)));
    }

    #[test]
    fn test_gap_detection() {
        let mut manager = IterationStateManager::default();
        let entities = vec![product(1, 1, 0.5, "A"), product(1, 3, 0.5, "C")];

        let focus = manager.evaluate_round(1, &entities, &empty_analysis(1), None);

        let shelf1 = &focus.reextract[0];
        assert_eq!(shelf1.shelf, 1);
        let gap = shelf1
            .targets
            .iter()
            .find(|t| t.position == Position::new(1, 2))
            .expect("スロット2が対象にない");
        assert_eq!(gap.category, ErrorCategory::MissingProduct);
        assert_eq!(gap.confidence, 0.0);
    }

    #[test]
    fn test_gap_detection_ignores_stray_slot() {
        let mut manager = IterationStateManager::default();
        let entities = vec![product(1, 1, 0.5, "A"), product(1, 3_000_000, 0.5, "Stray")];

        let focus = manager.evaluate_round(1, &entities, &empty_analysis(1), None);

        let positions = focus.reextract_positions();
        assert_eq!(positions.len(), 1);
        assert!(positions.contains(&Position::new(1, 1)));
    }

    #[test]
    fn test_gap_detection_bounded_by_grid() {
        let mut manager = IterationStateManager::default();
        let entities = vec![product(1, 2, 0.5, "A"), product(1, 9, 0.5, "B")];

        let focus = manager.evaluate_round(1, &entities, &empty_analysis(1), Some(&GridShape::new(1, 4)));

        let positions: Vec<Position> = focus.reextract_positions().into_iter().collect();
        assert_eq!(positions, vec![Position::new(1, 2)]);
    }

    #[test]
    fn test_focus_groups_by_shelf_with_hints() {
        let mut manager = IterationStateManager::default();
        let entities = vec![product(1, 1, 0.5, "A"), product(3, 1, 0.5, "B")];
        let comparison = ComparisonResult {
            mismatches: vec![
                ComparisonItem::new(Position::new(1, 1), 0.5).with_category(ErrorCategory::PriceUnclear),
                ComparisonItem::new(Position::new(3, 1), 0.5).with_category(ErrorCategory::BrandUnclear),
            ],
            missing: vec![ComparisonItem::new(Position::new(2, 4), 0.0)],
            overall_similarity: 0.4,
            ..Default::default()
        };
        let analysis = AccuracyAnalyzer::default().analyze(1, &comparison, None, None);

        let focus = manager.evaluate_round(1, &entities, &analysis, None);

        assert_eq!(focus.shelves(), vec![1, 2, 3]);
        assert_eq!(focus.reextract[0].targets[0].category, ErrorCategory::PriceUnclear);
        assert_eq!(focus.reextract[1].targets[0].category, ErrorCategory::MissingProduct);
        let categories: Vec<ErrorCategory> =
            focus.enhancement_strategies.iter().map(|h| h.category).collect();
        assert_eq!(
            categories,
            vec![
                ErrorCategory::PriceUnclear,
                ErrorCategory::MissingProduct,
                ErrorCategory::BrandUnclear
            ]
        );
        assert_eq!(manager.history().len(), 1);
        assert_eq!(manager.history()[0].lock_count, 0);
    }

    #[test]
    fn test_focus_respects_grid() {
        let mut manager = IterationStateManager::default();
        let entities = vec![product(1, 1, 0.5, "A"), product(4, 1, 0.5, "B")];
        let grid = GridShape::new(3, 5);
        let focus = manager.evaluate_round(1, &entities, &empty_analysis(1), Some(&grid));
        assert_eq!(focus.shelves(), vec![1]);
    }

    #[test]
    fn test_focus_shrinks_by_newly_locked_positions() {
        let mut manager = IterationStateManager::default();
        let round1: Vec<Entity> = (1..=8).map(|slot| product(1, slot, 0.6, "item")).collect();
        let focus2 = manager.evaluate_round(1, &round1, &mismatch_all(1, &round1, 0.6), None);
        assert_eq!(focus2.reextract_positions().len(), 8);

        let round2: Vec<Entity> = (1..=8)
            .map(|slot| {
                if slot <= 5 {
                    product(1, slot, 0.97, "fixed")
                } else {
                    product(1, slot, 0.6, &format!("guess-{}", slot))
                }
            })
            .collect();
        let focus3 = manager.evaluate_round(2, &round2, &mismatch_all(2, &round2, 0.6), None);

        assert_eq!(manager.lock_count(), 5);
        let shrunk: BTreeSet<Position> = focus2
            .reextract_positions()
            .difference(&focus3.reextract_positions())
            .copied()
            .collect();
        assert_eq!(shrunk, (1..=5).map(|slot| Position::new(1, slot)).collect());
        assert_eq!(focus3.reextract_positions().len(), 3);
    }

    #[test]
    fn test_materialize_locked_entities() {
        let mut manager = IterationStateManager::default();
        manager.evaluate_round(2, &[product(1, 1, 0.99, "A").with_round(2)], &empty_analysis(2), None);

        let locked = manager.materialize_locked_entities();
        assert_eq!(locked.len(), 1);
        assert_eq!(locked[0].locked_round, Some(2));
        assert_eq!(locked[0].round, 2);
    }

    #[test]
    fn test_merge_locked_takes_precedence() {
        let locked = vec![product(1, 1, 0.99, "Locked")];
        let fresh = vec![
            product(1, 1, 0.5, "Fresh"),
            product(1, 2, 0.4, "Low"),
            product(1, 2, 0.7, "High"),
        ];

        let merged = merge_entities(&locked, &fresh);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].label(), "Locked");
        assert_eq!(merged[1].label(), "High");
    }

    #[test]
    fn test_merge_idempotent() {
        let locked = vec![product(1, 2, 0.99, "Locked")];
        let first = vec![product(1, 1, 0.6, "A"), product(1, 2, 0.3, "noise"), product(2, 1, 0.7, "B")];
        let second = vec![product(2, 1, 0.7, "B"), product(1, 1, 0.6, "A")];

        assert_eq!(merge_entities(&locked, &first), merge_entities(&locked, &second));
        let once = merge_entities(&locked, &first);
        assert_eq!(merge_entities(&locked, &once), once);
    }

    #[test]
    fn test_identity_equality_semantics() {
        let policy = LockPolicy::default();
        let base = Entity::new(Position::new(1, 1), 0.8)
            .with_attribute("name", "Cola 500ml")
            .with_attribute("brand", "Acme")
            .with_attribute("price", "$2.99");

        let same = Entity::new(Position::new(1, 1), 0.9)
            .with_attribute("name", " cola 500ML")
            .with_attribute("brand", "ACME")
            .with_attribute("price", 2.995);
        assert!(policy.same_identity(&base, &same));

        let other_price = same.clone().with_attribute("price", 3.49);
        assert!(!policy.same_identity(&base, &other_price));

        let missing_brand = Entity::new(Position::new(1, 1), 0.9)
            .with_attribute("name", "Cola 500ml")
            .with_attribute("price", 2.99);
        assert!(!policy.same_identity(&base, &missing_brand));
    }

    #[test]
    fn test_as_number() {
        assert_eq!(as_number(&Value::from("$1,299.50")), Some(1299.5));
        assert_eq!(as_number(&Value::from("198円")), Some(198.0));
        assert_eq!(as_number(&Value::from("Cola 500ml")), None);
        assert_eq!(as_number(&Value::from("")), None);
    }
}
