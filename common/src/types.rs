//! 収束エンジンの型定義
//!
//! CLIと各プロバイダで共有される型:
//! - Position / Entity: 棚グリッド上の抽出結果
//! - ComparisonResult: 描画結果と元画像の比較（外部比較器の出力）
//! - AccuracyAnalysis / FailureArea: ラウンドごとの精度解析
//! - LockedPosition / ExtractionFocus: ロック状態と次ラウンドの再抽出指示

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// 棚グリッド上の位置 (棚番号, スロット番号)。どちらも1始まり
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub shelf: u32,
    pub slot: u32,
}

impl Position {
    pub fn new(shelf: u32, slot: u32) -> Self {
        Self { shelf, slot }
    }

    /// 1始まりで、グリッドの上限内にある
    pub fn within_limits(&self) -> bool {
        (1..=GridShape::MAX_SHELVES).contains(&self.shelf)
            && (1..=GridShape::MAX_SLOTS).contains(&self.slot)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "棚{}-{}", self.shelf, self.slot)
    }
}

/// 抽出された1商品
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub position: Position,

    /// フェイス数
    #[serde(default = "default_facings")]
    pub facings: u32,

    /// 0.0〜1.0
    pub confidence: f64,

    /// この値を生成したラウンド
    #[serde(default)]
    pub round: u32,

    /// ロック済みスナップショットとして渡された場合のロックラウンド
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_round: Option<u32>,

    /// 商品名・ブランド・価格など（形はフィールド定義に従う）
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

fn default_facings() -> u32 {
    1
}

impl Entity {
    pub fn new(position: Position, confidence: f64) -> Self {
        Self {
            position,
            facings: 1,
            confidence: confidence.clamp(0.0, 1.0),
            round: 0,
            locked_round: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn with_round(mut self, round: u32) -> Self {
        self.round = round;
        self
    }

    pub fn with_facings(mut self, facings: u32) -> Self {
        self.facings = facings;
        self
    }

    /// 表示用の商品名（name → brand の順）
    pub fn label(&self) -> String {
        ["name", "brand"]
            .iter()
            .find_map(|k| self.attributes.get(*k).and_then(Value::as_str))
            .unwrap_or("?")
            .to_string()
    }
}

/// 棚の構造（棚数・最大スロット数）とその推定信頼度
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridShape {
    pub shelf_count: u32,
    pub max_slots: u32,
    #[serde(default)]
    pub confidence: f64,
}

impl GridShape {
    /// 棚数の上限。これを超える番号はプロバイダの誤りとして扱う
    pub const MAX_SHELVES: u32 = 64;
    /// 1段あたりのスロット数の上限
    pub const MAX_SLOTS: u32 = 256;

    pub fn new(shelf_count: u32, max_slots: u32) -> Self {
        Self {
            shelf_count,
            max_slots,
            confidence: 0.0,
        }
    }

    pub fn contains(&self, position: Position) -> bool {
        (1..=self.shelf_count).contains(&position.shelf)
            && (1..=self.max_slots).contains(&position.slot)
    }

    /// 上限内に収まる形状か
    pub fn is_plausible(&self) -> bool {
        self.shelf_count <= Self::MAX_SHELVES && self.max_slots <= Self::MAX_SLOTS
    }

    /// エンティティの最大棚・最大スロットから推定する（上限外の位置は無視）
    pub fn infer(entities: &[Entity]) -> Self {
        let positions = || {
            entities
                .iter()
                .map(|e| e.position)
                .filter(|p| p.within_limits())
        };
        let shelf_count = positions().map(|p| p.shelf).max().unwrap_or(0);
        let max_slots = positions().map(|p| p.slot).max().unwrap_or(0);
        Self::new(shelf_count, max_slots)
    }

    /// 2つの形状を包含する形状
    pub fn union(&self, other: &GridShape) -> Self {
        Self {
            shelf_count: self.shelf_count.max(other.shelf_count),
            max_slots: self.max_slots.max(other.max_slots),
            confidence: self.confidence.min(other.confidence),
        }
    }
}

/// 比較器が報告するエラー区分
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    PriceUnclear,
    ProductVariantConfusion,
    PositionUncertain,
    MissingProduct,
    FacingCountError,
    BrandUnclear,
    #[serde(other)]
    Unknown,
}

impl ErrorCategory {
    /// エラー区分 → 改善戦略の固定テーブル
    pub fn strategy(&self) -> EnhancementStrategy {
        match self {
            ErrorCategory::PriceUnclear => EnhancementStrategy::ZoomPriceTag,
            ErrorCategory::ProductVariantConfusion => EnhancementStrategy::CompareVariantDetails,
            ErrorCategory::PositionUncertain => EnhancementStrategy::VerifyGridPosition,
            ErrorCategory::MissingProduct => EnhancementStrategy::ScanForMissing,
            ErrorCategory::FacingCountError => EnhancementStrategy::RecountFacings,
            ErrorCategory::BrandUnclear => EnhancementStrategy::ReadBrandLabel,
            ErrorCategory::Unknown => EnhancementStrategy::GeneralReexamine,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::PriceUnclear => "price_unclear",
            ErrorCategory::ProductVariantConfusion => "product_variant_confusion",
            ErrorCategory::PositionUncertain => "position_uncertain",
            ErrorCategory::MissingProduct => "missing_product",
            ErrorCategory::FacingCountError => "facing_count_error",
            ErrorCategory::BrandUnclear => "brand_unclear",
            ErrorCategory::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// 再抽出時の改善戦略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnhancementStrategy {
    ZoomPriceTag,
    CompareVariantDetails,
    VerifyGridPosition,
    ScanForMissing,
    RecountFacings,
    ReadBrandLabel,
    GeneralReexamine,
}

impl EnhancementStrategy {
    /// プロバイダへ渡す指示文
    pub fn hint(&self) -> &'static str {
        match self {
            EnhancementStrategy::ZoomPriceTag => {
                "Zoom into the shelf-edge price label directly below the product and read every digit"
            }
            EnhancementStrategy::CompareVariantDetails => {
                "Compare size, flavor and packaging color against neighbouring variants of the same brand"
            }
            EnhancementStrategy::VerifyGridPosition => {
                "Count slots from the left edge of the shelf to confirm the exact position"
            }
            EnhancementStrategy::ScanForMissing => {
                "Scan this slot carefully for a product that was not detected, including partially hidden items"
            }
            EnhancementStrategy::RecountFacings => {
                "Recount the identical units facing forward for this product"
            }
            EnhancementStrategy::ReadBrandLabel => {
                "Read the brand name from the front label, ignoring shelf signage"
            }
            EnhancementStrategy::GeneralReexamine => "Re-examine this position from scratch",
        }
    }
}

/// 比較結果の1項目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonItem {
    pub position: Position,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ErrorCategory>,
    #[serde(default)]
    pub evidence: String,
}

impl ComparisonItem {
    pub fn new(position: Position, confidence: f64) -> Self {
        Self {
            position,
            confidence,
            category: None,
            evidence: String::new(),
        }
    }

    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }
}

/// 比較器の出力（描画結果 vs 元画像）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComparisonResult {
    pub matches: Vec<ComparisonItem>,
    pub mismatches: Vec<ComparisonItem>,
    pub missing: Vec<ComparisonItem>,
    pub extra: Vec<ComparisonItem>,
    pub overall_similarity: f64,
}

/// 位置ごとの信頼度の出どころ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Evidence {
    Match,
    Mismatch,
    Missing,
    Extra,
    /// 比較不能時のプロバイダ自己申告
    Provider,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionConfidence {
    pub position: Position,
    pub confidence: f64,
    pub category: ErrorCategory,
    pub source: Evidence,
    #[serde(default)]
    pub evidence: String,
}

/// ロック理由
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockReason {
    HighConfidence,
    VisualConfirmation,
    StableAcrossRounds,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockCandidate {
    pub position: Position,
    pub confidence: f64,
    pub reason: LockReason,
}

/// ラン中は削除も格下げもされない
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedPosition {
    pub position: Position,
    pub entity: Entity,
    pub confidence: f64,
    pub locked_round: u32,
    pub reason: LockReason,
}

/// 再抽出対象（ラウンドごとに作り直す）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureArea {
    pub position: Position,
    pub category: ErrorCategory,
    pub confidence: f64,
    pub evidence: String,
    pub strategy: EnhancementStrategy,
    /// (1 - confidence) * 100
    pub priority: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
}

/// 前ラウンドとの差分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundDelta {
    pub accuracy_change: f64,
    /// ロック候補数の増減（実際のロック数ではない）
    pub candidate_change: i64,
    pub failure_change: i64,
    pub trend: Trend,
}

/// 1ラウンドの精度解析
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccuracyAnalysis {
    pub round: u32,
    /// 比較器の類似度をそのまま採用
    pub overall_accuracy: f64,
    pub position_confidence: Vec<PositionConfidence>,
    pub lock_candidates: Vec<LockCandidate>,
    /// 優先度順、上位N件のみ
    pub failure_areas: Vec<FailureArea>,
    /// 上限で切る前の失敗件数
    pub total_failures: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<RoundDelta>,
}

impl AccuracyAnalysis {
    pub fn confidence_at(&self, position: Position) -> Option<&PositionConfidence> {
        self.position_confidence.iter().find(|p| p.position == position)
    }

    pub fn is_lock_candidate(&self, position: Position) -> bool {
        self.lock_candidates.iter().any(|c| c.position == position)
    }
}

/// 再抽出対象の1位置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusTarget {
    pub position: Position,
    pub category: ErrorCategory,
    pub strategy: EnhancementStrategy,
    pub confidence: f64,
    #[serde(default)]
    pub evidence: String,
}

/// 棚単位の再抽出グループ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShelfFocus {
    pub shelf: u32,
    pub targets: Vec<FocusTarget>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyHint {
    pub category: ErrorCategory,
    pub strategy: EnhancementStrategy,
    pub hint: String,
}

/// 次ラウンドの抽出指示
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtractionFocus {
    /// この指示を使うラウンド
    pub round: u32,
    /// そのまま保持させる位置
    pub preserve_exact: Vec<Position>,
    /// 棚ごとの再抽出対象
    pub reextract: Vec<ShelfFocus>,
    pub enhancement_strategies: Vec<StrategyHint>,
    /// 構造ロック済みならその形状
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grid: Option<GridShape>,
}

impl ExtractionFocus {
    /// 初回ラウンド（全体抽出）
    pub fn initial() -> Self {
        Self {
            round: 1,
            ..Default::default()
        }
    }

    pub fn is_initial(&self) -> bool {
        self.preserve_exact.is_empty() && self.reextract.is_empty()
    }

    pub fn reextract_positions(&self) -> BTreeSet<Position> {
        self.reextract
            .iter()
            .flat_map(|s| s.targets.iter().map(|t| t.position))
            .collect()
    }

    pub fn shelves(&self) -> Vec<u32> {
        self.reextract.iter().map(|s| s.shelf).collect()
    }

    /// 指定棚だけに絞った指示（棚単位の並列抽出用）
    pub fn for_shelf(&self, shelf: u32) -> Self {
        Self {
            round: self.round,
            preserve_exact: self
                .preserve_exact
                .iter()
                .copied()
                .filter(|p| p.shelf == shelf)
                .collect(),
            reextract: self
                .reextract
                .iter()
                .filter(|s| s.shelf == shelf)
                .cloned()
                .collect(),
            enhancement_strategies: self.enhancement_strategies.clone(),
            grid: self.grid,
        }
    }
}

/// ラウンドの終了時点で記録する履歴
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusRecord {
    pub round: u32,
    pub focus: ExtractionFocus,
    pub lock_count: usize,
}
