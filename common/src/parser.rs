//! AIレスポンスパーサー
//!
//! AI CLIなどのレスポンスからJSONを抽出し、
//! 抽出結果・比較結果をパースする

use crate::error::{Error, Result};
use crate::types::{ComparisonResult, Entity, GridShape, Position};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// レスポンスからJSON部分を抽出
///
/// 抽出優先順位:
/// 1. ```json ... ``` ブロック
/// 2. 生の [...] 配列 または {...} オブジェクト（先に現れた方）
/// 3. エラー
///
/// # Examples
/// ```
/// use shelf_ai_common::extract_json;
///
/// let response = "result: [{\"shelf\": 1}]";
/// let json = extract_json(response).unwrap();
/// assert_eq!(json, "[{\"shelf\": 1}]");
/// ```
pub fn extract_json(response: &str) -> Result<&str> {
    if let Some(start_marker) = response.find("```json") {
        let start = start_marker + 7; // "```json" の長さ
        if let Some(end_offset) = response[start..].find("```") {
            let end = start + end_offset;
            return Ok(response[start..end].trim());
        }
    }

    let array = response.find('[').map(|i| (i, ']'));
    let object = response.find('{').map(|i| (i, '}'));
    let first = match (array, object) {
        (Some(a), Some(o)) => Some(if a.0 < o.0 { a } else { o }),
        (a, o) => a.or(o),
    };

    if let Some((start, close)) = first {
        if let Some(end) = response.rfind(close) {
            if end >= start {
                return Ok(&response[start..=end]);
            }
        }
    }

    Err(Error::Parse("JSONが見つかりません".into()))
}

/// AIが返す1商品（フラットな形）
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEntity {
    shelf: u32,
    #[serde(alias = "position", alias = "slotIndex")]
    slot: u32,
    #[serde(default = "one", alias = "facingCount")]
    facings: u32,
    #[serde(default)]
    confidence: f64,
    #[serde(flatten)]
    attributes: BTreeMap<String, Value>,
}

fn one() -> u32 {
    1
}

impl RawEntity {
    fn into_entity(self, round: u32) -> Entity {
        Entity {
            position: Position::new(self.shelf, self.slot),
            facings: self.facings,
            confidence: self.confidence.clamp(0.0, 1.0),
            round,
            locked_round: None,
            attributes: self.attributes,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawExtraction {
    Wrapped {
        #[serde(alias = "products", alias = "items")]
        entities: Vec<RawEntity>,
        #[serde(default, alias = "gridShape")]
        grid: Option<GridShape>,
    },
    Bare(Vec<RawEntity>),
}

/// 抽出レスポンスのパース結果
#[derive(Debug, Clone, Default)]
pub struct ParsedExtraction {
    pub entities: Vec<Entity>,
    pub grid: Option<GridShape>,
}

/// 抽出レスポンスをパース
///
/// 配列のみ、または `{"entities": [...], "grid": {...}}` の両方を受け付ける。
/// 棚0・スロット0や上限を超える番号の項目は捨て、上限を超える grid は無視する。
///
/// # Arguments
/// * `response` - AIのレスポンス
/// * `round` - 生成ラウンドとして記録する番号
pub fn parse_extraction_response(response: &str, round: u32) -> Result<ParsedExtraction> {
    let json_str = extract_json(response)?;
    let raw: RawExtraction = serde_json::from_str(json_str.trim())
        .map_err(|e| Error::Parse(format!("抽出結果 JSONパースエラー: {}", e)))?;

    let (raw_entities, grid) = match raw {
        RawExtraction::Wrapped { entities, grid } => (entities, grid),
        RawExtraction::Bare(entities) => (entities, None),
    };

    let total = raw_entities.len();
    let entities: Vec<Entity> = raw_entities
        .into_iter()
        .map(|e| e.into_entity(round))
        .filter(|e| e.position.within_limits())
        .collect();
    if entities.len() < total {
        warn!(dropped = total - entities.len(), "範囲外の位置を持つ項目を除外");
    }

    let grid = grid.filter(|g| {
        let plausible = g.is_plausible();
        if !plausible {
            warn!(shelves = g.shelf_count, slots = g.max_slots, "範囲外の棚構造を無視");
        }
        plausible
    });

    Ok(ParsedExtraction { entities, grid })
}

/// 比較レスポンスをパース
pub fn parse_comparison_response(response: &str) -> Result<ComparisonResult> {
    let json_str = extract_json(response)?;
    let mut result: ComparisonResult = serde_json::from_str(json_str.trim())
        .map_err(|e| Error::Parse(format!("比較結果 JSONパースエラー: {}", e)))?;
    for items in [
        &mut result.matches,
        &mut result.mismatches,
        &mut result.missing,
        &mut result.extra,
    ] {
        items.retain(|item| item.position.within_limits());
    }
    Ok(result)
}
