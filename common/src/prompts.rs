//! プロンプト生成モジュール
//!
//! ExtractionFocus をプロバイダへの指示文に変換する:
//! - build_extraction_prompt: 抽出（初回は全体、以降は棚単位の再抽出）
//! - build_comparison_prompt: 描画結果と元画像の比較

use crate::fields::{schema_example, FieldDescriptor};
use crate::types::{Entity, ExtractionFocus};

/// 再抽出指示（保持位置・対象位置・改善ヒント）
///
/// 初回ラウンド（指示が空）の場合は空文字
pub fn build_focus_instructions(focus: &ExtractionFocus, locked: &[Entity]) -> String {
    if focus.is_initial() {
        return String::new();
    }

    let mut sections = Vec::new();

    if !locked.is_empty() {
        let lines = locked
            .iter()
            .map(|e| {
                format!(
                    "- shelf {} slot {}: {} (facings {}) - keep exactly as is",
                    e.position.shelf,
                    e.position.slot,
                    e.label(),
                    e.facings
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("## Verified positions (do not change)\n{lines}"));
    }

    let targets = focus
        .reextract
        .iter()
        .flat_map(|s| s.targets.iter())
        .map(|t| {
            let evidence = if t.evidence.is_empty() {
                String::new()
            } else {
                format!(" [{}]", t.evidence)
            };
            format!(
                "- shelf {} slot {}: {}{}",
                t.position.shelf, t.position.slot, t.category, evidence
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    if !targets.is_empty() {
        sections.push(format!("## Re-extract these positions\n{targets}"));
    }

    // カテゴリごとの改善方法（対象行のカテゴリと対応）
    if !focus.enhancement_strategies.is_empty() {
        let hints = focus
            .enhancement_strategies
            .iter()
            .map(|h| format!("- {}: {}", h.category, h.hint))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("## How to resolve each category\n{hints}"));
    }

    if let Some(grid) = &focus.grid {
        sections.push(format!(
            "## Shelf structure (confirmed)\n{} shelves, up to {} slots per shelf. Do not report positions outside this grid.",
            grid.shelf_count, grid.max_slots
        ));
    }

    sections.join("\n\n")
}

/// 抽出プロンプト生成
///
/// 初回は棚構造の推定（grid）も含むオブジェクト、以降はエンティティ配列を求める
pub fn build_extraction_prompt(
    focus: &ExtractionFocus,
    locked: &[Entity],
    fields: &[FieldDescriptor],
) -> String {
    let schema = schema_example(fields);
    let scope = if focus.is_initial() {
        "Extract every product visible on every shelf, and estimate the shelf structure.".to_string()
    } else if focus.reextract.is_empty() {
        "Every listed position is verified. Report only products at positions not listed yet.".to_string()
    } else {
        let shelves = focus
            .shelves()
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        format!("Only report products for shelf {shelves}. Report only the positions listed under 'Re-extract'.")
    };
    let instructions = build_focus_instructions(focus, locked);

    let (kind, output) = if focus.is_initial() {
        (
            "object",
            format!(
                r#"{{
  "grid": {{"shelfCount": <number of shelves>, "maxSlots": <most slots on any shelf>, "confidence": <0.0-1.0>}},
  "entities": {schema}
}}"#
            ),
        )
    } else {
        ("array", schema)
    };

    format!(
        r#"You are auditing a retail shelf photo. {scope}

{instructions}

## Output format (JSON {kind} only)
{output}

- Shelves are numbered from the top, slots from the left, both starting at 1
- confidence is your own certainty for the whole record
- Output the JSON {kind} only. No explanations
"#
    )
}

/// 比較プロンプト生成
pub fn build_comparison_prompt(artifact_path: &str) -> String {
    format!(
        r#"Compare the shelf photo with the rendered planogram at {artifact_path}.
For every grid position decide whether the rendering matches the photo.

## Output format (JSON object only)
{{
  "matches": [{{"position": {{"shelf": 1, "slot": 1}}, "confidence": 0.0-1.0}}],
  "mismatches": [{{"position": {{"shelf": 1, "slot": 2}}, "confidence": 0.0-1.0, "category": "price_unclear|product_variant_confusion|position_uncertain|facing_count_error|brand_unclear|unknown", "evidence": "what differs"}}],
  "missing": [{{"position": {{"shelf": 1, "slot": 3}}, "evidence": "product in photo but not rendered"}}],
  "extra": [{{"position": {{"shelf": 2, "slot": 1}}, "confidence": 0.0-1.0, "evidence": "rendered but not in photo"}}],
  "overallSimilarity": 0.0-1.0
}}

- Output the JSON object only. No explanations
"#
    )
}
