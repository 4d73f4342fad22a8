//! 棚割りのSVG描画
//!
//! 比較器に渡すための簡易描画。1スロット = 1セル、棚は上から順。

use crate::collaborators::{ArtifactFormat, RenderedArtifact, VisualRenderer};
use crate::error::{Result, ShelfAiError};
use async_trait::async_trait;
use shelf_ai_common::{Entity, GridShape};
use std::fmt::Write;
use tracing::debug;

const CELL_WIDTH: u32 = 120;
const CELL_HEIGHT: u32 = 80;

#[derive(Debug, Clone, Default)]
pub struct SvgRenderer;

impl SvgRenderer {
    pub fn new() -> Self {
        Self
    }

    /// グリッド外の位置は描かない。上限を超える棚構造はエラー
    pub fn render_svg(&self, entities: &[Entity], grid: &GridShape) -> Result<String> {
        if !grid.is_plausible() {
            return Err(ShelfAiError::ComparisonUnavailable(format!(
                "描画できない棚構造: {}段 x {}スロット",
                grid.shelf_count, grid.max_slots
            )));
        }
        let width = cells(grid.max_slots.max(1), CELL_WIDTH)?;
        let height = cells(grid.shelf_count.max(1), CELL_HEIGHT)?;

        let mut svg = format!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}" viewBox="0 0 {width} {height}">"#
        );
        svg.push('\n');

        for shelf in 1..=grid.shelf_count {
            let y = (shelf - 1) * CELL_HEIGHT;
            let _ = writeln!(
                svg,
                r##"  <line x1="0" y1="{y2}" x2="{width}" y2="{y2}" stroke="#444" stroke-width="3"/>"##,
                y2 = y + CELL_HEIGHT
            );
        }

        for entity in entities {
            if !grid.contains(entity.position) {
                debug!(position = %entity.position, "グリッド外のため描画しない");
                continue;
            }
            let (shelf, slot) = (entity.position.shelf, entity.position.slot);
            let x = (slot - 1) * CELL_WIDTH;
            let y = (shelf - 1) * CELL_HEIGHT;
            let fill = if entity.locked_round.is_some() { "#d8f0d8" } else { "#f4f4f4" };
            let price = entity
                .attributes
                .get("price")
                .map(|p| match p {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default();

            let _ = writeln!(
                svg,
                r##"  <rect x="{}" y="{}" width="{}" height="{}" fill="{}" stroke="#999"/>"##,
                x + 2,
                y + 2,
                CELL_WIDTH - 4,
                CELL_HEIGHT - 8,
                fill
            );
            let _ = writeln!(
                svg,
                r#"  <text x="{}" y="{}" font-size="12">{}</text>"#,
                x + 6,
                y + 22,
                escape(&entity.label())
            );
            let _ = writeln!(
                svg,
                r#"  <text x="{}" y="{}" font-size="11">x{} {}</text>"#,
                x + 6,
                y + 42,
                entity.facings,
                escape(&price)
            );
        }

        svg.push_str("</svg>\n");
        Ok(svg)
    }
}

fn cells(count: u32, size: u32) -> Result<u32> {
    count.checked_mul(size).ok_or_else(|| {
        ShelfAiError::ComparisonUnavailable(format!("描画サイズが大きすぎます: {} セル", count))
    })
}

#[async_trait]
impl VisualRenderer for SvgRenderer {
    async fn render(&self, entities: &[Entity], grid: &GridShape) -> Result<RenderedArtifact> {
        Ok(RenderedArtifact {
            format: ArtifactFormat::Svg,
            bytes: self.render_svg(entities, grid)?.into_bytes(),
        })
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelf_ai_common::Position;

    #[test]
    fn test_render_svg_cells() {
        let entities = vec![
            Entity::new(Position::new(1, 1), 0.9)
                .with_attribute("name", "Tea & Honey")
                .with_attribute("price", "$2.49"),
            Entity::new(Position::new(2, 3), 0.9).with_facings(4),
        ];
        let svg = SvgRenderer::new()
            .render_svg(&entities, &GridShape::new(2, 3))
            .unwrap();

        assert!(svg.starts_with("<svg"));
        assert!(svg.contains(r#"width="360" height="160""#));
        assert!(svg.contains("Tea &amp; Honey"));
        assert!(svg.contains("x1 $2.49"));
        assert!(svg.contains("x4"));
        assert_eq!(svg.matches("<rect").count(), 2);
    }

    #[test]
    fn test_render_svg_skips_stray_slot() {
        let entities = vec![
            Entity::new(Position::new(1, 1), 0.9),
            Entity::new(Position::new(1, 40_000_000), 0.9),
        ];
        let grid = GridShape::infer(&entities);
        let svg = SvgRenderer::new().render_svg(&entities, &grid).unwrap();

        assert!(svg.contains(r#"width="120" height="80""#));
        assert_eq!(svg.matches("<rect").count(), 1);
    }

    #[tokio::test]
    async fn test_render_oversized_grid_is_error() {
        let err = SvgRenderer::new()
            .render(&[], &GridShape::new(1, 40_000_000))
            .await
            .unwrap_err();
        assert!(matches!(err, ShelfAiError::ComparisonUnavailable(_)));
    }

    #[tokio::test]
    async fn test_render_artifact_format() {
        let artifact = SvgRenderer::new()
            .render(&[], &GridShape::new(1, 1))
            .await
            .unwrap();
        assert_eq!(artifact.format, ArtifactFormat::Svg);
        assert!(!artifact.bytes.is_empty());
    }
}
