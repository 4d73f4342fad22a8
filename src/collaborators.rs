//! 収束ループが呼び出す外部コラボレータ
//!
//! 抽出・描画・比較・エスカレーションはすべてトレイト越しに呼ぶ。
//! モデルの選択やプロンプトの中身はここより外側の関心事。

use crate::error::Result;
use crate::job::RunState;
use async_trait::async_trait;
use shelf_ai_common::{ComparisonResult, Entity, ExtractionFocus, GridShape};
use std::path::Path;

/// 抽出プロバイダの出力
#[derive(Debug, Clone, Default)]
pub struct ExtractionOutput {
    pub entities: Vec<Entity>,
    pub cost: f64,
    /// プロバイダが推定した棚構造
    pub grid: Option<GridShape>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFormat {
    Svg,
}

impl ArtifactFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactFormat::Svg => "svg",
        }
    }
}

/// 描画結果
#[derive(Debug, Clone)]
pub struct RenderedArtifact {
    pub format: ArtifactFormat,
    pub bytes: Vec<u8>,
}

/// 画像と指示からエンティティを抽出する
///
/// 一時的な失敗の再試行は実装側の責任。ここでエラーを返した時点で
/// リトライ済みとして扱う。
#[async_trait]
pub trait ExtractionProvider: Send + Sync {
    async fn extract(
        &self,
        image: &Path,
        focus: &ExtractionFocus,
        locked: &[Entity],
    ) -> Result<ExtractionOutput>;
}

#[async_trait]
pub trait VisualRenderer: Send + Sync {
    async fn render(&self, entities: &[Entity], grid: &GridShape) -> Result<RenderedArtifact>;
}

#[async_trait]
pub trait VisualComparator: Send + Sync {
    async fn compare(&self, image: &Path, artifact: &RenderedArtifact) -> Result<ComparisonResult>;
}

/// 未収束のランを人手レビューへ回す
#[async_trait]
pub trait Escalation: Send + Sync {
    async fn notify(&self, state: &RunState) -> Result<()>;
}
