//! ジョブ入力とランの状態

use crate::error::{ShelfAiError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shelf_ai_common::{AccuracyAnalysis, Entity, GridShape, LockedPosition};
use std::path::{Path, PathBuf};

/// 1枚の棚画像に対する収束ジョブ
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionJob {
    #[serde(default)]
    pub job_id: String,

    /// 元画像
    pub image: PathBuf,

    /// 既知の棚構造（省略時はプロバイダ推定・エンティティから推定）
    #[serde(default)]
    pub grid: Option<GridShape>,

    /// 以下は設定値の上書き
    #[serde(default)]
    pub target_accuracy: Option<f64>,
    #[serde(default)]
    pub max_rounds: Option<u32>,
    #[serde(default)]
    pub budget: Option<f64>,
}

impl ExtractionJob {
    pub fn new(job_id: &str, image: impl Into<PathBuf>) -> Self {
        Self {
            job_id: job_id.to_string(),
            image: image.into(),
            grid: None,
            target_accuracy: None,
            max_rounds: None,
            budget: None,
        }
    }

    /// ジョブJSONを読み込む
    ///
    /// 画像の相対パスはJSONファイルの位置基準で解決し、
    /// job_id が空なら画像のハッシュから作る
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ShelfAiError::FileNotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)?;
        let mut job: ExtractionJob = serde_json::from_str(&content)?;

        if job.image.is_relative() {
            let base_dir = path.parent().unwrap_or(Path::new("."));
            job.image = base_dir.join(&job.image);
        }

        if !job.image.exists() {
            return Err(ShelfAiError::FileNotFound(job.image.display().to_string()));
        }

        if job.job_id.is_empty() {
            job.job_id = fingerprint(&job.image)?;
        }

        Ok(job)
    }
}

/// 画像内容のSHA-256先頭16桁
pub fn fingerprint(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    let digest = Sha256::digest(&bytes);
    Ok(hex::encode(digest)[..16].to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Converged,
    Exhausted,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// 1ラウンドの記録（追記のみ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationRecord {
    pub round: u32,
    pub analysis: AccuracyAnalysis,
    /// マージ後のエンティティ
    pub entities: Vec<Entity>,
    pub cost: f64,
    pub duration_ms: u64,
    /// 抽出に失敗して前ラウンドの値を引き継いだ棚
    #[serde(default)]
    pub fallback_shelves: Vec<u32>,
}

/// ランの状態
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub job_id: String,
    pub status: RunStatus,
    pub best_accuracy: f64,
    pub best_round: u32,
    pub best_entities: Vec<Entity>,
    pub history: Vec<IterationRecord>,
    pub locked_positions: Vec<LockedPosition>,
    pub total_cost: f64,
    pub structure_locked: bool,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunState {
    pub fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: RunStatus::Running,
            best_accuracy: 0.0,
            best_round: 0,
            best_entities: Vec::new(),
            history: Vec::new(),
            locked_positions: Vec::new(),
            total_cost: 0.0,
            structure_locked: false,
            failure_reason: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn rounds(&self) -> u32 {
        self.history.len() as u32
    }

    /// ベストを更新したら true
    pub fn record_best(&mut self, round: u32, accuracy: f64, entities: &[Entity]) -> bool {
        if self.best_round == 0 || accuracy > self.best_accuracy {
            self.best_accuracy = accuracy;
            self.best_round = round;
            self.best_entities = entities.to_vec();
            true
        } else {
            false
        }
    }

    pub fn finish(&mut self, status: RunStatus, reason: Option<String>) {
        self.status = status;
        self.failure_reason = reason;
        self.finished_at = Some(Utc::now());
    }

    /// 人手レビューが必要か
    pub fn needs_review(&self) -> bool {
        matches!(self.status, RunStatus::Exhausted | RunStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelf_ai_common::Position;
    use tempfile::tempdir;

    #[test]
    fn test_record_best_only_on_improvement() {
        let mut state = RunState::new("job");
        let first = vec![Entity::new(Position::new(1, 1), 0.5)];
        let second = vec![Entity::new(Position::new(1, 1), 0.9)];

        assert!(state.record_best(1, 0.0, &first));
        assert!(state.record_best(2, 0.6, &second));
        assert!(!state.record_best(3, 0.6, &first));
        assert_eq!(state.best_round, 2);
        assert_eq!(state.best_entities, second);
    }

    #[test]
    fn test_finish_marks_terminal() {
        let mut state = RunState::new("job");
        assert!(!state.status.is_terminal());
        state.finish(RunStatus::Exhausted, None);
        assert!(state.status.is_terminal());
        assert!(state.needs_review());
        assert!(state.finished_at.is_some());
    }

    #[test]
    fn test_job_load_resolves_relative_image() {
        let dir = tempdir().expect("Failed to create temp dir");
        std::fs::write(dir.path().join("shelf.jpg"), b"dummy image").unwrap();
        let job_path = dir.path().join("job.json");
        std::fs::write(&job_path, r#"{"image": "shelf.jpg", "maxRounds": 3}"#).unwrap();

        let job = ExtractionJob::load(&job_path).expect("ジョブ読み込み失敗");
        assert_eq!(job.image, dir.path().join("shelf.jpg"));
        assert_eq!(job.max_rounds, Some(3));
        assert_eq!(job.job_id.len(), 16);
        assert_eq!(job.job_id, fingerprint(&job.image).unwrap());
    }

    #[test]
    fn test_job_load_missing_image() {
        let dir = tempdir().expect("Failed to create temp dir");
        let job_path = dir.path().join("job.json");
        std::fs::write(&job_path, r#"{"image": "nope.jpg"}"#).unwrap();

        let err = ExtractionJob::load(&job_path).unwrap_err();
        assert!(matches!(err, ShelfAiError::FileNotFound(_)));
    }
}
