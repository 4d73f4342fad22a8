//! 未収束ランの通知先

use crate::collaborators::Escalation;
use crate::error::Result;
use crate::job::RunState;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// ログに出すだけ
#[derive(Debug, Clone, Default)]
pub struct LogEscalation;

#[async_trait]
impl Escalation for LogEscalation {
    async fn notify(&self, state: &RunState) -> Result<()> {
        warn!(
            job = %state.job_id,
            status = ?state.status,
            rounds = state.rounds(),
            best = state.best_accuracy,
            reason = state.failure_reason.as_deref().unwrap_or(""),
            "人手レビューが必要"
        );
        Ok(())
    }
}

/// レビュー用フォルダに `<job_id>.review.json` を書き出す
#[derive(Debug, Clone)]
pub struct ReviewDirEscalation {
    dir: PathBuf,
}

impl ReviewDirEscalation {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn review_path(&self, job_id: &str) -> PathBuf {
        let safe: String = job_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.review.json", safe))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl Escalation for ReviewDirEscalation {
    async fn notify(&self, state: &RunState) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.review_path(&state.job_id);
        let json = serde_json::to_string_pretty(state)?;
        tokio::fs::write(&path, json).await?;
        info!(job = %state.job_id, path = %path.display(), "レビュー用ファイルを出力");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::RunStatus;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_review_dir_writes_state() {
        let dir = tempdir().expect("Failed to create temp dir");
        let escalation = ReviewDirEscalation::new(dir.path().join("review"));

        let mut state = RunState::new("job/1");
        state.finish(RunStatus::Exhausted, None);
        escalation.notify(&state).await.expect("通知失敗");

        let path = escalation.review_path("job/1");
        assert!(path.ends_with("job_1.review.json"));
        let content = std::fs::read_to_string(&path).unwrap();
        let restored: RunState = serde_json::from_str(&content).unwrap();
        assert_eq!(restored.status, RunStatus::Exhausted);
    }

    #[tokio::test]
    async fn test_log_escalation_ok() {
        let state = RunState::new("job");
        assert!(LogEscalation.notify(&state).await.is_ok());
    }
}
