//! AI CLI連携モジュール
//!
//! claude / codex / gemini の非対話モードを子プロセスとして呼び出す:
//! - CliExtractor: 棚画像から商品を抽出（ExtractionProvider）
//! - CliComparator: 描画結果と元画像の比較（VisualComparator）
//!
//! 一時的な失敗（終了コード・パース失敗）はここで再試行する。

use crate::ai_provider::AiProvider;
use crate::collaborators::{
    ExtractionOutput, ExtractionProvider, RenderedArtifact, VisualComparator,
};
use crate::config::ProviderConfig;
use crate::error::{Result, ShelfAiError};
use async_trait::async_trait;
use shelf_ai_common::{
    build_comparison_prompt, build_extraction_prompt, parse_comparison_response,
    parse_extraction_response, ComparisonResult, Entity, ExtractionFocus,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::process::Command;
use tracing::{debug, warn};

/// CLIの呼び出し設定
#[derive(Debug, Clone)]
struct CliRunner {
    provider: AiProvider,
    model: Option<String>,
}

impl CliRunner {
    async fn run(&self, prompt: &str) -> Result<String> {
        let command = self.provider.command_name();

        // Windowsではcmd /c経由、改行はスペースに置換
        #[cfg(windows)]
        let prompt = prompt.replace(['\r', '\n'], " ");
        #[cfg(windows)]
        let prompt = prompt.as_str();

        let args = self.provider.prompt_args(prompt, self.model.as_deref());

        #[cfg(windows)]
        let mut cmd = {
            let mut c = Command::new("cmd");
            c.arg("/c").arg(command);
            c
        };

        #[cfg(not(windows))]
        let mut cmd = Command::new(command);

        let output = cmd
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ShelfAiError::CliExecution(format!("{} 実行エラー: {}", command, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ShelfAiError::CliExecution(format!(
                "{} failed (code {:?}): {}",
                command,
                output.status.code(),
                stderr
            )));
        }

        let response = String::from_utf8_lossy(&output.stdout).to_string();
        let preview: String = response.chars().take(300).collect();
        debug!(command, len = response.len(), preview = %preview, "CLIレスポンス");

        Ok(response)
    }
}

/// 再試行つきで呼び出し、(結果, 試行回数) を返す
async fn with_retries<T, F, Fut>(config: &ProviderConfig, label: &str, mut call: F) -> Result<(T, u32)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.retries + 1;
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        match call().await {
            Ok(value) => return Ok((value, attempt)),
            Err(e) => {
                warn!(label, attempt, max_attempts, error = %e, "プロバイダ呼び出し失敗");
                last_error = Some(e);
                if attempt < max_attempts {
                    let backoff = config.retry_backoff_ms * attempt as u64;
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
        }
    }

    Err(ShelfAiError::Provider(format!(
        "{}: {}回試行して失敗: {}",
        label,
        max_attempts,
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

fn path_for_prompt(path: &Path) -> String {
    let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    absolute.display().to_string().replace('\\', "/")
}

pub struct CliExtractor {
    runner: CliRunner,
    config: ProviderConfig,
}

impl CliExtractor {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            runner: CliRunner {
                provider: config.ai_provider,
                model: config.model.clone(),
            },
            config,
        }
    }
}

#[async_trait]
impl ExtractionProvider for CliExtractor {
    async fn extract(
        &self,
        image: &Path,
        focus: &ExtractionFocus,
        locked: &[Entity],
    ) -> Result<ExtractionOutput> {
        let prompt = format!(
            "Read the following image file and analyze it: {}\n\n{}",
            path_for_prompt(image),
            build_extraction_prompt(focus, locked, &self.config.fields)
        );
        debug!(round = focus.round, len = prompt.len(), "抽出プロンプト");

        let runner = &self.runner;
        let prompt = prompt.as_str();
        let round = focus.round;
        let (parsed, attempts) = with_retries(&self.config, "抽出", move || async move {
            let response = runner.run(prompt).await?;
            Ok(parse_extraction_response(&response, round)?)
        })
        .await?;

        Ok(ExtractionOutput {
            entities: parsed.entities,
            cost: self.config.cost_per_call * attempts as f64,
            grid: parsed.grid,
        })
    }
}

pub struct CliComparator {
    runner: CliRunner,
    config: ProviderConfig,
}

impl CliComparator {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            runner: CliRunner {
                provider: config.ai_provider,
                model: config.model.clone(),
            },
            config,
        }
    }

    async fn write_artifact(&self, artifact: &RenderedArtifact) -> Result<PathBuf> {
        let dir = self.config.work_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let path = dir.join(format!("render-{}.{}", nanos, artifact.format.extension()));
        tokio::fs::write(&path, &artifact.bytes).await?;
        Ok(path)
    }
}

#[async_trait]
impl VisualComparator for CliComparator {
    async fn compare(&self, image: &Path, artifact: &RenderedArtifact) -> Result<ComparisonResult> {
        let artifact_path = self.write_artifact(artifact).await?;
        let artifact_str = path_for_prompt(&artifact_path);
        let prompt = format!(
            "Read the following files and compare them: {}, {}\n\n{}",
            path_for_prompt(image),
            artifact_str,
            build_comparison_prompt(&artifact_str)
        );

        let runner = &self.runner;
        let prompt = prompt.as_str();
        let result = with_retries(&self.config, "比較", move || async move {
            let response = runner.run(prompt).await?;
            Ok(parse_comparison_response(&response)?)
        })
        .await;

        if let Err(e) = tokio::fs::remove_file(&artifact_path).await {
            debug!(path = %artifact_path.display(), error = %e, "描画ファイルの削除に失敗");
        }

        result.map(|(comparison, _)| comparison)
    }
}
