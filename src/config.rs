use crate::ai_provider::AiProvider;
use crate::error::{Result, ShelfAiError};
use crate::job::ExtractionJob;
use serde::{Deserialize, Serialize};
use shelf_ai_common::{default_fields, AnalyzerConfig, FieldDescriptor, LockPolicy};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 設定ファイルの場所を上書きする環境変数
pub const CONFIG_ENV: &str = "SHELF_AI_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub convergence: ConvergenceConfig,
    pub provider: ProviderConfig,
}

/// 収束ループの設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConvergenceConfig {
    /// この精度以上で収束
    pub target_accuracy: f64,
    pub max_rounds: u32,
    /// 1ランの予算（プロバイダコストの単位）
    pub budget: f64,
    /// ラウンド開始前に必要な残予算
    pub estimated_round_cost: f64,
    /// 初回ラウンドで構造をロックする信頼度
    pub structure_lock_confidence: f64,
    /// ラウンド内の棚並列数
    pub shelf_concurrency: usize,
    /// 抽出リクエスト1件のタイムアウト（秒）
    pub request_timeout_secs: Option<u64>,
    pub analyzer: AnalyzerConfig,
    pub lock_policy: LockPolicy,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            target_accuracy: 0.95,
            max_rounds: 5,
            budget: 1.0,
            estimated_round_cost: 0.0,
            structure_lock_confidence: 0.9,
            shelf_concurrency: 4,
            request_timeout_secs: Some(180),
            analyzer: AnalyzerConfig::default(),
            lock_policy: LockPolicy::default(),
        }
    }
}

impl ConvergenceConfig {
    /// ジョブ側の上書きを適用
    pub fn for_job(&self, job: &ExtractionJob) -> Self {
        let mut config = self.clone();
        if let Some(target) = job.target_accuracy {
            config.target_accuracy = target;
        }
        if let Some(max_rounds) = job.max_rounds {
            config.max_rounds = max_rounds;
        }
        if let Some(budget) = job.budget {
            config.budget = budget;
        }
        config
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.target_accuracy > 0.0 && self.target_accuracy <= 1.0) {
            return Err(ShelfAiError::Config(format!(
                "targetAccuracy は 0より大きく1以下: {}",
                self.target_accuracy
            )));
        }
        if self.max_rounds == 0 {
            return Err(ShelfAiError::Config("maxRounds は1以上".into()));
        }
        if self.budget < 0.0 {
            return Err(ShelfAiError::Config(format!("budget が負: {}", self.budget)));
        }
        if self.shelf_concurrency == 0 {
            return Err(ShelfAiError::Config("shelfConcurrency は1以上".into()));
        }
        if self.analyzer.failure_threshold > self.analyzer.lock_threshold {
            return Err(ShelfAiError::Config(
                "failureThreshold が lockThreshold を超えています".into(),
            ));
        }
        Ok(())
    }
}

/// AIプロバイダ（CLI）の設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    pub ai_provider: AiProvider,
    pub model: Option<String>,
    /// 失敗時の再試行回数
    pub retries: u32,
    pub retry_backoff_ms: u64,
    /// CLIはコストを返さないので1呼び出しあたりの見積もり
    pub cost_per_call: f64,
    /// 描画結果などの一時ファイル置き場
    pub work_dir: Option<PathBuf>,
    pub fields: Vec<FieldDescriptor>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            ai_provider: AiProvider::Claude,
            model: None,
            retries: 2,
            retry_backoff_ms: 1000,
            cost_per_call: 0.02,
            work_dir: None,
            fields: default_fields(),
        }
    }
}

impl ProviderConfig {
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("shelf-ai"))
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.convergence.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        // 環境変数を優先
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.trim().is_empty() {
                return Ok(PathBuf::from(path));
            }
        }

        let home = dirs::home_dir()
            .ok_or_else(|| ShelfAiError::Config("ホームディレクトリが見つかりません".into()))?;
        Ok(home.join(".config").join("shelf-ai").join("config.json"))
    }
}
