use crate::job::RunState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShelfAiError {
    #[error("設定エラー: {0}")]
    Config(String),

    #[error("ファイルが見つかりません: {0}")]
    FileNotFound(String),

    /// プロバイダ側のリトライ後も失敗
    #[error("プロバイダ呼び出しエラー: {0}")]
    Provider(String),

    #[error("予算超過: 要求 {requested:.4} / 残り {remaining:.4}")]
    BudgetExceeded { requested: f64, remaining: f64 },

    #[error("比較結果を取得できません: {0}")]
    ComparisonUnavailable(String),

    #[error("一部の棚で抽出に失敗: {shelves:?}")]
    PartialExtraction { shelves: Vec<u32> },

    #[error("タイムアウト: {0}")]
    Timeout(String),

    #[error("CLI実行エラー: {0}")]
    CliExecution(String),

    /// ラン全体を止めるエラー。ベスト結果を含む状態を呼び出し側へ返す
    #[error("ラウンド{round}でラン中断: {source}")]
    RunAborted {
        round: u32,
        #[source]
        source: Box<ShelfAiError>,
        state: Box<RunState>,
    },

    #[error("JSON解析エラー: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IOエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Common(#[from] shelf_ai_common::Error),
}

impl ShelfAiError {
    /// ラン中断なら中断時点の状態
    pub fn run_state(&self) -> Option<&RunState> {
        match self {
            ShelfAiError::RunAborted { state, .. } => Some(state),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ShelfAiError>;
