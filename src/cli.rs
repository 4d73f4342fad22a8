use clap::{Parser, Subcommand};
use crate::ai_provider::AiProvider;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "shelf-ai")]
#[command(about = "棚画像の商品抽出を反復して収束させるツール", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 詳細ログを出力
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// AIプロバイダ (claude/codex/gemini)。省略時は設定ファイルの値
    #[arg(long, global = true)]
    pub ai_provider: Option<AiProvider>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// ジョブJSONを読み込んで収束ループを実行
    Run {
        /// ジョブJSONファイル
        #[arg(required = true)]
        job: PathBuf,

        /// 結果JSON（デフォルト: ジョブと同じ場所の <job_id>.result.json）
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// 目標精度
        #[arg(short, long)]
        target: Option<f64>,

        /// 最大ラウンド数
        #[arg(long)]
        max_rounds: Option<u32>,

        /// 予算
        #[arg(short, long)]
        budget: Option<f64>,

        /// 未収束時にレビュー用JSONを書き出すフォルダ
        #[arg(long)]
        review_dir: Option<PathBuf>,
    },

    /// 比較結果JSONから精度解析だけを行う（AI呼び出しなし）
    Analyze {
        /// 比較結果JSONファイル
        #[arg(required = true)]
        comparison: PathBuf,

        /// ラウンド番号
        #[arg(short, long, default_value = "1")]
        round: u32,

        /// 棚数（--slots と併用）
        #[arg(long, requires = "slots")]
        shelves: Option<u32>,

        /// 1段あたりの最大スロット数
        #[arg(long, requires = "shelves")]
        slots: Option<u32>,

        /// 解析結果の出力先
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// 設定の表示・初期化
    Config {
        /// 現在の設定を表示
        #[arg(long)]
        show: bool,

        /// デフォルト設定を書き出す
        #[arg(long)]
        init: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_overrides() {
        let cli = Cli::parse_from([
            "shelf-ai", "run", "job.json", "--target", "0.9", "--max-rounds", "3",
            "--budget", "0.5", "--ai-provider", "gemini",
        ]);
        assert_eq!(cli.ai_provider, Some(AiProvider::Gemini));
        match cli.command {
            Commands::Run { job, target, max_rounds, budget, .. } => {
                assert_eq!(job, PathBuf::from("job.json"));
                assert_eq!(target, Some(0.9));
                assert_eq!(max_rounds, Some(3));
                assert_eq!(budget, Some(0.5));
            }
            _ => panic!("run として解釈されるはず"),
        }
    }

    #[test]
    fn test_analyze_grid_requires_both() {
        let result = Cli::try_parse_from(["shelf-ai", "analyze", "c.json", "--shelves", "3"]);
        assert!(result.is_err());
    }
}
