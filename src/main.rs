use anyhow::Context;
use clap::Parser;
use shelf_ai_common::{parse_comparison_response, AccuracyAnalyzer, GridShape};
use shelf_ai_rust::{cli, config, convergence, cost, error, escalation, job, providers, render};
use cli::{Cli, Commands};
use config::Config;
use convergence::{CancelHandle, ConvergenceLoop};
use cost::CostTracker;
use error::ShelfAiError;
use job::{ExtractionJob, RunState, RunStatus};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = Config::load().context("設定の読み込みに失敗")?;
    if let Some(provider) = cli.ai_provider {
        config.provider.ai_provider = provider;
    }

    match cli.command {
        Commands::Run { job, output, target, max_rounds, budget, review_dir } => {
            println!("🛒 shelf-ai - 棚抽出\n");

            println!("[1/3] ジョブを読み込み中...");
            let mut extraction_job = ExtractionJob::load(&job)
                .with_context(|| format!("ジョブを読み込めません: {}", job.display()))?;
            if target.is_some() {
                extraction_job.target_accuracy = target;
            }
            if max_rounds.is_some() {
                extraction_job.max_rounds = max_rounds;
            }
            if budget.is_some() {
                extraction_job.budget = budget;
            }
            println!("✔ ジョブ {} ({})\n", extraction_job.job_id, extraction_job.image.display());

            let convergence_config = config.convergence.for_job(&extraction_job);
            let escalation: Arc<dyn shelf_ai_rust::collaborators::Escalation> = match review_dir {
                Some(dir) => Arc::new(escalation::ReviewDirEscalation::new(dir)),
                None => Arc::new(escalation::LogEscalation),
            };
            let runner = ConvergenceLoop::new(
                Arc::new(providers::CliExtractor::new(config.provider.clone())),
                Arc::new(render::SvgRenderer::new()),
                Arc::new(providers::CliComparator::new(config.provider.clone())),
                escalation,
                config.convergence.clone(),
            );

            // Ctrl+C で実行中の呼び出しを打ち切って停止
            let cancel = CancelHandle::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    println!("\n中断要求を受け付けました。実行中の呼び出しを打ち切ります");
                    on_signal.cancel();
                }
            });

            println!(
                "[2/3] 収束ループ実行中... (目標 {:.0}%, 最大 {}ラウンド, 予算 {:.2})",
                convergence_config.target_accuracy * 100.0,
                convergence_config.max_rounds,
                convergence_config.budget
            );
            let tracker = CostTracker::new(convergence_config.budget);
            let (state, aborted) = match runner.run_with(&extraction_job, &tracker, &cancel).await {
                Ok(state) => (state, None),
                Err(ShelfAiError::RunAborted { round, source, state }) => {
                    (*state, Some(format!("ラウンド{}で中断: {}", round, source)))
                }
                Err(e) => return Err(e).context("収束ループの実行に失敗"),
            };
            print_summary(&state);

            println!("[3/3] 結果を保存中...");
            let output = output.unwrap_or_else(|| default_output(&job, &state.job_id));
            let json = serde_json::to_string_pretty(&state)?;
            std::fs::write(&output, json)
                .with_context(|| format!("結果を書き込めません: {}", output.display()))?;
            println!("✔ 結果を保存: {}", output.display());

            if let Some(reason) = aborted {
                anyhow::bail!(reason);
            }
            match state.status {
                RunStatus::Converged => println!("\n✅ 収束しました"),
                _ => println!("\n⚠ 目標に届きませんでした（レビュー対象）"),
            }
        }

        Commands::Analyze { comparison, round, shelves, slots, output } => {
            let content = std::fs::read_to_string(&comparison)
                .with_context(|| format!("比較結果を読み込めません: {}", comparison.display()))?;
            let result = parse_comparison_response(&content)?;
            let grid = shelves.zip(slots).map(|(s, n)| GridShape::new(s, n));

            let analyzer = AccuracyAnalyzer::new(config.convergence.analyzer.clone());
            let analysis = analyzer.analyze(round, &result, grid.as_ref(), None);

            println!("精度: {:.1}%", analysis.overall_accuracy * 100.0);
            println!("  ロック候補: {}", analysis.lock_candidates.len());
            println!("  要修正: {} (上位{}件)", analysis.total_failures, analysis.failure_areas.len());
            for area in &analysis.failure_areas {
                println!(
                    "  - {} {} ({:.2}) → {}",
                    area.position,
                    area.category,
                    area.confidence,
                    area.strategy.hint()
                );
            }

            let json = serde_json::to_string_pretty(&analysis)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    println!("✔ 解析結果を保存: {}", path.display());
                }
                None => println!("{}", json),
            }
        }

        Commands::Config { show, init } => {
            let path = Config::config_path()?;

            if init {
                if path.exists() {
                    println!("設定ファイルは既に存在します: {}", path.display());
                } else {
                    Config::default().save_to(&path)?;
                    println!("✔ デフォルト設定を書き出しました: {}", path.display());
                }
            }

            if show || !init {
                println!("設定: {}", path.display());
                println!("  AIプロバイダ: {}", config.provider.ai_provider.command_name());
                println!("  モデル: {}", config.provider.model.as_deref().unwrap_or("(既定)"));
                println!("  目標精度: {}", config.convergence.target_accuracy);
                println!("  最大ラウンド: {}", config.convergence.max_rounds);
                println!("  予算: {}", config.convergence.budget);
                println!("  棚並列数: {}", config.convergence.shelf_concurrency);
                println!("  ロック閾値: {}", config.convergence.analyzer.lock_threshold);
                println!("  要修正閾値: {}", config.convergence.analyzer.failure_threshold);
            }
        }
    }

    Ok(())
}

fn print_summary(state: &RunState) {
    println!("✔ {}ラウンド実行\n", state.rounds());
    for record in &state.history {
        println!(
            "  ラウンド{}: 精度 {:.1}% / 要修正 {} / コスト {:.3}",
            record.round,
            record.analysis.overall_accuracy * 100.0,
            record.analysis.total_failures,
            record.cost
        );
    }
    println!(
        "\n  最良: ラウンド{} ({:.1}%) / ロック {}件 / 合計コスト {:.3}",
        state.best_round,
        state.best_accuracy * 100.0,
        state.locked_positions.len(),
        state.total_cost
    );
    if let Some(reason) = &state.failure_reason {
        println!("  理由: {}", reason);
    }
    println!();
}

fn default_output(job_path: &Path, job_id: &str) -> PathBuf {
    let dir = job_path.parent().unwrap_or(Path::new("."));
    dir.join(format!("{}.result.json", job_id))
}
