//! play24 - Play24 の残高・サービス照会
//!
//! ```bash
//! # 残高のみ（設定ファイル ~/.config/24.play.pl.toml を使用）
//! play24
//!
//! # 残高とサービス一覧をJSONで
//! play24 --scope full --format json
//!
//! # ブラウザを表示し、取得したページを保存
//! play24 --debug --keep ./pages
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use play24_scraper::{
    ChallengeHandler, DriverKind, NoChallenge, ScrapeRequest, ScrapeScope, ScraperConfig,
    ScraperService, StdinChallenge,
};

/// Play24 (24.play.pl) の残高・サービスを取得する
#[derive(Parser)]
#[command(name = "play24", version)]
struct Cli {
    /// 設定ファイル（既定: $XDG_CONFIG_HOME/24.play.pl.toml）
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// ログイン方式（設定ファイルの browser.driver より優先）
    #[arg(long)]
    driver: Option<DriverKind>,

    /// 取得範囲
    #[arg(long, short, default_value = "balance")]
    scope: ScrapeScope,

    /// 出力形式
    #[arg(long, short, default_value = "text")]
    format: OutputFormat,

    /// ブラウザを表示する
    #[arg(long, short)]
    debug: bool,

    /// 取得したページを保存するディレクトリ
    #[arg(long, short)]
    keep: Option<PathBuf>,

    /// SMS認証コードを待たない（無人実行用）
    #[arg(long)]
    no_challenge: bool,

    /// 詳細ログ
    #[arg(long, short)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// `key: value` 形式
    Text,
    Json,
}

fn setup_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("play24_scraper=debug,play24=debug,warn")
        } else {
            EnvFilter::new("warn")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// 設定ファイルが無ければ環境変数のみで構成する
fn load_config(path: Option<PathBuf>) -> Result<ScraperConfig> {
    let path = match path {
        Some(path) => path,
        None => ScraperConfig::default_path()?,
    };

    if path.exists() {
        ScraperConfig::load(&path)
            .with_context(|| format!("設定ファイル {} を読み込めません", path.display()))
    } else {
        ScraperConfig::from_toml("", |key| std::env::var(key).ok()).with_context(|| {
            format!(
                "設定ファイル {} がありません。PLAY24_LOGIN / PLAY24_PASSWORD を設定してください",
                path.display()
            )
        })
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = load_config(cli.config)?;
    if let Some(driver) = cli.driver {
        config = config.with_driver(driver);
    }
    if cli.debug {
        config = config.with_headless(false);
    }
    if let Some(dir) = cli.keep {
        config = config.with_keep_dir(dir);
    }

    let challenge: Arc<dyn ChallengeHandler> = if cli.no_challenge {
        Arc::new(NoChallenge)
    } else {
        Arc::new(StdinChallenge)
    };

    let service = ScraperService::new().with_challenge(challenge);
    let result = service.run(ScrapeRequest::new(config, cli.scope)).await?;

    match cli.format {
        OutputFormat::Text => {
            for line in result.mapping.to_lines() {
                println!("{}", line);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&result.mapping)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("エラー: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
