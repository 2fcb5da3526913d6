//! 残高照会テスト
//!
//! 実行方法:
//! ```
//! PLAY24_LOGIN=500100200 PLAY24_PASSWORD=... cargo run --example balance_check
//! ```
//!
//! `PLAY24_DRIVER=http` でHTTP方式、`HEADLESS=false` でブラウザを表示する。

use play24_scraper::{DriverKind, ScrapeRequest, ScraperConfig, ScraperService};
use tower::Service;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ログ設定
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 環境変数から認証情報を取得
    let login = std::env::var("PLAY24_LOGIN").expect("PLAY24_LOGIN not set");
    let password = std::env::var("PLAY24_PASSWORD").expect("PLAY24_PASSWORD not set");
    let driver = match std::env::var("PLAY24_DRIVER").as_deref() {
        Ok("http") => DriverKind::Http,
        _ => DriverKind::Browser,
    };
    let headless = std::env::var("HEADLESS").map(|v| v != "false").unwrap_or(true);

    println!("=== Play24 Balance Check ===");
    println!("Driver: {:?}", driver);
    println!("Headless: {}", headless);
    println!();

    let config = ScraperConfig::new(login, password)
        .with_driver(driver)
        .with_headless(headless);

    let mut service = ScraperService::new();
    let result = service.call(ScrapeRequest::full(config)).await?;

    println!("Fetched pages: {}", result.pages.len());
    for line in result.mapping.to_lines() {
        println!("  {}", line);
    }

    Ok(())
}
