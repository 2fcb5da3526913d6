//! Play24 スクレイパーライブラリ
//!
//! - 24.play.pl にログインして残高モーダル・サービス一覧を取得
//! - ルールカタログに従って項目を抽出し、型付きの値に正規化
//!
//! # 使用例
//!
//! ```rust,ignore
//! use play24_scraper::{ScraperService, ScrapeRequest, ScraperConfig};
//! use tower::Service;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut service = ScraperService::new();
//!
//!     let config = ScraperConfig::new("500100200", "password").with_headless(false);
//!     let result = service.call(ScrapeRequest::full(config)).await.unwrap();
//!
//!     for line in result.mapping.to_lines() {
//!         println!("{}", line);
//!     }
//! }
//! ```
//!
//! # HTTP方式で残高のみ取得
//!
//! ```rust,ignore
//! use play24_scraper::{scrape_balance, DriverKind, ScraperConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ScraperConfig::new("500100200", "password").with_driver(DriverKind::Http);
//!     let mapping = scrape_balance(config).await.unwrap();
//!     println!("{}", serde_json::to_string_pretty(&mapping).unwrap());
//! }
//! ```

pub mod assemble;
pub mod browser;
pub mod catalog;
pub mod challenge;
pub mod config;
pub mod credentials;
pub mod error;
pub mod extract;
pub mod http;
pub mod portal;
pub mod service;
pub mod traits;
pub mod types;

// 主要な型をリエクスポート
pub use assemble::{assemble, ConflictPolicy, ResultMapping};
pub use browser::BrowserAdapter;
pub use catalog::RuleCatalog;
pub use challenge::{ChallengeHandler, ChallengePrompt, NoChallenge, StdinChallenge};
pub use config::{DriverKind, ScraperConfig};
pub use credentials::Credentials;
pub use error::{AuthError, CatalogError, ConfigError, FetchError, FieldError, ScraperError};
pub use http::HttpAdapter;
pub use service::{scrape_balance, scrape_services, ScrapeRequest, ScrapeResult, ScrapeScope, ScraperService};
pub use traits::{PortalSession, SessionAdapter};
pub use types::{ExtractedField, FieldValue, PageId, RawPage};
