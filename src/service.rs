use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower::Service;
use tracing::{info, warn};

use crate::assemble::{assemble, ConflictPolicy, ResultMapping};
use crate::browser::BrowserAdapter;
use crate::catalog::RuleCatalog;
use crate::challenge::{ChallengeHandler, StdinChallenge};
use crate::config::{DriverKind, ScraperConfig};
use crate::error::ScraperError;
use crate::extract::extract;
use crate::http::HttpAdapter;
use crate::traits::SessionAdapter;
use crate::types::{PageId, RawPage};

/// 取得範囲
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ScrapeScope {
    /// 残高モーダルのみ
    #[default]
    Balance,
    /// 残高とサービス一覧
    Full,
}

impl ScrapeScope {
    pub fn pages(&self) -> &'static [PageId] {
        match self {
            ScrapeScope::Balance => &[PageId::Balance],
            ScrapeScope::Full => &[PageId::Balance, PageId::Services],
        }
    }
}

/// スクレイピングリクエスト
#[derive(Debug, Clone)]
pub struct ScrapeRequest {
    pub config: ScraperConfig,
    pub scope: ScrapeScope,
}

impl ScrapeRequest {
    pub fn new(config: ScraperConfig, scope: ScrapeScope) -> Self {
        Self { config, scope }
    }

    pub fn balance(config: ScraperConfig) -> Self {
        Self::new(config, ScrapeScope::Balance)
    }

    pub fn full(config: ScraperConfig) -> Self {
        Self::new(config, ScrapeScope::Full)
    }
}

/// スクレイピング結果
#[derive(Debug)]
pub struct ScrapeResult {
    pub mapping: ResultMapping,
    /// 取得した生ページ（取得順）
    pub pages: Vec<RawPage>,
}

/// tower::Serviceを実装したスクレイパーサービス
#[derive(Clone)]
pub struct ScraperService {
    challenge: Arc<dyn ChallengeHandler>,
    policy: ConflictPolicy,
    /// 指定時は設定の driver より優先する
    adapter: Option<Arc<dyn SessionAdapter>>,
}

impl Default for ScraperService {
    fn default() -> Self {
        Self::new()
    }
}

impl ScraperService {
    /// SMS認証コードは端末から読む
    pub fn new() -> Self {
        Self {
            challenge: Arc::new(StdinChallenge),
            policy: ConflictPolicy::default(),
            adapter: None,
        }
    }

    pub fn with_challenge(mut self, challenge: Arc<dyn ChallengeHandler>) -> Self {
        self.challenge = challenge;
        self
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn SessionAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    fn adapter_for(&self, config: &ScraperConfig) -> Arc<dyn SessionAdapter> {
        if let Some(adapter) = &self.adapter {
            return adapter.clone();
        }
        match config.driver {
            DriverKind::Http => Arc::new(HttpAdapter::new(config)),
            DriverKind::Browser => Arc::new(BrowserAdapter::new(config)),
        }
    }

    /// ログイン → 取得 → 抽出 → 統合
    pub async fn run(&self, request: ScrapeRequest) -> Result<ScrapeResult, ScraperError> {
        let ScrapeRequest { config, scope } = request;

        let catalog = match &config.catalog_path {
            Some(path) => RuleCatalog::from_path(path)?,
            None => RuleCatalog::builtin()?,
        };
        let pages = scope.pages();

        info!(driver = ?config.driver, scope = ?scope, "Starting scrape");
        let adapter = self.adapter_for(&config);
        let raw = adapter
            .execute(config.credentials.clone(), self.challenge.as_ref(), pages)
            .await?;

        if let Some(dir) = &config.keep_dir {
            keep_pages(dir, &raw)?;
        }

        let extracted: Vec<_> = raw
            .iter()
            .map(|page| {
                let fields = catalog
                    .page(page.page)
                    .map(|rules| extract(page, rules))
                    .unwrap_or_default();
                info!(page = %page.page, fields = fields.len(), "Extracted page");
                (page.page, fields)
            })
            .collect();

        let mut mapping = assemble(&extracted, &self.policy);
        mapping.fill_defaults(&fetched_defaults(&catalog, pages));

        if !config.output.is_empty() {
            mapping = select_output(&catalog, &mapping, &config.output)?;
        }

        info!(fields = mapping.len(), "Scrape finished");
        Ok(ScrapeResult { mapping, pages: raw })
    }
}

impl Service<ScrapeRequest> for ScraperService {
    type Response = ScrapeResult;
    type Error = ScraperError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ScrapeRequest) -> Self::Future {
        info!("スクレイピングリクエスト受信: scope={:?}", req.scope);

        let service = self.clone();
        Box::pin(async move { service.run(req).await })
    }
}

/// 残高のみ取得
pub async fn scrape_balance(config: ScraperConfig) -> Result<ResultMapping, ScraperError> {
    let result = ScraperService::new().run(ScrapeRequest::balance(config)).await?;
    Ok(result.mapping)
}

/// 残高とサービス一覧を取得
pub async fn scrape_services(config: ScraperConfig) -> Result<ResultMapping, ScraperError> {
    let result = ScraperService::new().run(ScrapeRequest::full(config)).await?;
    Ok(result.mapping)
}

/// 取得したページの項目だけ false 補完の対象にする
fn fetched_defaults<'a>(catalog: &'a RuleCatalog, pages: &[PageId]) -> Vec<&'a str> {
    catalog
        .default_false
        .iter()
        .map(String::as_str)
        .filter(|field| {
            pages.iter().any(|page| {
                catalog
                    .page(*page)
                    .is_some_and(|rules| rules.rules.iter().any(|r| r.field == *field))
            })
        })
        .collect()
}

/// カタログに無いキーはエラー。カタログにあるが今回得られなかったキーは省く
fn select_output(
    catalog: &RuleCatalog,
    mapping: &ResultMapping,
    keys: &[String],
) -> Result<ResultMapping, ScraperError> {
    let mut present = Vec::with_capacity(keys.len());
    for key in keys {
        if !catalog.field_names().any(|name| name == key) {
            return Err(ScraperError::UnknownField(key.clone()));
        }
        if mapping.contains(key) {
            present.push(key.as_str());
        } else {
            warn!(field = %key, "Requested field was not extracted");
        }
    }
    mapping.select(&present)
}

fn keep_pages(dir: &Path, pages: &[RawPage]) -> Result<(), ScraperError> {
    std::fs::create_dir_all(dir)?;
    for page in pages {
        let path = dir.join(page.file_name());
        std::fs::write(&path, page.to_text())?;
        info!("ページを保存: {:?}", path);
    }
    Ok(())
}
