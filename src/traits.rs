use async_trait::async_trait;
use futures::future::try_join_all;
use tracing::{info, warn};

use crate::challenge::ChallengeHandler;
use crate::credentials::Credentials;
use crate::error::{AuthError, FetchError, ScraperError};
use crate::types::{PageId, RawPage};

/// ログイン方式ごとのセッション生成
#[async_trait]
pub trait SessionAdapter: Send + Sync {
    /// ログイン実行。失敗時はブラウザ・接続を解放してから返す
    async fn authenticate(
        &self,
        credentials: Credentials,
        challenge: &dyn ChallengeHandler,
    ) -> Result<Box<dyn PortalSession>, AuthError>;

    /// 一括実行（authenticate → fetch → close）
    async fn execute(
        &self,
        credentials: Credentials,
        challenge: &dyn ChallengeHandler,
        pages: &[PageId],
    ) -> Result<Vec<RawPage>, ScraperError> {
        let session = self.authenticate(credentials, challenge).await?;
        let fetched = fetch_all(session.as_ref(), pages).await;

        // 取得に失敗してもログアウトは必ず行う
        if let Err(e) = session.close().await {
            warn!("Failed to close session: {}", e);
        }

        Ok(fetched?)
    }
}

/// ログイン済みセッション
#[async_trait]
pub trait PortalSession: Send + Sync {
    /// ページ取得（再ログインはしない）
    async fn fetch(&self, page: PageId) -> Result<RawPage, FetchError>;

    /// 同一セッションで並行取得できるか
    fn concurrent_fetch(&self) -> bool {
        false
    }

    /// ログアウトしてリソースを解放
    async fn close(self: Box<Self>) -> Result<(), ScraperError>;
}

/// 指定順でページを取得する。結果の順序は `pages` と同じ
pub async fn fetch_all(
    session: &dyn PortalSession,
    pages: &[PageId],
) -> Result<Vec<RawPage>, FetchError> {
    if session.concurrent_fetch() {
        info!(count = pages.len(), "Fetching pages concurrently");
        return try_join_all(pages.iter().map(|page| session.fetch(*page))).await;
    }

    let mut fetched = Vec::with_capacity(pages.len());
    for page in pages {
        info!(page = %page, "Fetching page");
        fetched.push(session.fetch(*page).await?);
    }
    Ok(fetched)
}
