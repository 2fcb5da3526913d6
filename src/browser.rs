//! ブラウザ方式のセッション
//!
//! Chromeを起動してログイン画面を実際に操作する。残高はようこそ画面の
//! モーダル、サービスは一覧画面のコンテナからHTMLを取り出す。

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use reqwest::Url;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::challenge::{await_code, ChallengeHandler, ChallengePrompt};
use crate::config::{PortalConfig, ScraperConfig};
use crate::credentials::Credentials;
use crate::error::{AuthError, FetchError, ScraperError};
use crate::portal::{
    self, LoginOutcome, BALANCE_BUTTON, LOADER, LOGIN_INPUT, LOGIN_TITLE, LOGOUT_BUTTON, MODAL_CLOSE,
    PASSWORD_INPUT, SUBMIT_BUTTON,
};
use crate::traits::{PortalSession, SessionAdapter};
use crate::types::{PageId, RawPage};

/// 入力操作の間隔（速すぎるとポータル側のスクリプトが取りこぼす）
const TYPE_PAUSE: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct BrowserAdapter {
    portal: PortalConfig,
    headless: bool,
    chrome_path: Option<PathBuf>,
    timeout: Duration,
    challenge_timeout: Duration,
}

impl BrowserAdapter {
    pub fn new(config: &ScraperConfig) -> Self {
        Self {
            portal: config.portal.clone(),
            headless: config.headless,
            chrome_path: config.chrome_path.clone(),
            timeout: config.timeout,
            challenge_timeout: config.challenge_timeout,
        }
    }

    fn chrome_path(&self) -> Option<PathBuf> {
        self.chrome_path
            .clone()
            .or_else(|| std::env::var_os("CHROME_PATH").map(PathBuf::from))
    }

    /// ブラウザを起動
    async fn launch(&self) -> Result<(Browser, JoinHandle<()>), AuthError> {
        info!(headless = self.headless, "Launching browser");

        let mut builder = BrowserConfig::builder().window_size(1280, 800);
        if let Some(path) = self.chrome_path() {
            builder = builder.chrome_executable(path);
        }
        if !self.headless {
            builder = builder.with_head();
        }
        builder = builder
            .no_sandbox()
            .request_timeout(self.timeout)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage");

        let config = builder
            .build()
            .map_err(|e| AuthError::Driver(format!("ブラウザ設定エラー: {}", e)))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AuthError::Driver(e.to_string()))?;

        // ブラウザイベントハンドラをバックグラウンドで実行
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser event error: {:?}", e);
                }
            }
        });

        Ok((browser, handler))
    }

    async fn login(
        &self,
        page: &Page,
        credentials: &Credentials,
        challenge: &dyn ChallengeHandler,
    ) -> Result<(), AuthError> {
        if let Some(token) = credentials.token() {
            if self.try_token(page, token).await? {
                return Ok(());
            }
            warn!("Pre-provisioned token was rejected, falling back to form login");
        }

        page.goto(self.portal.entry_url())
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;

        if !wait_for(page, &present_js(PASSWORD_INPUT), self.timeout).await {
            let (url, _) = snapshot(page).await?;
            return Err(AuthError::ProtocolChanged(format!(
                "ログインフォームが見つかりません: {}",
                url
            )));
        }

        // ログインID・パスワード入力
        fill(page, LOGIN_INPUT, credentials.login()).await?;
        sleep(TYPE_PAUSE).await;
        fill(page, PASSWORD_INPUT, credentials.password()).await?;
        sleep(TYPE_PAUSE).await;

        page.find_element(SUBMIT_BUTTON)
            .await
            .map_err(|e| AuthError::ProtocolChanged(format!("ログインボタン: {}", e)))?
            .click()
            .await
            .map_err(|e| AuthError::Driver(format!("ログインボタンクリック: {}", e)))?;
        debug!("Login form submitted");

        let (outcome, url, html) = self.wait_outcome(page, true).await?;
        match outcome {
            LoginOutcome::Welcome => Ok(()),
            LoginOutcome::Challenge(prompt) => {
                self.answer_challenge(page, &html, prompt, challenge).await
            }
            LoginOutcome::LoginForm => Err(AuthError::InvalidCredentials),
            LoginOutcome::Unknown => Err(AuthError::ProtocolChanged(format!(
                "ログイン後の画面を判別できません: {}",
                url
            ))),
        }
    }

    async fn try_token(&self, page: &Page, token: &str) -> Result<bool, AuthError> {
        let domain = Url::parse(&self.portal.base_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .ok_or_else(|| AuthError::ProtocolChanged(format!("不正なURL: {}", self.portal.base_url)))?;

        let param = CookieParam::builder()
            .name(&self.portal.sso_cookie)
            .value(token)
            .domain(domain)
            .path("/")
            .build()
            .map_err(|e| AuthError::Driver(format!("クッキー設定エラー: {}", e)))?;
        page.set_cookie(param)
            .await
            .map_err(|e| AuthError::Driver(format!("クッキー設定エラー: {}", e)))?;

        page.goto(self.portal.welcome_url())
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;
        wait_for(page, &present_js(BALANCE_BUTTON), self.timeout).await;

        let (url, html) = snapshot(page).await?;
        Ok(portal::is_welcome(&self.portal, &url, &html))
    }

    async fn answer_challenge(
        &self,
        page: &Page,
        html: &str,
        prompt: ChallengePrompt,
        challenge: &dyn ChallengeHandler,
    ) -> Result<(), AuthError> {
        info!("Portal requested a second-factor code");
        let selector = &self.portal.challenge_selector;
        challenge_input_name(html, selector)?;

        let input = page
            .find_element(selector.as_str())
            .await
            .map_err(|e| AuthError::ProtocolChanged(format!("SMS認証コード入力欄: {}", e)))?;

        let code = await_code(challenge, &prompt, self.challenge_timeout).await?;
        input
            .click()
            .await
            .map_err(|e| AuthError::Driver(e.to_string()))?
            .type_str(&code)
            .await
            .map_err(|e| AuthError::Driver(e.to_string()))?
            .press_key("Enter")
            .await
            .map_err(|e| AuthError::Driver(e.to_string()))?;

        let (outcome, url, _) = self.wait_outcome(page, false).await?;
        match outcome {
            LoginOutcome::Welcome => Ok(()),
            LoginOutcome::Challenge(_) | LoginOutcome::LoginForm => Err(AuthError::ChallengeRejected),
            LoginOutcome::Unknown => Err(AuthError::ProtocolChanged(format!(
                "SMS認証後の画面を判別できません: {}",
                url
            ))),
        }
    }

    /// ようこそ画面の読み込み完了（ローダー非表示）、SMS認証画面、タイムアウトのいずれかまで待つ
    async fn wait_outcome(
        &self,
        page: &Page,
        stop_on_challenge: bool,
    ) -> Result<(LoginOutcome, String, String), AuthError> {
        let start = Instant::now();
        loop {
            let (url, html) = snapshot(page).await?;
            let outcome = portal::classify(&self.portal, &url, &html);

            let settled = match &outcome {
                LoginOutcome::Welcome => loaders_hidden(page).await,
                LoginOutcome::Challenge(_) => stop_on_challenge,
                _ => false,
            };
            if settled || start.elapsed() > self.timeout {
                debug!(?outcome, url = %url, elapsed = ?start.elapsed(), "Login outcome");
                return Ok((outcome, url, html));
            }

            sleep(POLL_INTERVAL).await;
        }
    }

    async fn debug_screenshot(&self, page: &Page) {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }
        if let Ok(screenshot) = page
            .screenshot(ScreenshotParams::builder().full_page(true).build())
            .await
        {
            use base64::Engine;
            let encoded = base64::engine::general_purpose::STANDARD.encode(&screenshot);
            debug!("Login screenshot: data:image/png;base64,{}", encoded);
        }
    }
}

#[async_trait]
impl SessionAdapter for BrowserAdapter {
    async fn authenticate(
        &self,
        credentials: Credentials,
        challenge: &dyn ChallengeHandler,
    ) -> Result<Box<dyn PortalSession>, AuthError> {
        let (browser, handler) = self.launch().await?;

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                discard(browser, handler).await;
                return Err(AuthError::Driver(e.to_string()));
            }
        };

        if let Err(e) = self.login(&page, &credentials, challenge).await {
            warn!("Login failed: {}", e);
            self.debug_screenshot(&page).await;
            discard(browser, handler).await;
            return Err(e);
        }

        info!("Login successful");
        Ok(Box::new(BrowserSession {
            browser: Mutex::new(browser),
            handler,
            page: Mutex::new(page),
            portal: self.portal.clone(),
            timeout: self.timeout,
        }))
    }
}

pub struct BrowserSession {
    browser: Mutex<Browser>,
    handler: JoinHandle<()>,
    /// 画面は1つなので取得は直列に行う
    page: Mutex<Page>,
    portal: PortalConfig,
    timeout: Duration,
}

impl BrowserSession {
    async fn fetch_balance(&self, page: &Page) -> Result<String, FetchError> {
        let (url, html) = snapshot(page).await.map_err(fetch_error)?;
        if !portal::is_welcome(&self.portal, &url, &html) {
            page.goto(self.portal.welcome_url())
                .await
                .map_err(|e| FetchError::Unreachable(e.to_string()))?;
            wait_for(page, &present_js(BALANCE_BUTTON), self.timeout).await;
        }
        self.ensure_authenticated(page, PageId::Balance).await?;

        page.find_element(BALANCE_BUTTON)
            .await
            .map_err(|e| FetchError::ProtocolChanged(format!("残高ボタン: {}", e)))?
            .click()
            .await
            .map_err(|e| FetchError::Unreachable(format!("残高ボタンクリック: {}", e)))?;

        let container = &self.portal.balance_container;
        let visible = format!(
            "(() => {{ const m = document.querySelector({}); return !!m && m.offsetParent !== null; }})()",
            js_string(container)
        );
        if !wait_for(page, &visible, self.timeout).await || !loaders_hidden(page).await {
            return Err(FetchError::ProtocolChanged(format!(
                "{}: {} が表示されません",
                PageId::Balance,
                container
            )));
        }

        let inner = inner_html(page, container).await?;

        if let Ok(close) = page.find_element(MODAL_CLOSE).await {
            if let Err(e) = close.click().await {
                debug!("Failed to close balance modal: {}", e);
            }
        }
        Ok(inner)
    }

    async fn fetch_services(&self, page: &Page) -> Result<String, FetchError> {
        page.goto(self.portal.services_url())
            .await
            .map_err(|e| FetchError::Unreachable(e.to_string()))?;

        let container = &self.portal.services_container;
        let found = wait_for(page, &present_js(container), self.timeout).await;
        self.ensure_authenticated(page, PageId::Services).await?;
        if !found {
            return Err(FetchError::ProtocolChanged(format!(
                "{}: {} が見つかりません",
                PageId::Services,
                container
            )));
        }
        wait_for(page, &loaders_hidden_js(), self.timeout).await;

        inner_html(page, container).await
    }

    async fn ensure_authenticated(&self, page: &Page, id: PageId) -> Result<(), FetchError> {
        let (_, html) = snapshot(page).await.map_err(fetch_error)?;
        if portal::is_login_page(&html) {
            return Err(FetchError::NotAuthenticated(id));
        }
        Ok(())
    }
}

#[async_trait]
impl PortalSession for BrowserSession {
    async fn fetch(&self, page_id: PageId) -> Result<RawPage, FetchError> {
        let page = self.page.lock().await;
        info!(page = %page_id, "Fetching page in browser");

        let html = match page_id {
            PageId::Balance => self.fetch_balance(&page).await?,
            PageId::Services => self.fetch_services(&page).await?,
        };
        Ok(RawPage::markup(page_id, html))
    }

    async fn close(self: Box<Self>) -> Result<(), ScraperError> {
        let BrowserSession {
            browser,
            handler,
            page,
            timeout,
            ..
        } = *self;
        let page = page.into_inner();
        let browser = browser.into_inner();

        match page.find_element(LOGOUT_BUTTON).await {
            Ok(button) => {
                if let Err(e) = button.click().await {
                    debug!("Logout click failed: {}", e);
                } else {
                    let logged_out = format!(
                        "document.title.indexOf({}) >= 0",
                        js_string(LOGIN_TITLE)
                    );
                    if wait_for(&page, &logged_out, timeout).await {
                        info!("Logged out");
                    } else {
                        warn!("Logout did not reach the login page");
                    }
                }
            }
            Err(e) => debug!("Logout button not found: {}", e),
        }

        shutdown(browser, handler).await
    }
}

/// ブラウザを終了してハンドラタスクを止める
async fn shutdown(mut browser: Browser, handler: JoinHandle<()>) -> Result<(), ScraperError> {
    info!("Closing browser");
    let closed = browser.close().await;
    if let Err(e) = browser.wait().await {
        debug!("Failed to wait for browser exit: {}", e);
    }
    handler.abort();
    closed
        .map(|_| ())
        .map_err(|e| ScraperError::Browser(format!("ブラウザ終了エラー: {}", e)))
}

/// 認証失敗時の後始末。終了エラーは元のエラーを優先して記録のみ
async fn discard(browser: Browser, handler: JoinHandle<()>) {
    if let Err(e) = shutdown(browser, handler).await {
        debug!("{}", e);
    }
}

/// SMS認証コード入力欄の name。無ければコードを待たずに失敗する
fn challenge_input_name(html: &str, selector: &str) -> Result<String, AuthError> {
    portal::input_name(html, selector).ok_or_else(|| {
        AuthError::ProtocolChanged("SMS認証コードの入力欄に name がありません".into())
    })
}

async fn fill(page: &Page, selector: &str, text: &str) -> Result<(), AuthError> {
    page.find_element(selector)
        .await
        .map_err(|e| AuthError::ProtocolChanged(format!("{}: {}", selector, e)))?
        .click()
        .await
        .map_err(|e| AuthError::Driver(e.to_string()))?
        .type_str(text)
        .await
        .map_err(|e| AuthError::Driver(e.to_string()))?;
    Ok(())
}

/// 現在のURLとHTML
async fn snapshot(page: &Page) -> Result<(String, String), AuthError> {
    let url = page
        .url()
        .await
        .map_err(|e| AuthError::Driver(e.to_string()))?
        .unwrap_or_default();
    let html = page
        .content()
        .await
        .map_err(|e| AuthError::Driver(e.to_string()))?;
    Ok((url, html))
}

async fn inner_html(page: &Page, selector: &str) -> Result<String, FetchError> {
    let script = format!(
        "(() => {{ const el = document.querySelector({}); return el ? el.innerHTML : null; }})()",
        js_string(selector)
    );
    let html: Option<String> = page
        .evaluate(script.as_str())
        .await
        .map_err(|e| FetchError::Unreachable(e.to_string()))?
        .into_value()
        .unwrap_or(None);
    html.ok_or_else(|| FetchError::ProtocolChanged(format!("{} が見つかりません", selector)))
}

/// JavaScriptの条件式が true になるまで待つ
async fn wait_for(page: &Page, script: &str, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        let ready: bool = page
            .evaluate(script)
            .await
            .map(|v| v.into_value().unwrap_or(false))
            .unwrap_or(false);
        if ready {
            return true;
        }
        sleep(POLL_INTERVAL).await;
    }
    false
}

async fn loaders_hidden(page: &Page) -> bool {
    page.evaluate(loaders_hidden_js().as_str())
        .await
        .map(|v| v.into_value().unwrap_or(false))
        .unwrap_or(false)
}

fn loaders_hidden_js() -> String {
    format!(
        "Array.from(document.querySelectorAll({})).every(el => el.offsetParent === null)",
        js_string(LOADER)
    )
}

fn present_js(selector: &str) -> String {
    format!("document.querySelector({}) !== null", js_string(selector))
}

fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

fn fetch_error(e: AuthError) -> FetchError {
    FetchError::Unreachable(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::StdinChallenge;
    use crate::traits::fetch_all;

    #[test]
    fn test_script_quoting() {
        assert_eq!(
            present_js("input[name='IDToken1']"),
            "document.querySelector(\"input[name='IDToken1']\") !== null"
        );
        assert!(loaders_hidden_js().contains("\".loader-content\""));
    }

    /// 入力欄が無い画面ではハンドラを呼ぶ前に失敗する
    #[test]
    fn test_challenge_input_checked_before_waiting() {
        let portal = PortalConfig::default();
        let challenge = include_str!("../tests/fixtures/challenge.html");
        assert_eq!(
            challenge_input_name(challenge, &portal.challenge_selector).unwrap(),
            "otp"
        );

        let redesigned = "<html><body><p>Wpisz kod SMS</p><div id='otp-widget'></div></body></html>";
        let err = challenge_input_name(redesigned, &portal.challenge_selector).unwrap_err();
        assert!(matches!(err, AuthError::ProtocolChanged(_)));
    }

    #[test]
    fn test_adapter_from_config() {
        let config = ScraperConfig::new("user", "pass")
            .with_headless(false)
            .with_timeout(Duration::from_secs(30));
        let adapter = BrowserAdapter::new(&config);
        assert!(!adapter.headless);
        assert_eq!(adapter.timeout, Duration::from_secs(30));
        assert_eq!(adapter.portal.base_url, "https://24.play.pl");
    }

    /// 実ポータルへのログイン（PLAY24_LOGIN / PLAY24_PASSWORD が必要）
    #[tokio::test]
    #[ignore]
    async fn test_live_login() {
        let login = std::env::var("PLAY24_LOGIN").unwrap();
        let password = std::env::var("PLAY24_PASSWORD").unwrap();
        let config = ScraperConfig::new(login, password);

        let adapter = BrowserAdapter::new(&config);
        let session = adapter
            .authenticate(config.credentials.clone(), &StdinChallenge)
            .await
            .unwrap();
        let pages = fetch_all(session.as_ref(), &[PageId::Balance]).await.unwrap();
        session.close().await.unwrap();

        assert_eq!(pages.len(), 1);
        assert!(pages[0].to_text().contains("level"));
    }
}
