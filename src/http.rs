//! HTTP方式のセッション
//!
//! ポータルのログインフォームをそのまま送信し、クッキーでセッションを保持する。
//! JavaScriptは実行しないため、画面がクライアント側で描画される部分は取得できない。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::cookie::Jar;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode, Url};
use tracing::{debug, info, warn};

use crate::challenge::{await_code, ChallengeHandler, ChallengePrompt};
use crate::config::{PortalConfig, ScraperConfig};
use crate::credentials::Credentials;
use crate::error::{AuthError, FetchError, ScraperError};
use crate::portal::{self, LoginOutcome, LOGOUT_BUTTON, PASSWORD_INPUT};
use crate::traits::{PortalSession, SessionAdapter};
use crate::types::{PageId, RawPage};

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";
const LOGIN_FIELD: &str = "IDToken1";
const PASSWORD_FIELD: &str = "IDToken2";

/// 取得した画面（リダイレクト後のURLと本文）
struct Fetched {
    url: String,
    status: StatusCode,
    is_json: bool,
    body: String,
}

pub struct HttpAdapter {
    portal: PortalConfig,
    timeout: Duration,
    challenge_timeout: Duration,
}

impl HttpAdapter {
    pub fn new(config: &ScraperConfig) -> Self {
        Self {
            portal: config.portal.clone(),
            timeout: config.timeout,
            challenge_timeout: config.challenge_timeout,
        }
    }

    fn build_client(&self, jar: Arc<Jar>) -> Result<Client, AuthError> {
        Client::builder()
            .cookie_provider(jar)
            .user_agent(USER_AGENT)
            .timeout(self.timeout)
            .build()
            .map_err(|e| AuthError::Driver(format!("HTTPクライアント作成エラー: {}", e)))
    }

    /// 事前取得済みのSSOクッキーを設定してようこそ画面を確認
    async fn try_token(&self, client: &Client, jar: &Jar, token: &str) -> Result<bool, AuthError> {
        let base = Url::parse(&self.portal.entry_url())
            .map_err(|e| AuthError::ProtocolChanged(format!("不正なURL: {}", e)))?;
        jar.add_cookie_str(&format!("{}={}; Path=/", self.portal.sso_cookie, token), &base);

        let page = get(client, &self.portal.welcome_url()).await.map_err(unreachable)?;
        Ok(portal::is_welcome(&self.portal, &page.url, &page.body))
    }

    async fn form_login(
        &self,
        client: &Client,
        credentials: &Credentials,
        challenge: &dyn ChallengeHandler,
    ) -> Result<(), AuthError> {
        let page = get(client, &self.portal.entry_url()).await.map_err(unreachable)?;
        if portal::is_welcome(&self.portal, &page.url, &page.body) {
            info!("Already logged in");
            return Ok(());
        }

        let mut form = portal::find_form(&page.body, &page.url, PASSWORD_INPUT).ok_or_else(|| {
            AuthError::ProtocolChanged(format!("ログインフォームが見つかりません: {}", page.url))
        })?;
        form.set(LOGIN_FIELD, credentials.login());
        form.set(PASSWORD_FIELD, credentials.password());

        debug!(action = %form.action, "Submitting login form");
        let page = post(client, &form).await.map_err(unreachable)?;

        match portal::classify(&self.portal, &page.url, &page.body) {
            LoginOutcome::Welcome => Ok(()),
            LoginOutcome::Challenge(prompt) => self.answer_challenge(client, page, prompt, challenge).await,
            LoginOutcome::LoginForm => Err(AuthError::InvalidCredentials),
            LoginOutcome::Unknown => Err(AuthError::ProtocolChanged(format!(
                "ログイン後の画面を判別できません: {}",
                page.url
            ))),
        }
    }

    async fn answer_challenge(
        &self,
        client: &Client,
        page: Fetched,
        prompt: ChallengePrompt,
        challenge: &dyn ChallengeHandler,
    ) -> Result<(), AuthError> {
        info!("Portal requested a second-factor code");
        let selector = &self.portal.challenge_selector;
        let name = portal::input_name(&page.body, selector).ok_or_else(|| {
            AuthError::ProtocolChanged("SMS認証コードの入力欄に name がありません".into())
        })?;
        let mut form = portal::find_form(&page.body, &page.url, selector).ok_or_else(|| {
            AuthError::ProtocolChanged("SMS認証フォームが見つかりません".into())
        })?;

        let code = await_code(challenge, &prompt, self.challenge_timeout).await?;
        form.set(&name, &code);

        let page = post(client, &form).await.map_err(unreachable)?;
        match portal::classify(&self.portal, &page.url, &page.body) {
            LoginOutcome::Welcome => Ok(()),
            LoginOutcome::Challenge(_) | LoginOutcome::LoginForm => Err(AuthError::ChallengeRejected),
            LoginOutcome::Unknown => Err(AuthError::ProtocolChanged(format!(
                "SMS認証後の画面を判別できません: {}",
                page.url
            ))),
        }
    }
}

#[async_trait]
impl SessionAdapter for HttpAdapter {
    async fn authenticate(
        &self,
        credentials: Credentials,
        challenge: &dyn ChallengeHandler,
    ) -> Result<Box<dyn PortalSession>, AuthError> {
        info!(base_url = %self.portal.base_url, "Logging in over HTTP");

        let jar = Arc::new(Jar::default());
        let client = self.build_client(jar.clone())?;

        let token_accepted = match credentials.token() {
            Some(token) => {
                let accepted = self.try_token(&client, &jar, token).await?;
                if !accepted {
                    warn!("Pre-provisioned token was rejected, falling back to form login");
                }
                accepted
            }
            None => false,
        };

        if !token_accepted {
            self.form_login(&client, &credentials, challenge).await?;
        }

        info!("Login successful");
        Ok(Box::new(HttpSession {
            client,
            portal: self.portal.clone(),
        }))
    }
}

pub struct HttpSession {
    client: Client,
    portal: PortalConfig,
}

#[async_trait]
impl PortalSession for HttpSession {
    async fn fetch(&self, page: PageId) -> Result<RawPage, FetchError> {
        let (url, container) = match page {
            PageId::Balance => (self.portal.welcome_url(), &self.portal.balance_container),
            PageId::Services => (self.portal.services_url(), &self.portal.services_container),
        };

        let fetched = get(&self.client, &url)
            .await
            .map_err(|e| FetchError::Unreachable(format!("{}: {}", page, e)))?;
        debug!(page = %page, url = %fetched.url, status = %fetched.status, "Fetched page");

        if matches!(fetched.status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(FetchError::NotAuthenticated(page));
        }
        if !fetched.status.is_success() {
            return Err(FetchError::Unreachable(format!("{}: HTTP {}", page, fetched.status)));
        }

        if fetched.is_json {
            let value = serde_json::from_str(&fetched.body)
                .map_err(|e| FetchError::ProtocolChanged(format!("{}: JSON解析エラー: {}", page, e)))?;
            return Ok(RawPage::json(page, value));
        }

        if portal::is_login_page(&fetched.body) {
            return Err(FetchError::NotAuthenticated(page));
        }

        let html = portal::container_html(&fetched.body, container).ok_or_else(|| {
            FetchError::ProtocolChanged(format!("{}: {} が見つかりません", page, container))
        })?;
        Ok(RawPage::markup(page, html))
    }

    fn concurrent_fetch(&self) -> bool {
        true
    }

    async fn close(self: Box<Self>) -> Result<(), ScraperError> {
        let welcome = match get(&self.client, &self.portal.welcome_url()).await {
            Ok(page) => page,
            Err(e) => {
                debug!("Skipping logout: {}", e);
                return Ok(());
            }
        };

        match logout_url(&welcome.url, &welcome.body) {
            Some(url) => {
                if let Err(e) = get(&self.client, &url).await {
                    debug!("Logout request failed: {}", e);
                } else {
                    info!("Logged out");
                }
            }
            None => debug!("Logout link not found"),
        }
        Ok(())
    }
}

fn logout_url(page_url: &str, html: &str) -> Option<String> {
    let doc = scraper::Html::parse_document(html);
    let sel = scraper::Selector::parse(LOGOUT_BUTTON).ok()?;
    let href = doc.select(&sel).next()?.value().attr("href")?.to_string();
    Url::parse(page_url).ok()?.join(&href).ok().map(|u| u.to_string())
}

fn unreachable(e: reqwest::Error) -> AuthError {
    AuthError::Unreachable(e.to_string())
}

async fn read(response: reqwest::Response) -> Result<Fetched, reqwest::Error> {
    let url = response.url().to_string();
    let status = response.status();
    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/json"));
    let body = response.text().await?;
    Ok(Fetched {
        url,
        status,
        is_json,
        body,
    })
}

async fn get(client: &Client, url: &str) -> Result<Fetched, reqwest::Error> {
    read(client.get(url).send().await?).await
}

async fn post(client: &Client, form: &portal::FormSubmission) -> Result<Fetched, reqwest::Error> {
    let response = client.post(&form.action).form(&form.fields).send().await?;
    read(response).await
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::challenge::NoChallenge;

    const LOGIN: &str = include_str!("../tests/fixtures/login.html");
    const WELCOME: &str = include_str!("../tests/fixtures/welcome.html");
    const CHALLENGE: &str = include_str!("../tests/fixtures/challenge.html");
    const SERVICES: &str = include_str!("../tests/fixtures/services.html");

    struct FixedCode(&'static str);

    #[async_trait]
    impl ChallengeHandler for FixedCode {
        async fn provide_code(&self, _prompt: &ChallengePrompt) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    fn html(body: &str) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("content-type", "text/html; charset=utf-8")
            .set_body_string(body)
    }

    fn redirect(server: &MockServer, to: &str) -> ResponseTemplate {
        ResponseTemplate::new(302).insert_header("location", format!("{}{}", server.uri(), to))
    }

    /// ログイン画面とログインフォーム送信先を用意したモックポータル
    async fn portal(welcome: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(html(LOGIN))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/Play24/Welcome"))
            .respond_with(html(welcome))
            .mount(&server)
            .await;
        server
    }

    async fn accept_password(server: &MockServer, password: &str) {
        Mock::given(method("POST"))
            .and(path("/sso/UI/Login"))
            .and(body_string_contains(format!("IDToken2={}", password)))
            .respond_with(redirect(server, "/Play24/Welcome"))
            .mount(server)
            .await;
    }

    fn adapter(server: &MockServer) -> HttpAdapter {
        let config = ScraperConfig::new("500100200", "secret")
            .with_base_url(server.uri())
            .with_challenge_timeout(Duration::from_secs(2));
        HttpAdapter::new(&config)
    }

    fn credentials() -> Credentials {
        Credentials::new("500100200", "secret")
    }

    #[tokio::test]
    async fn test_login_and_fetch() {
        let server = portal(WELCOME).await;
        accept_password(&server, "secret").await;
        Mock::given(method("GET"))
            .and(path("/Play24/Services"))
            .respond_with(html(SERVICES))
            .mount(&server)
            .await;

        let session = adapter(&server)
            .authenticate(credentials(), &NoChallenge)
            .await
            .unwrap();
        assert!(session.concurrent_fetch());

        let balance = session.fetch(PageId::Balance).await.unwrap();
        assert_eq!(balance.page, PageId::Balance);
        assert!(balance.to_text().contains("border-apla"));
        assert!(!balance.to_text().contains("accountBallances"));

        let services = session.fetch(PageId::Services).await.unwrap();
        assert!(services.to_text().contains("image-tile"));

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_login_form_is_url_encoded() {
        let server = portal(WELCOME).await;
        Mock::given(method("POST"))
            .and(path("/sso/UI/Login"))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(body_string_contains("IDToken2=p%40ss+w%26rd"))
            .and(body_string_contains("goto=aHR0cHM6Ly8yNC5wbGF5LnBs"))
            .respond_with(redirect(&server, "/Play24/Welcome"))
            .expect(1)
            .mount(&server)
            .await;

        let creds = Credentials::new("500100200", "p@ss w&rd");
        assert!(adapter(&server).authenticate(creds, &NoChallenge).await.is_ok());
    }

    #[tokio::test]
    async fn test_wrong_password_is_invalid_credentials() {
        let server = portal(WELCOME).await;
        accept_password(&server, "correct").await;
        Mock::given(method("POST"))
            .and(path("/sso/UI/Login"))
            .and(body_string_contains("IDToken2=secret"))
            .respond_with(html(LOGIN))
            .mount(&server)
            .await;

        let err = adapter(&server)
            .authenticate(credentials(), &NoChallenge)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_changed_welcome_page_is_protocol_changed() {
        let redesigned = "<html><head><title>Play24</title></head><body><main id='app'></main></body></html>";
        let server = portal(redesigned).await;
        accept_password(&server, "secret").await;

        let err = adapter(&server)
            .authenticate(credentials(), &NoChallenge)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AuthError::ProtocolChanged(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_missing_login_form_is_protocol_changed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(html("<html><body><div id='spa-root'></div></body></html>"))
            .mount(&server)
            .await;

        let err = adapter(&server)
            .authenticate(credentials(), &NoChallenge)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AuthError::ProtocolChanged(_)));
    }

    #[tokio::test]
    async fn test_challenge_code_completes_login() {
        let server = portal(WELCOME).await;
        Mock::given(method("POST"))
            .and(path("/sso/UI/Login"))
            .and(body_string_contains("IDToken2=secret"))
            .respond_with(html(CHALLENGE))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sso/UI/Login"))
            .and(query_param("step", "otp"))
            .and(body_string_contains("otp=123456"))
            .respond_with(redirect(&server, "/Play24/Welcome"))
            .mount(&server)
            .await;

        let session = adapter(&server)
            .authenticate(credentials(), &FixedCode("123456"))
            .await;
        assert!(session.is_ok());
    }

    #[tokio::test]
    async fn test_rejected_challenge_code() {
        let server = portal(WELCOME).await;
        Mock::given(method("POST"))
            .and(path("/sso/UI/Login"))
            .respond_with(html(CHALLENGE))
            .mount(&server)
            .await;

        let err = adapter(&server)
            .authenticate(credentials(), &FixedCode("000000"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AuthError::ChallengeRejected));
    }

    #[tokio::test]
    async fn test_unanswered_challenge_times_out() {
        let server = portal(WELCOME).await;
        Mock::given(method("POST"))
            .and(path("/sso/UI/Login"))
            .respond_with(html(CHALLENGE))
            .mount(&server)
            .await;

        let err = adapter(&server)
            .authenticate(credentials(), &NoChallenge)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AuthError::ChallengeTimeout(_)));
    }

    #[tokio::test]
    async fn test_token_skips_form_login() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/Play24/Welcome"))
            .and(header("cookie", "iPlanetDirectoryPro=AQIC5wM2"))
            .respond_with(html(WELCOME))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sso/UI/Login"))
            .respond_with(html(LOGIN))
            .expect(0)
            .mount(&server)
            .await;

        let creds = credentials().with_token("AQIC5wM2");
        assert!(adapter(&server).authenticate(creds, &NoChallenge).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_session_is_not_authenticated() {
        let server = portal(WELCOME).await;
        accept_password(&server, "secret").await;
        Mock::given(method("GET"))
            .and(path("/Play24/Services"))
            .respond_with(html(LOGIN))
            .mount(&server)
            .await;

        let session = adapter(&server)
            .authenticate(credentials(), &NoChallenge)
            .await
            .unwrap();
        let err = session.fetch(PageId::Services).await.unwrap_err();
        assert!(matches!(err, FetchError::NotAuthenticated(PageId::Services)));
    }

    #[tokio::test]
    async fn test_unreachable_portal() {
        let config = ScraperConfig::new("a", "b")
            .with_base_url("http://127.0.0.1:1")
            .with_timeout(Duration::from_secs(2));
        let err = HttpAdapter::new(&config)
            .authenticate(credentials(), &NoChallenge)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AuthError::Unreachable(_)));
    }
}
