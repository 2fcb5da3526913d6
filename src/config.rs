use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::credentials::Credentials;
use crate::error::ConfigError;

/// 設定ファイル名（`$XDG_CONFIG_HOME` 直下）
pub const CONFIG_FILE_NAME: &str = "24.play.pl.toml";

/// ログイン方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// HTTPリクエストでログインフォームを再現
    Http,
    /// Chromium を操作してログイン
    #[default]
    Browser,
}

/// ポータルのURLと画面上の目印
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    pub base_url: String,
    pub welcome_path: String,
    pub services_path: String,
    /// 残高モーダルのコンテナ
    pub balance_container: String,
    /// サービス一覧のコンテナ
    pub services_container: String,
    /// `Credentials::token` を入れるSSOクッキー名
    pub sso_cookie: String,
    /// SMS認証コードの入力欄
    pub challenge_selector: String,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: "https://24.play.pl".to_string(),
            welcome_path: "/Play24/Welcome".to_string(),
            services_path: "/Play24/Services".to_string(),
            balance_container: "#ballancesModalBox".to_string(),
            services_container: ".container.services".to_string(),
            sso_cookie: "iPlanetDirectoryPro".to_string(),
            challenge_selector: "input[autocomplete='one-time-code'], input[name='otp']"
                .to_string(),
        }
    }
}

impl PortalConfig {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    pub fn entry_url(&self) -> String {
        self.url("/")
    }

    pub fn welcome_url(&self) -> String {
        self.url(&self.welcome_path)
    }

    pub fn services_url(&self) -> String {
        self.url(&self.services_path)
    }
}

#[derive(Debug, Clone)]
pub struct ScraperConfig {
    pub credentials: Credentials,
    pub driver: DriverKind,
    pub headless: bool,
    /// ページ待機のタイムアウト
    pub timeout: Duration,
    /// SMS認証コード入力待ちのタイムアウト
    pub challenge_timeout: Duration,
    pub chrome_path: Option<PathBuf>,
    pub portal: PortalConfig,
    /// 取得したページの保存先（`--keep`）
    pub keep_dir: Option<PathBuf>,
    /// 出力する項目（空なら全項目）
    pub output: Vec<String>,
    /// 既定カタログの代わりに使うルールカタログ
    pub catalog_path: Option<PathBuf>,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            credentials: Credentials::new("", ""),
            driver: DriverKind::default(),
            headless: true,
            timeout: Duration::from_secs(20),
            challenge_timeout: Duration::from_secs(120),
            chrome_path: None,
            portal: PortalConfig::default(),
            keep_dir: None,
            output: Vec::new(),
            catalog_path: None,
        }
    }
}

impl ScraperConfig {
    pub fn new(login: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            credentials: Credentials::new(login, password),
            ..Default::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.credentials = self.credentials.with_token(token);
        self
    }

    pub fn with_driver(mut self, driver: DriverKind) -> Self {
        self.driver = driver;
        self
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_challenge_timeout(mut self, timeout: Duration) -> Self {
        self.challenge_timeout = timeout;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.portal.base_url = base_url.into();
        self
    }

    pub fn with_keep_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.keep_dir = Some(dir.into());
        self
    }

    pub fn with_output<S: Into<String>>(mut self, keys: impl IntoIterator<Item = S>) -> Self {
        self.output = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_catalog(mut self, path: impl Into<PathBuf>) -> Self {
        self.catalog_path = Some(path.into());
        self
    }

    /// 既定の設定ファイルパス
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join(CONFIG_FILE_NAME))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// 設定ファイルを読み込む。グループ／他ユーザーが読める場合は拒否する
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        check_permissions(path)?;
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Self::from_toml(&text, |key| std::env::var(key).ok())
    }

    /// TOML文字列から設定を作る。`env` は `PLAY24_LOGIN` / `PLAY24_PASSWORD` の参照に使う
    pub fn from_toml(
        text: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text)?;
        let defaults = ScraperConfig::default();

        let login = env("PLAY24_LOGIN")
            .or(file.auth.login)
            .ok_or(ConfigError::MissingKey("auth.login"))?;
        let password = env("PLAY24_PASSWORD")
            .or(file.auth.password)
            .ok_or(ConfigError::MissingKey("auth.password"))?;
        let mut credentials = Credentials::new(login, password);
        if let Some(token) = file.auth.token {
            credentials = credentials.with_token(token);
        }

        Ok(Self {
            credentials,
            driver: file.browser.driver.unwrap_or(defaults.driver),
            headless: file.browser.headless.unwrap_or(defaults.headless),
            timeout: file
                .browser
                .timeout
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            challenge_timeout: file
                .browser
                .challenge_timeout
                .map(Duration::from_secs)
                .unwrap_or(defaults.challenge_timeout),
            chrome_path: file.browser.chrome_path,
            portal: file.portal,
            keep_dir: None,
            output: file
                .cli
                .output
                .map(|keys| keys.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            catalog_path: file.cli.catalog,
        })
    }
}

#[cfg(unix)]
fn check_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(ConfigError::InsecurePermissions {
            path: path.to_path_buf(),
            mode,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    auth: AuthSection,
    #[serde(default)]
    browser: BrowserSection,
    #[serde(default)]
    portal: PortalConfig,
    #[serde(default)]
    cli: CliSection,
}

#[derive(Debug, Default, Deserialize)]
struct AuthSection {
    login: Option<String>,
    password: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BrowserSection {
    driver: Option<DriverKind>,
    headless: Option<bool>,
    timeout: Option<u64>,
    challenge_timeout: Option<u64>,
    chrome_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct CliSection {
    output: Option<String>,
    catalog: Option<PathBuf>,
}
