use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::PageId;

/// 認証エラー（実行を中断する）
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("ログインエラー: ログインIDまたはパスワードが正しくありません")]
    InvalidCredentials,

    #[error("ポータルに接続できません: {0}")]
    Unreachable(String),

    #[error("ポータルのログイン画面が想定と異なります（ルールカタログの更新が必要です）: {0}")]
    ProtocolChanged(String),

    #[error("SMS認証コードが{}秒以内に入力されませんでした", .0.as_secs())]
    ChallengeTimeout(Duration),

    #[error("SMS認証コードが拒否されました")]
    ChallengeRejected,

    #[error("ブラウザ初期化エラー: {0}")]
    Driver(String),
}

/// ページ取得エラー（実行を中断する）
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("セッションが無効です（ログイン画面に戻されました）: {0}")]
    NotAuthenticated(PageId),

    #[error("ページを取得できません: {0}")]
    Unreachable(String),

    #[error("ページ構成が想定と異なります（ルールカタログの更新が必要です）: {0}")]
    ProtocolChanged(String),
}

/// 項目単位のエラー（警告として記録し、他の項目の抽出は続行する）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FieldError {
    #[error("{field}: 日付を解析できません: {text:?}")]
    UnparsableDate { field: String, text: String },

    #[error("{field}: 数値を解析できません: {text:?}")]
    UnparsableNumber { field: String, text: String },

    #[error("{field}: 未知の単位です: {unit:?}")]
    UnknownUnit { field: String, unit: String },

    #[error("{field}: ロケーターが不正です: {reason}")]
    InvalidLocator { field: String, reason: String },
}

/// 設定ファイルのエラー
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("設定ファイルを読み込めません ({path}): {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("設定ファイルの形式が不正です: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("設定ファイル {path} のパーミッションが緩すぎます ({mode:o})。chmod 600 を実行してください")]
    InsecurePermissions { path: PathBuf, mode: u32 },

    #[error("設定項目がありません: {0}")]
    MissingKey(&'static str),

    #[error("設定ディレクトリを特定できません")]
    NoConfigDir,
}

/// ルールカタログのエラー
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("ルールカタログの形式が不正です: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("未対応のルールカタログのバージョンです: {0}")]
    UnsupportedVersion(u32),

    #[error("{field}: CSSセレクタが不正です: {selector:?}")]
    InvalidSelector { field: String, selector: String },

    #[error("{field}: ラベル指定にはページのテーブル定義が必要です")]
    MissingLayout { field: String },
}

#[derive(Error, Debug)]
pub enum ScraperError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("ブラウザ操作エラー: {0}")]
    Browser(String),

    #[error("未知の項目名です: {0}")]
    UnknownField(String),

    #[error("ファイル操作エラー: {0}")]
    FileIO(#[from] std::io::Error),
}
