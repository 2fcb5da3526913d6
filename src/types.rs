//! ページ・抽出結果の型定義

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// ポータル上のページ識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageId {
    /// 残高モーダル
    Balance,
    /// サービス一覧
    Services,
}

impl PageId {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageId::Balance => "balance",
            PageId::Services => "services",
        }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 取得したページの中身
#[derive(Debug, Clone, PartialEq)]
pub enum PageContent {
    Markup(String),
    Json(serde_json::Value),
}

/// 取得済みページ（取得後は変更しない）
#[derive(Debug, Clone, PartialEq)]
pub struct RawPage {
    pub page: PageId,
    pub content: PageContent,
}

impl RawPage {
    pub fn markup(page: PageId, html: impl Into<String>) -> Self {
        Self {
            page,
            content: PageContent::Markup(html.into()),
        }
    }

    pub fn json(page: PageId, value: serde_json::Value) -> Self {
        Self {
            page,
            content: PageContent::Json(value),
        }
    }

    /// `--keep` で保存するときのファイル名
    pub fn file_name(&self) -> String {
        match self.content {
            PageContent::Markup(_) => format!("{}.html", self.page),
            PageContent::Json(_) => format!("{}.json", self.page),
        }
    }

    /// 保存用のテキスト表現
    pub fn to_text(&self) -> String {
        match &self.content {
            PageContent::Markup(html) => html.clone(),
            PageContent::Json(value) => value.to_string(),
        }
    }
}

/// 正規化済みの値
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Decimal(f64),
    Integer(i64),
    Flag(bool),
    Date(NaiveDate),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Decimal(v) => write!(f, "{v}"),
            FieldValue::Integer(v) => write!(f, "{v}"),
            FieldValue::Flag(v) => write!(f, "{v}"),
            FieldValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

/// 1ページから抽出した1項目
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedField {
    pub name: String,
    pub value: FieldValue,
    pub page: PageId,
}
