//! 項目抽出ルールのカタログ
//!
//! ポータルの画面はリリースと無関係に変わるため、ラベル・セレクタ・単位は
//! コードではなく TOML のカタログとして管理する。既定のカタログは
//! `catalog/play24.toml` をバイナリに埋め込んだもの。

use std::collections::BTreeMap;
use std::path::Path;

use scraper::Selector;
use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, ScraperError};
use crate::types::PageId;

/// 対応しているカタログのスキーマバージョン
pub const CATALOG_VERSION: u32 = 1;

const BUILTIN_CATALOG: &str = include_str!("../catalog/play24.toml");

/// 項目の位置指定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Locator {
    /// テーブル定義の行をラベルで検索。`recurring` を指定した場合は行のフラグも一致が必要
    Label {
        label: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recurring: Option<bool>,
    },
    /// CSSセレクタに最初に一致した要素
    Selector { selector: String },
    /// JSONページ内の JSON Pointer (RFC 6901)
    Pointer { pointer: String },
}

/// 値の型と正規化方法
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ValueKind {
    Text,
    /// 単位付き小数。値を単位ごとの除数で割って正規単位に揃える（MB = 1000 で GB）
    Decimal {
        #[serde(default)]
        units: BTreeMap<String, f64>,
    },
    Integer {
        #[serde(default)]
        unit: Option<String>,
    },
    /// 要素が存在すれば true。存在しなければ項目自体を出力しない
    Boolean,
    Date {
        #[serde(default = "default_date_format")]
        format: String,
    },
}

fn default_date_format() -> String {
    "%d.%m.%Y".to_string()
}

/// 1項目分の抽出ルール
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    pub field: String,
    pub locator: Locator,
    pub value: ValueKind,
}

impl FieldRule {
    pub fn new(field: impl Into<String>, locator: Locator, value: ValueKind) -> Self {
        Self {
            field: field.into(),
            locator,
            value,
        }
    }

    /// ラベル指定のルールを作成
    pub fn label(field: impl Into<String>, label: impl Into<String>, value: ValueKind) -> Self {
        Self::new(
            field,
            Locator::Label {
                label: label.into(),
                recurring: None,
            },
            value,
        )
    }
}

/// 行フラグ（「miesięcznie」= 毎月自動更新など）の判定方法
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagLayout {
    pub selector: String,
    pub contains: String,
}

/// ラベル／値が並ぶ「表」のCSSセレクタ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableLayout {
    pub rows: String,
    pub label: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag: Option<FlagLayout>,
}

/// 1ページ分のルール
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRules {
    pub page: PageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<TableLayout>,
    #[serde(default)]
    pub rules: Vec<FieldRule>,
}

impl PageRules {
    pub fn new(page: PageId) -> Self {
        Self {
            page,
            layout: None,
            rules: Vec::new(),
        }
    }

    pub fn with_layout(mut self, layout: TableLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn with_rule(mut self, rule: FieldRule) -> Self {
        self.rules.push(rule);
        self
    }
}

/// 抽出ルールカタログ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCatalog {
    pub version: u32,
    #[serde(default)]
    pub pages: Vec<PageRules>,
    /// 存在しない場合に false で補完する真偽値項目
    #[serde(default)]
    pub default_false: Vec<String>,
}

impl RuleCatalog {
    /// 埋め込みの既定カタログ
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_toml(BUILTIN_CATALOG)
    }

    pub fn from_toml(text: &str) -> Result<Self, CatalogError> {
        let catalog: RuleCatalog = toml::from_str(text)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn from_path(path: &Path) -> Result<Self, ScraperError> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_toml(&text)?)
    }

    /// バージョンとセレクタの妥当性を確認
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.version != CATALOG_VERSION {
            return Err(CatalogError::UnsupportedVersion(self.version));
        }

        for page in &self.pages {
            if let Some(layout) = &page.layout {
                let owner = format!("{} layout", page.page);
                check_selector(&owner, &layout.rows)?;
                check_selector(&owner, &layout.label)?;
                check_selector(&owner, &layout.value)?;
                if let Some(flag) = &layout.flag {
                    check_selector(&owner, &flag.selector)?;
                }
            }

            for rule in &page.rules {
                match &rule.locator {
                    Locator::Label { .. } if page.layout.is_none() => {
                        return Err(CatalogError::MissingLayout {
                            field: rule.field.clone(),
                        });
                    }
                    Locator::Selector { selector } => check_selector(&rule.field, selector)?,
                    _ => {}
                }
            }
        }
        Ok(())
    }

    pub fn page(&self, page: PageId) -> Option<&PageRules> {
        self.pages.iter().find(|p| p.page == page)
    }

    /// カタログ上の全項目名（ページ順・ルール順）
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.pages
            .iter()
            .flat_map(|p| p.rules.iter().map(|r| r.field.as_str()))
    }
}

fn check_selector(field: &str, selector: &str) -> Result<(), CatalogError> {
    Selector::parse(selector)
        .map(|_| ())
        .map_err(|_| CatalogError::InvalidSelector {
            field: field.to_string(),
            selector: selector.to_string(),
        })
}
