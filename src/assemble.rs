//! 複数ページの抽出結果を1つのマッピングにまとめる

use std::collections::HashMap;

use serde::ser::{Serialize, SerializeMap, Serializer};
use tracing::debug;

use crate::error::ScraperError;
use crate::types::{ExtractedField, FieldValue, PageId};

/// 同名項目が複数ページにある場合の採用ルール。
/// 「前後」は呼び出し側が渡したページ順で決まる
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// 後のページを採用
    #[default]
    LastPageWins,
    /// 先のページを採用
    FirstPageWins,
    /// 指定ページを優先し、それ以外は後のページを採用
    Prefer(PageId),
}

#[derive(Debug, Clone, PartialEq)]
struct Entry {
    value: FieldValue,
    page: Option<PageId>,
}

/// 項目名 → 値のマッピング（挿入順を保持）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultMapping {
    order: Vec<String>,
    entries: HashMap<String, Entry>,
}

impl ResultMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.entries.get(name).map(|e| &e.value)
    }

    /// 値の取得元ページ。補完された項目は None
    pub fn source(&self, name: &str) -> Option<PageId> {
        self.entries.get(name).and_then(|e| e.page)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.order
            .iter()
            .filter_map(|name| self.entries.get(name).map(|e| (name.as_str(), &e.value)))
    }

    fn insert(&mut self, name: &str, value: FieldValue, page: Option<PageId>) {
        if !self.entries.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.entries.insert(name.to_string(), Entry { value, page });
    }

    /// 指定された真偽値項目が無ければ false で補完する
    pub fn fill_defaults<S: AsRef<str>>(&mut self, fields: &[S]) {
        for field in fields {
            let field = field.as_ref();
            if !self.contains(field) {
                debug!(field, "Filling absent field with false");
                self.insert(field, FieldValue::Flag(false), None);
            }
        }
    }

    /// 指定キーのみを指定順で残す
    pub fn select<S: AsRef<str>>(&self, keys: &[S]) -> Result<ResultMapping, ScraperError> {
        let mut selected = ResultMapping::new();
        for key in keys {
            let key = key.as_ref();
            let entry = self
                .entries
                .get(key)
                .ok_or_else(|| ScraperError::UnknownField(key.to_string()))?;
            selected.insert(key, entry.value.clone(), entry.page);
        }
        Ok(selected)
    }

    /// `key: value` 形式の行
    pub fn to_lines(&self) -> Vec<String> {
        self.iter()
            .map(|(name, value)| format!("{name}: {value}"))
            .collect()
    }
}

impl Serialize for ResultMapping {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// ページ順に抽出結果をまとめる
pub fn assemble(
    pages: &[(PageId, Vec<ExtractedField>)],
    policy: &ConflictPolicy,
) -> ResultMapping {
    let mut mapping = ResultMapping::new();

    for (page, fields) in pages {
        for field in fields {
            let replace = match mapping.source(&field.name) {
                None => true,
                Some(existing) => match policy {
                    ConflictPolicy::LastPageWins => true,
                    ConflictPolicy::FirstPageWins => false,
                    ConflictPolicy::Prefer(preferred) => {
                        existing != *preferred || *page == *preferred
                    }
                },
            };

            if replace {
                if let Some(previous) = mapping.get(&field.name) {
                    if *previous != field.value {
                        debug!(
                            field = %field.name,
                            page = %page,
                            "Conflicting value replaced"
                        );
                    }
                }
                mapping.insert(&field.name, field.value.clone(), Some(*page));
            }
        }
    }

    mapping
}
