use crate::document::Document;
use serde::{Deserialize, Serialize};

/// スタックが宣言するリソース
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    /// リソース名 (スタックチェーン内で一意)
    pub name: String,
    /// レジストリのリソース名前空間のタイプキー
    pub type_key: String,
    /// 宣言したスタック
    pub owner: String,
    /// プロバイダー固有の設定
    pub config: Document,
}

impl ResourceDefinition {
    pub fn new(
        name: impl Into<String>,
        type_key: impl Into<String>,
        owner: impl Into<String>,
        config: Document,
    ) -> Self {
        Self {
            name: name.into(),
            type_key: type_key.into(),
            owner: owner.into(),
            config,
        }
    }
}

/// インフラ記述子で宣言される名前付きテンプレート
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateDefinition {
    pub name: String,
    /// レジストリのテンプレート名前空間のタイプキー
    pub type_key: String,
    /// テンプレートを使うスタックの最下層の設定
    pub config: Document,
}
