use super::{ResourceDefinition, TemplateDefinition};
use crate::document::{Document, Mapping};
use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// スタックの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackKind {
    /// `provisioner` / `resources` / `templates` を持つ共有インフラ
    Infrastructure,
    /// `type` / `parent` / `config` / `uses` を持つアプリケーション
    Application,
}

impl std::fmt::Display for StackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StackKind::Infrastructure => write!(f, "infrastructure"),
            StackKind::Application => write!(f, "application"),
        }
    }
}

/// YAML 記述子1つ分のスタック定義（マージ前・置換前）
#[derive(Debug, Clone, PartialEq)]
pub struct StackDescriptor {
    pub name: String,
    pub kind: StackKind,
    /// `type` フィールド（テンプレートのタイプキー、またはテンプレート名）
    pub stack_type: String,
    pub parent: Option<String>,
    pub config: Document,
    /// 利用するリソース名
    pub uses: Vec<String>,
    /// このスタックが所有するリソース
    pub resources: Vec<ResourceDefinition>,
    /// 名前付きテンプレート
    pub templates: Vec<TemplateDefinition>,
    /// 認証プロバイダーごとの設定
    pub auth: Mapping,
    /// 環境ごとの設定オーバーライド
    pub environments: BTreeMap<String, Document>,
    pub provisioner: Option<Document>,
    /// 読み込み元ファイル
    pub source: PathBuf,
}

impl StackDescriptor {
    pub fn new(
        name: impl Into<String>,
        kind: StackKind,
        stack_type: impl Into<String>,
        source: PathBuf,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            stack_type: stack_type.into(),
            parent: None,
            config: Document::map(),
            uses: Vec::new(),
            resources: Vec::new(),
            templates: Vec::new(),
            auth: Mapping::new(),
            environments: BTreeMap::new(),
            provisioner: None,
            source,
        }
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceDefinition> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn template(&self, name: &str) -> Option<&TemplateDefinition> {
        self.templates.iter().find(|t| t.name == name)
    }
}

/// 1回のロードで得られたスタック一覧
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StacksMap {
    stacks: BTreeMap<String, StackDescriptor>,
}

impl StacksMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// スタックを追加。同名のスタックがある場合はエラー
    pub fn insert(&mut self, stack: StackDescriptor) -> Result<()> {
        if let Some(existing) = self.stacks.get(&stack.name) {
            return Err(ConfigError::DuplicateStack {
                name: stack.name.clone(),
                first: existing.source.clone(),
                second: stack.source.clone(),
            });
        }
        self.stacks.insert(stack.name.clone(), stack);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&StackDescriptor> {
        self.stacks.get(name)
    }

    /// スタックを取得。見つからない場合はエラー
    pub fn require(&self, name: &str) -> Result<&StackDescriptor> {
        self.get(name)
            .ok_or_else(|| ConfigError::StackNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stacks.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stacks.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StackDescriptor> {
        self.stacks.values()
    }

    /// 直接の子スタック名（名前順）
    pub fn children_of(&self, parent: &str) -> Vec<&str> {
        self.stacks
            .values()
            .filter(|s| s.parent.as_deref() == Some(parent))
            .map(|s| s.name.as_str())
            .collect()
    }
}
