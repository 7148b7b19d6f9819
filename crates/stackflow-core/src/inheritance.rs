//! 継承リゾルバー
//!
//! `parent` を辿ってスタックのチェーンを構築し、ルートからリーフへ順に
//! `config` をディープマージします。
//!
//! マージ規則:
//! - マップは再帰的にマージし、子のキーが親を上書き
//! - シーケンスは子の値で丸ごと置き換え（要素単位のマージはしない）
//! - 子の `null` は親の値を null で上書き（キーは削除しない）
//!
//! 解決は純粋関数で、入力の [`StacksMap`] を変更しません。

use crate::document::{Document, Mapping};
use crate::error::{ConfigError, Result};
use crate::model::{ResourceDefinition, StackDescriptor, StackKind, StacksMap};
use tracing::{debug, instrument};

/// 継承解決済みのスタック
#[derive(Debug, Clone, PartialEq)]
pub struct MergedDescriptor {
    pub name: String,
    pub kind: StackKind,
    /// テンプレート名前空間のタイプキー（エイリアス解決後）
    pub type_key: String,
    /// `type` がテンプレートエイリアスだった場合のエイリアス名
    pub template: Option<String>,
    /// 環境オーバーライドを適用した環境名
    pub environment: Option<String>,
    /// ルートからリーフへのスタック名
    pub chain: Vec<String>,
    pub config: Document,
    pub auth: Mapping,
    /// リーフ自身が宣言するリソース
    pub resources: Vec<ResourceDefinition>,
    /// 利用するリソース（チェーン全体、名前で重複排除）
    pub uses: Vec<ResourceDefinition>,
}

impl MergedDescriptor {
    /// 直接の親スタック名
    pub fn parent(&self) -> Option<&str> {
        let len = self.chain.len();
        (len >= 2).then(|| self.chain[len - 2].as_str())
    }

    /// `${resource:..}` で参照可能なリソース（自身の宣言 + uses）
    pub fn referenceable(&self, name: &str) -> Option<&ResourceDefinition> {
        self.resources
            .iter()
            .chain(self.uses.iter())
            .find(|r| r.name == name)
    }
}

/// スタックを継承解決（環境オーバーライドなし）
#[instrument(skip(stacks))]
pub fn resolve(name: &str, stacks: &StacksMap) -> Result<MergedDescriptor> {
    resolve_inner(name, None, stacks)
}

/// スタックを継承解決し、指定環境のオーバーライドを重ねる
///
/// 全階層のベース設定をマージした後、各階層の `environments.<env>` を
/// ルートからリーフへ順に重ねます。
#[instrument(skip(stacks))]
pub fn resolve_for_environment(
    name: &str,
    environment: &str,
    stacks: &StacksMap,
) -> Result<MergedDescriptor> {
    resolve_inner(name, Some(environment), stacks)
}

fn resolve_inner(
    name: &str,
    environment: Option<&str>,
    stacks: &StacksMap,
) -> Result<MergedDescriptor> {
    let chain = build_chain(name, stacks)?;
    let leaf = chain[chain.len() - 1];

    // テンプレートエイリアス: リーフに近いものを優先
    let alias = chain
        .iter()
        .rev()
        .find_map(|stack| stack.template(&leaf.stack_type));

    let mut config = match alias {
        Some(template) => template.config.clone(),
        None => Document::map(),
    };
    for stack in &chain {
        deep_merge(&mut config, &stack.config);
    }
    if let Some(env) = environment {
        for stack in &chain {
            if let Some(overlay) = stack.environments.get(env) {
                debug!(stack = %stack.name, environment = env, "Applying environment override");
                deep_merge(&mut config, overlay);
            }
        }
    }

    let mut auth = Document::Map(Mapping::new());
    for stack in &chain {
        deep_merge(&mut auth, &Document::Map(stack.auth.clone()));
    }
    let auth = match auth {
        Document::Map(m) => m,
        _ => Mapping::new(),
    };

    let uses = resolve_uses(&chain)?;

    let merged = MergedDescriptor {
        name: leaf.name.clone(),
        kind: leaf.kind,
        type_key: alias
            .map(|t| t.type_key.clone())
            .unwrap_or_else(|| leaf.stack_type.clone()),
        template: alias.map(|t| t.name.clone()),
        environment: environment.map(str::to_string),
        chain: chain.iter().map(|s| s.name.clone()).collect(),
        config,
        auth,
        resources: leaf.resources.clone(),
        uses,
    };
    debug!(
        stack = %merged.name,
        depth = merged.chain.len(),
        uses = merged.uses.len(),
        "Resolved inheritance chain"
    );
    Ok(merged)
}

/// ルートからリーフへのチェーンを構築
fn build_chain<'a>(name: &str, stacks: &'a StacksMap) -> Result<Vec<&'a StackDescriptor>> {
    let mut chain: Vec<&StackDescriptor> = vec![stacks.require(name)?];

    while let Some(parent) = chain[chain.len() - 1].parent.as_deref() {
        if let Some(pos) = chain.iter().position(|s| s.name == parent) {
            let mut cycle: Vec<String> = chain[pos..].iter().map(|s| s.name.clone()).collect();
            cycle.push(parent.to_string());
            return Err(ConfigError::CyclicInheritance(cycle));
        }

        let child = chain[chain.len() - 1];
        let next = stacks
            .get(parent)
            .ok_or_else(|| ConfigError::ParentNotFound {
                stack: child.name.clone(),
                parent: parent.to_string(),
                file: child.source.clone(),
            })?;
        chain.push(next);
    }

    chain.reverse();
    Ok(chain)
}

/// `uses` をチェーン全体で連結し、宣言済みリソースに解決
///
/// 並びは最初に現れた位置、定義はリーフに近いスタックの宣言を優先します。
fn resolve_uses(chain: &[&StackDescriptor]) -> Result<Vec<ResourceDefinition>> {
    let mut names: Vec<(&str, &StackDescriptor)> = Vec::new();
    for stack in chain {
        for name in &stack.uses {
            if !names.iter().any(|(n, _)| n == name) {
                names.push((name.as_str(), *stack));
            }
        }
    }

    names
        .into_iter()
        .map(|(name, user)| {
            chain
                .iter()
                .rev()
                .find_map(|s| s.resource(name))
                .cloned()
                .ok_or_else(|| ConfigError::UnknownResource {
                    stack: user.name.clone(),
                    resource: name.to_string(),
                    field: "uses".to_string(),
                })
        })
        .collect()
}

/// `overlay` を `base` にディープマージ
///
/// 両方がマップの場合のみ再帰し、それ以外は `overlay` で置き換えます。
pub fn deep_merge(base: &mut Document, overlay: &Document) {
    match (base, overlay) {
        (Document::Map(base_map), Document::Map(overlay_map)) => {
            for (key, value) in overlay_map.iter() {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}
