//! YAML記述子パーサー
//!
//! 1ファイル分のYAMLを [`StackDescriptor`] に変換します。
//! `provisioner` / `resources` / `templates` のいずれかを含む記述子はインフラ記述子、
//! それ以外はアプリケーション記述子として扱います。

use crate::document::{Document, Mapping};
use crate::error::{ConfigError, Result};
use crate::model::{ResourceDefinition, StackDescriptor, StackKind, TemplateDefinition};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// インフラ記述子で `type` を省略した場合のテンプレート
pub const DEFAULT_INFRASTRUCTURE_TYPE: &str = "infrastructure";

const KNOWN_KEYS: &[&str] = &[
    "name",
    "type",
    "parent",
    "config",
    "uses",
    "resources",
    "templates",
    "auth",
    "environments",
    "provisioner",
];

const INFRASTRUCTURE_KEYS: &[&str] = &["provisioner", "resources", "templates"];

/// YAML文字列をスタック記述子としてパース
///
/// `name` が無い場合はファイル名（拡張子なし）をスタック名とします。
pub fn parse_descriptor(content: &str, path: &Path) -> Result<StackDescriptor> {
    let document = Document::from_yaml_str(content).map_err(|e| ConfigError::YamlParse {
        file: path.to_path_buf(),
        message: e.to_string(),
    })?;
    parse_document(document, path)
}

/// パース済みドキュメントをスタック記述子に変換
pub fn parse_document(document: Document, path: &Path) -> Result<StackDescriptor> {
    let Document::Map(root) = document else {
        return Err(invalid(path, "$", "記述子はマップである必要があります"));
    };

    if let Some(unknown) = root.keys().find(|k| !KNOWN_KEYS.contains(k)) {
        return Err(invalid(
            path,
            unknown,
            format!("不明なフィールドです (使用可能: {})", KNOWN_KEYS.join(", ")),
        ));
    }

    let name = match root.get("name") {
        Some(value) => expect_str(value, path, "name")?.to_string(),
        None => path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .ok_or_else(|| invalid(path, "name", "スタック名を決定できません"))?,
    };
    if name.is_empty() {
        return Err(invalid(path, "name", "スタック名が空です"));
    }

    let kind = if INFRASTRUCTURE_KEYS.iter().any(|k| root.contains_key(k)) {
        StackKind::Infrastructure
    } else {
        StackKind::Application
    };

    let stack_type = match (root.get("type"), kind) {
        (Some(value), _) => expect_str(value, path, "type")?.to_string(),
        (None, StackKind::Infrastructure) => DEFAULT_INFRASTRUCTURE_TYPE.to_string(),
        (None, StackKind::Application) => {
            return Err(invalid(path, "type", "アプリケーション記述子には type が必要です"));
        }
    };

    let mut stack = StackDescriptor::new(&name, kind, stack_type, path.to_path_buf());

    if let Some(parent) = root.get("parent") {
        stack.parent = Some(expect_str(parent, path, "parent")?.to_string());
    }

    stack.config = parse_config(root.get("config"), path, "config")?;

    if let Some(uses) = root.get("uses") {
        stack.uses = parse_uses(uses, path)?;
    }

    if let Some(resources) = root.get("resources") {
        stack.resources = parse_resources(resources, &name, path)?;
    }

    if let Some(templates) = root.get("templates") {
        stack.templates = parse_templates(templates, path)?;
    }

    if let Some(auth) = root.get("auth") {
        stack.auth = expect_map(auth, path, "auth")?.clone();
    }

    if let Some(environments) = root.get("environments") {
        stack.environments = parse_environments(environments, path)?;
    }

    stack.provisioner = root.get("provisioner").cloned();

    debug!(
        stack = %stack.name,
        kind = %stack.kind,
        resources = stack.resources.len(),
        "Parsed stack descriptor"
    );
    Ok(stack)
}

fn parse_config(value: Option<&Document>, path: &Path, field: &str) -> Result<Document> {
    match value {
        None | Some(Document::Null) => Ok(Document::map()),
        Some(Document::Map(m)) => Ok(Document::Map(m.clone())),
        Some(other) => Err(invalid(
            path,
            field,
            format!("マップである必要があります ({} が指定されました)", other.type_name()),
        )),
    }
}

fn parse_uses(value: &Document, path: &Path) -> Result<Vec<String>> {
    let items = value
        .as_seq()
        .ok_or_else(|| invalid(path, "uses", "リソース名のリストである必要があります"))?;

    let mut uses: Vec<String> = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let name = expect_str(item, path, &format!("uses.{index}"))?;
        if !uses.iter().any(|u| u == name) {
            uses.push(name.to_string());
        }
    }
    Ok(uses)
}

fn parse_resources(value: &Document, owner: &str, path: &Path) -> Result<Vec<ResourceDefinition>> {
    let entries = expect_map(value, path, "resources")?;
    let mut resources = Vec::with_capacity(entries.len());

    for (name, body) in entries.iter() {
        let field = format!("resources.{name}");
        let (type_key, config) = parse_typed_block(body, path, &field)?;
        resources.push(ResourceDefinition::new(name, type_key, owner, config));
    }
    Ok(resources)
}

fn parse_templates(value: &Document, path: &Path) -> Result<Vec<TemplateDefinition>> {
    let entries = expect_map(value, path, "templates")?;
    let mut templates = Vec::with_capacity(entries.len());

    for (name, body) in entries.iter() {
        let field = format!("templates.{name}");
        let (type_key, config) = parse_typed_block(body, path, &field)?;
        templates.push(TemplateDefinition {
            name: name.clone(),
            type_key,
            config,
        });
    }
    Ok(templates)
}

/// `{ type: ..., config: ... }` 形式のブロック
fn parse_typed_block(body: &Document, path: &Path, field: &str) -> Result<(String, Document)> {
    let block = expect_map(body, path, field)?;
    if let Some(unknown) = block.keys().find(|k| *k != "type" && *k != "config") {
        return Err(invalid(
            path,
            &format!("{field}.{unknown}"),
            "不明なフィールドです (使用可能: type, config)",
        ));
    }

    let type_key = block
        .get("type")
        .ok_or_else(|| invalid(path, &format!("{field}.type"), "type が必要です"))
        .and_then(|v| expect_str(v, path, &format!("{field}.type")))?
        .to_string();
    let config = parse_config(block.get("config"), path, &format!("{field}.config"))?;
    Ok((type_key, config))
}

fn parse_environments(value: &Document, path: &Path) -> Result<BTreeMap<String, Document>> {
    let entries = expect_map(value, path, "environments")?;
    let mut environments = BTreeMap::new();
    for (env, body) in entries.iter() {
        let config = parse_config(Some(body), path, &format!("environments.{env}"))?;
        environments.insert(env.clone(), config);
    }
    Ok(environments)
}

fn expect_str<'a>(value: &'a Document, path: &Path, field: &str) -> Result<&'a str> {
    value.as_str().ok_or_else(|| {
        invalid(
            path,
            field,
            format!("文字列である必要があります ({} が指定されました)", value.type_name()),
        )
    })
}

fn expect_map<'a>(value: &'a Document, path: &Path, field: &str) -> Result<&'a Mapping> {
    value.as_map().ok_or_else(|| {
        invalid(
            path,
            field,
            format!("マップである必要があります ({} が指定されました)", value.type_name()),
        )
    })
}

fn invalid(path: &Path, field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidField {
        file: path.to_path_buf(),
        field: field.to_string(),
        message: message.into(),
    }
}
