//! 統合ローダー
//!
//! ファイル発見、YAMLパース、レジストリによる検証を統合

use crate::discovery::{DiscoveredFiles, discover_files, find_project_root};
use crate::error::{ConfigError, Result};
use crate::model::{StackDescriptor, StacksMap, TemplateDefinition};
use crate::parser::parse_descriptor;
use crate::placeholder::contains_placeholder;
use crate::registry::{Namespace, Registry};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// ロード済みプロジェクト
#[derive(Debug, Clone)]
pub struct Project {
    pub root: PathBuf,
    pub files: DiscoveredFiles,
    pub stacks: StacksMap,
}

/// プロジェクトを検出してロード
///
/// 以下の処理を実行:
/// 1. プロジェクトルートの検出
/// 2. ファイルの自動発見
/// 3. YAMLパース
/// 4. 親参照とタイプキーの検証
#[instrument(skip(registry))]
pub fn load_project(registry: &Registry) -> Result<Project> {
    info!("Starting project load");
    let root = find_project_root()?;
    load_project_from_root(&root, registry)
}

/// 指定されたルートディレクトリからプロジェクトをロード
#[instrument(skip(project_root, registry), fields(project_root = %project_root.display()))]
pub fn load_project_from_root(project_root: &Path, registry: &Registry) -> Result<Project> {
    let files = discover_files(project_root)?;
    let stacks = load_files(&files.stacks)?;
    validate_with_registry(&stacks, registry)?;
    Ok(Project {
        root: project_root.to_path_buf(),
        files,
        stacks,
    })
}

/// 記述子を読み込む（レジストリ検証なし）
///
/// 親参照とスタック名の一意性のみ検証します。
#[instrument(skip(project_root), fields(project_root = %project_root.display()))]
pub fn load(project_root: &Path) -> Result<StacksMap> {
    debug!("Step 1: Discovering files");
    let files = discover_files(project_root)?;

    debug!("Step 2: Parsing descriptors");
    load_files(&files.stacks)
}

/// 記述子を読み込み、レジストリで検証
#[instrument(skip(project_root, registry), fields(project_root = %project_root.display()))]
pub fn load_with_registry(project_root: &Path, registry: &Registry) -> Result<StacksMap> {
    let stacks = load(project_root)?;

    debug!("Step 3: Validating against registry");
    validate_with_registry(&stacks, registry)?;
    Ok(stacks)
}

fn load_files(paths: &[PathBuf]) -> Result<StacksMap> {
    let mut stacks = StacksMap::new();
    for path in paths {
        debug!(file = %path.display(), "Reading stack descriptor");
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.clone(),
            message: e.to_string(),
        })?;
        stacks.insert(parse_descriptor(&content, path)?)?;
    }

    validate_parents(&stacks)?;
    info!(stacks = stacks.len(), "Stack descriptors loaded");
    Ok(stacks)
}

fn validate_parents(stacks: &StacksMap) -> Result<()> {
    for stack in stacks.iter() {
        if let Some(parent) = &stack.parent
            && !stacks.contains(parent)
        {
            return Err(ConfigError::ParentNotFound {
                stack: stack.name.clone(),
                parent: parent.clone(),
                file: stack.source.clone(),
            });
        }
    }
    Ok(())
}

/// タイプキー、テンプレートエイリアス、リソースタイプを検証
pub fn validate_with_registry(stacks: &StacksMap, registry: &Registry) -> Result<()> {
    for stack in stacks.iter() {
        for template in &stack.templates {
            registry
                .lookup(Namespace::Template, &template.type_key)
                .map_err(|source| ConfigError::UnknownType {
                    stack: stack.name.clone(),
                    source,
                })?;
        }

        let type_key = match find_alias(stack, stacks) {
            Some(alias) => &alias.type_key,
            None => &stack.stack_type,
        };
        registry
            .lookup(Namespace::Template, type_key)
            .map_err(|source| ConfigError::UnknownType {
                stack: stack.name.clone(),
                source,
            })?;

        for resource in &stack.resources {
            let entry = registry
                .lookup(Namespace::Resource, &resource.type_key)
                .map_err(|source| ConfigError::UnknownResourceType {
                    stack: stack.name.clone(),
                    resource: resource.name.clone(),
                    source,
                })?;

            // プレースホルダーを含む設定は置換後にデコードする
            if resource.config.any_str(&contains_placeholder) {
                continue;
            }
            entry
                .decode(&resource.config)
                .map_err(|source| ConfigError::Decode {
                    stack: stack.name.clone(),
                    target: resource.name.clone(),
                    source,
                })?;
        }
        debug!(stack = %stack.name, type_key = %type_key, "Stack validated");
    }
    Ok(())
}

/// 自身または祖先が宣言したテンプレートエイリアスを探す
fn find_alias<'a>(stack: &StackDescriptor, stacks: &'a StacksMap) -> Option<&'a TemplateDefinition> {
    let mut visited = HashSet::new();
    let mut current = stacks.get(&stack.name);
    while let Some(s) = current {
        if !visited.insert(s.name.as_str()) {
            // 循環は継承解決時に報告する
            return None;
        }
        if let Some(template) = s.template(&stack.stack_type) {
            return Some(template);
        }
        current = s.parent.as_deref().and_then(|p| stacks.get(p));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Changeset;
    use crate::error::{DriverError, RegistryError};
    use crate::provider::{AppliedResource, DesiredResource, Outputs, ResourceDriver};
    use crate::registry::{DocumentDecoder, SerdeDecoder};
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::fs;

    struct NullDriver;

    #[async_trait]
    impl ResourceDriver for NullDriver {
        fn name(&self) -> &str {
            "null"
        }

        async fn plan(
            &self,
            desired: &DesiredResource,
            current: Option<&AppliedResource>,
        ) -> std::result::Result<Changeset, DriverError> {
            Ok(Changeset::diff(desired, current))
        }

        async fn apply(&self, _changeset: &Changeset) -> std::result::Result<Outputs, DriverError> {
            Ok(Outputs::new())
        }

        async fn destroy(&self, _applied: &AppliedResource) -> std::result::Result<(), DriverError> {
            Ok(())
        }
    }

    #[derive(Debug, Deserialize)]
    #[allow(dead_code)]
    struct PostgresConfig {
        version: u32,
    }

    fn registry() -> Registry {
        let mut builder = Registry::builder();
        builder
            .register_resource("postgres", SerdeDecoder::<PostgresConfig>::new(), NullDriver)
            .unwrap()
            .register_template("infrastructure", DocumentDecoder, None)
            .unwrap()
            .register_template("application", DocumentDecoder, None)
            .unwrap();
        builder.build()
    }

    fn write_stack(base: &Path, relative: &str, content: &str) {
        let path = base.join(".stackflow/stacks").join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn create_test_project(base: &Path) {
        write_stack(
            base,
            "infra.yaml",
            r#"
provisioner:
  state: local
templates:
  web:
    type: application
    config:
      port: 8080
resources:
  db:
    type: postgres
    config:
      version: 16
"#,
        );
        write_stack(
            base,
            "apps/api.yaml",
            r#"
type: web
parent: infra
uses: [db]
config:
  database_url: "${resource:db.host}"
"#,
        );
    }

    #[test]
    fn test_load_project_basic() -> Result<()> {
        let temp_dir = tempfile::tempdir().unwrap();
        create_test_project(temp_dir.path());

        let stacks = load_with_registry(temp_dir.path(), &registry())?;

        assert_eq!(stacks.len(), 2);
        let api = stacks.require("api")?;
        assert_eq!(api.parent.as_deref(), Some("infra"));
        assert_eq!(api.stack_type, "web");
        assert_eq!(stacks.children_of("infra"), vec!["api"]);
        Ok(())
    }

    #[test]
    fn test_load_project_from_root() -> Result<()> {
        let temp_dir = tempfile::tempdir().unwrap();
        create_test_project(temp_dir.path());

        let project = load_project_from_root(temp_dir.path(), &registry())?;
        assert_eq!(project.stacks.len(), 2);
        assert!(project.files.secrets.is_none());
        Ok(())
    }

    #[test]
    fn test_duplicate_stack_names_both_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        write_stack(temp_dir.path(), "a/api.yaml", "type: application");
        write_stack(temp_dir.path(), "b/api.yaml", "type: application");

        let err = load(temp_dir.path()).unwrap_err();
        match err {
            ConfigError::DuplicateStack { name, first, second } => {
                assert_eq!(name, "api");
                assert!(first.ends_with("a/api.yaml"));
                assert!(second.ends_with("b/api.yaml"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_missing_parent_is_named() {
        let temp_dir = tempfile::tempdir().unwrap();
        write_stack(temp_dir.path(), "api.yaml", "type: application\nparent: shared");

        let err = load(temp_dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParentNotFound { ref parent, .. } if parent == "shared"));
        assert!(err.to_string().contains("shared"));
    }

    #[test]
    fn test_unknown_type_lists_known_keys() {
        let temp_dir = tempfile::tempdir().unwrap();
        write_stack(temp_dir.path(), "api.yaml", "type: aplication");

        let err = load_with_registry(temp_dir.path(), &registry()).unwrap_err();
        match &err {
            ConfigError::UnknownType {
                source: RegistryError::NotFound { known, suggestion, .. },
                ..
            } => {
                assert_eq!(known, &vec!["application".to_string(), "infrastructure".to_string()]);
                assert_eq!(suggestion.as_deref(), Some("application"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_resource_type() {
        let temp_dir = tempfile::tempdir().unwrap();
        write_stack(
            temp_dir.path(),
            "infra.yaml",
            "resources:\n  cache:\n    type: redis\n",
        );

        let err = load_with_registry(temp_dir.path(), &registry()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownResourceType { ref resource, .. } if resource == "cache"));
    }

    #[test]
    fn test_resource_config_must_decode() {
        let temp_dir = tempfile::tempdir().unwrap();
        write_stack(
            temp_dir.path(),
            "infra.yaml",
            "resources:\n  db:\n    type: postgres\n    config:\n      version: latest\n",
        );

        let err = load_with_registry(temp_dir.path(), &registry()).unwrap_err();
        assert!(matches!(err, ConfigError::Decode { ref target, .. } if target == "db"));
    }

    #[test]
    fn test_load_without_registry_skips_type_checks() -> Result<()> {
        let temp_dir = tempfile::tempdir().unwrap();
        write_stack(temp_dir.path(), "api.yaml", "type: anything");

        let stacks = load(temp_dir.path())?;
        assert!(stacks.contains("api"));
        Ok(())
    }
}
