//! ファイル自動発見機能
//!
//! 規約ベースのディレクトリ構造からスタック記述子を自動的に発見します。
//!
//! ```text
//! <project>/
//! └── .stackflow/
//!     ├── secrets.yaml
//!     └── stacks/
//!         ├── infra.yaml
//!         └── apps/api.yml
//! ```

use crate::error::{ConfigError, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// プロジェクトディレクトリ名
pub const PROJECT_DIR: &str = ".stackflow";
/// 記述子ディレクトリ (`.stackflow/` 配下)
pub const STACKS_DIR: &str = "stacks";
/// 暗号化済みシークレットファイル (`.stackflow/` 配下)
pub const SECRETS_FILE: &str = "secrets.yaml";
/// プロジェクトルートを明示する環境変数
pub const PROJECT_ROOT_ENV: &str = "STACKFLOW_PROJECT_ROOT";

/// 発見されたファイル群
#[derive(Debug, Clone, Default)]
pub struct DiscoveredFiles {
    /// スタック記述子 (stacks/**/*.yaml, *.yml)。パス順
    pub stacks: Vec<PathBuf>,
    /// シークレットドキュメント (secrets.yaml)
    pub secrets: Option<PathBuf>,
}

/// プロジェクトルートを検出
///
/// 以下の優先順位で検索:
/// 1. 環境変数 STACKFLOW_PROJECT_ROOT
/// 2. カレントディレクトリから上に向かって `.stackflow/` を探す
#[tracing::instrument]
pub fn find_project_root() -> Result<PathBuf> {
    // 1. 環境変数
    if let Ok(root) = std::env::var(PROJECT_ROOT_ENV) {
        let path = PathBuf::from(&root);
        debug!(env_root = %root, "Checking STACKFLOW_PROJECT_ROOT");
        if path.join(PROJECT_DIR).is_dir() {
            info!(project_root = %path.display(), "Found project root from environment variable");
            return Ok(path);
        }
        warn!(env_root = %root, "STACKFLOW_PROJECT_ROOT has no .stackflow directory, falling back");
    }

    // 2. カレントディレクトリから上に向かって探す
    let start_dir = std::env::current_dir()?;
    find_project_root_from(&start_dir)
}

/// 指定ディレクトリから上に向かってプロジェクトルートを探す
pub fn find_project_root_from(start_dir: &Path) -> Result<PathBuf> {
    let mut current = start_dir.to_path_buf();
    debug!(start_dir = %start_dir.display(), "Searching for project root");

    loop {
        debug!(checking = %current.display(), "Looking for .stackflow/");
        if current.join(PROJECT_DIR).is_dir() {
            info!(project_root = %current.display(), "Found project root");
            return Ok(current);
        }

        // 親ディレクトリへ
        if !current.pop() {
            break;
        }
    }

    warn!(start_dir = %start_dir.display(), "Project root not found");
    Err(ConfigError::ProjectRootNotFound(start_dir.to_path_buf()))
}

/// プロジェクトルートからファイルを自動発見
#[tracing::instrument(skip(project_root), fields(project_root = %project_root.display()))]
pub fn discover_files(project_root: &Path) -> Result<DiscoveredFiles> {
    debug!("Starting file discovery");
    let mut discovered = DiscoveredFiles::default();
    let project_dir = project_root.join(PROJECT_DIR);

    let stacks_dir = project_dir.join(STACKS_DIR);
    if stacks_dir.is_dir() {
        discovered.stacks = discover_yaml_files(&stacks_dir)?;
        info!(
            stack_count = discovered.stacks.len(),
            "Discovered stack descriptors"
        );
    }

    let secrets_file = project_dir.join(SECRETS_FILE);
    if secrets_file.is_file() {
        debug!(file = %secrets_file.display(), "Found secrets document");
        discovered.secrets = Some(secrets_file);
    }

    Ok(discovered)
}

/// ディレクトリ配下の .yaml / .yml ファイルを再帰的に発見
///
/// アルファベット順にソートして返す
fn discover_yaml_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut visited = HashSet::new();

    visit_dir(dir, &mut files, &mut visited)?;

    files.sort();

    Ok(files)
}

/// ディレクトリを再帰的に走査
fn visit_dir(dir: &Path, files: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }

    // 正規化されたパスを取得してループを検出
    let canonical_dir = dir.canonicalize().map_err(|e| ConfigError::DiscoveryError {
        path: dir.to_path_buf(),
        message: format!("パスの正規化に失敗: {}", e),
    })?;

    if !visited.insert(canonical_dir.clone()) {
        warn!(dir = %canonical_dir.display(), "Symlink loop detected, skipping");
        return Ok(());
    }

    let entries = std::fs::read_dir(dir).map_err(|e| ConfigError::DiscoveryError {
        path: dir.to_path_buf(),
        message: format!("ディレクトリの読み込みに失敗: {}", e),
    })?;

    for entry in entries {
        let entry = entry.map_err(|e| ConfigError::DiscoveryError {
            path: dir.to_path_buf(),
            message: format!("ディレクトリエントリの読み込みに失敗: {}", e),
        })?;
        let path = entry.path();

        if path.is_dir() {
            visit_dir(&path, files, visited)?;
        } else if is_descriptor(&path) {
            files.push(path);
        }
    }

    Ok(())
}

fn is_descriptor(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    )
}
