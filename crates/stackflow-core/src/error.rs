use std::path::PathBuf;
use thiserror::Error;

use crate::registry::Namespace;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("YAMLパースエラー: {file}\n理由: {message}")]
    YamlParse { file: PathBuf, message: String },

    #[error("ファイル読み込みエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO エラー: {path}\n理由: {message}")]
    IoError { path: PathBuf, message: String },

    #[error("ファイル発見エラー: {path}\n理由: {message}")]
    DiscoveryError { path: PathBuf, message: String },

    #[error(
        "プロジェクトルートが見つかりません\n探索開始位置: {0}\nヒント: .stackflow ディレクトリを含むディレクトリで実行してください"
    )]
    ProjectRootNotFound(PathBuf),

    #[error("無効な設定: {file} ({field})\n理由: {message}")]
    InvalidField {
        file: PathBuf,
        field: String,
        message: String,
    },

    #[error("スタック名が重複しています: '{name}'\n  - {first}\n  - {second}")]
    DuplicateStack {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("スタックが見つかりません: {0}")]
    StackNotFound(String),

    #[error("親スタック '{parent}' が見つかりません (スタック: {stack}, ファイル: {file})")]
    ParentNotFound {
        stack: String,
        parent: String,
        file: PathBuf,
    },

    #[error("スタック '{stack}' の type を解決できません: {source}")]
    UnknownType {
        stack: String,
        #[source]
        source: RegistryError,
    },

    #[error("スタック '{stack}' のリソース '{resource}' を解決できません: {source}")]
    UnknownResourceType {
        stack: String,
        resource: String,
        #[source]
        source: RegistryError,
    },

    #[error("未定義のリソース '{resource}' が参照されています (スタック: {stack}, フィールド: {field})")]
    UnknownResource {
        stack: String,
        resource: String,
        field: String,
    },

    #[error("循環継承が検出されました: {}", .0.join(" -> "))]
    CyclicInheritance(Vec<String>),

    #[error("リソース間の循環参照が検出されました (スタック: {stack}): {}", .cycle.join(" -> "))]
    CyclicReference { stack: String, cycle: Vec<String> },

    #[error("スタック '{stack}' は {expected} スタックではありません")]
    WrongKind { stack: String, expected: String },

    #[error("'{target}' の設定をデコードできません (スタック: {stack}): {source}")]
    Decode {
        stack: String,
        target: String,
        #[source]
        source: DecodeError,
    },
}

impl ConfigError {
    /// エラーの対象スタック名
    pub fn stack(&self) -> Option<&str> {
        match self {
            ConfigError::ParentNotFound { stack, .. }
            | ConfigError::UnknownType { stack, .. }
            | ConfigError::UnknownResourceType { stack, .. }
            | ConfigError::UnknownResource { stack, .. }
            | ConfigError::CyclicReference { stack, .. }
            | ConfigError::WrongKind { stack, .. }
            | ConfigError::Decode { stack, .. } => Some(stack),
            ConfigError::DuplicateStack { name, .. } => Some(name),
            ConfigError::StackNotFound(name) => Some(name),
            ConfigError::CyclicInheritance(cycle) => cycle.first().map(String::as_str),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Provider registry errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("{namespace} type '{key}' is already registered")]
    Duplicate { namespace: Namespace, key: String },

    #[error("{namespace} type '{key}' is not registered (known: {}){}", .known.join(", "), .suggestion.as_ref().map(|s| format!(", did you mean '{s}'?")).unwrap_or_default())]
    NotFound {
        namespace: Namespace,
        key: String,
        known: Vec<String>,
        suggestion: Option<String>,
    },

    #[error("driver for '{key}' does not belong to the {namespace} namespace")]
    DriverMismatch { namespace: Namespace, key: String },

    #[error("{namespace} type '{key}' has no driver")]
    MissingDriver { namespace: Namespace, key: String },
}

/// Typed decode failure at the registry boundary
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{path}: {message}")]
pub struct DecodeError {
    pub path: String,
    pub message: String,
}

impl DecodeError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Errors returned by resource drivers and auth providers
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("Command execution failed: {0}")]
    CommandFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
}

impl DriverError {
    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, DriverError::Transient(_) | DriverError::Timeout(_))
    }
}

/// Placeholder substitution errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlaceholderError {
    #[error("{field}: 未定義のリソース '{resource}' を参照しています")]
    UnknownResource { field: String, resource: String },

    #[error("{field}: リソース '{resource}' はまだ適用されていません")]
    ResourceNotApplied { field: String, resource: String },

    #[error("{field}: リソース '{resource}' に出力 '{property}' がありません")]
    MissingOutput {
        field: String,
        resource: String,
        property: String,
    },

    #[error("{field}: シークレット '{name}' が見つかりません")]
    MissingSecret { field: String, name: String },

    #[error("{field}: 認証プロバイダー '{provider}' の資格情報がありません")]
    MissingCredential { field: String, provider: String },

    #[error("{field}: 不正なプレースホルダー '{token}': {message}")]
    Malformed {
        field: String,
        token: String,
        message: String,
    },

    #[error("{field}: '{token}' の展開結果に別のプレースホルダーが含まれています")]
    Nested { field: String, token: String },

    #[error("{field}: '{token}' はスカラー値ではないため文字列に埋め込めません")]
    NonScalar { field: String, token: String },
}

impl PlaceholderError {
    /// ソース設定の誤り（実行時状態に依存しない）かどうか
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            PlaceholderError::UnknownResource { .. }
                | PlaceholderError::Malformed { .. }
                | PlaceholderError::Nested { .. }
                | PlaceholderError::NonScalar { .. }
        )
    }

    pub fn field(&self) -> &str {
        match self {
            PlaceholderError::UnknownResource { field, .. }
            | PlaceholderError::ResourceNotApplied { field, .. }
            | PlaceholderError::MissingOutput { field, .. }
            | PlaceholderError::MissingSecret { field, .. }
            | PlaceholderError::MissingCredential { field, .. }
            | PlaceholderError::Malformed { field, .. }
            | PlaceholderError::Nested { field, .. }
            | PlaceholderError::NonScalar { field, .. } => field,
        }
    }
}
