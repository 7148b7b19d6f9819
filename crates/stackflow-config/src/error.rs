use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("設定ディレクトリが見つかりません")]
    ConfigDirNotFound,

    #[error(
        "STACKFLOW_CONFIG_PATH で指定された設定ファイルが見つかりません: {0}"
    )]
    SettingsNotFound(PathBuf),

    #[error("設定ファイルを解析できません: {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("設定値が不正です: {field}: {message}")]
    Invalid { field: String, message: String },

    #[error("IO エラー: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
