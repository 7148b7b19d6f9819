pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 設定ファイルのパスを直接指定する環境変数
pub const CONFIG_PATH_ENV: &str = "STACKFLOW_CONFIG_PATH";

const SETTINGS_FILE: &str = "config.yaml";
const IDENTITY_FILE: &str = "identity.txt";

/// StackFlowの設定ディレクトリ (~/.config/stackflow) を取得
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("stackflow");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// 設定ファイルを探す
///
/// 以下の優先順位で検索:
/// 1. 環境変数 STACKFLOW_CONFIG_PATH (直接パス指定、存在しなければエラー)
/// 2. ~/.config/stackflow/config.yaml
///
/// どちらも無ければ `None`（デフォルト設定を使う）
pub fn find_settings_file() -> Result<Option<PathBuf>> {
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(config_path);
        if !path.exists() {
            return Err(ConfigError::SettingsNotFound(path));
        }
        return Ok(Some(path));
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global = config_dir.join("stackflow").join(SETTINGS_FILE);
        if global.exists() {
            return Ok(Some(global));
        }
    }

    Ok(None)
}

/// ドライバー呼び出しのリトライ設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetrySettings {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// ユーザー設定 (~/.config/stackflow/config.yaml)
///
/// ```yaml
/// identity_file: ~/.config/stackflow/identity.txt
/// owner: ci-runner-3
/// default_environment: staging
/// lock_ttl_secs: 3600
/// call_timeout_secs: 300
/// retry:
///   max_attempts: 5
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// age秘密鍵ファイル
    pub identity_file: Option<PathBuf>,
    /// ロックに記録する実行者名（省略時はホスト名）
    pub owner: Option<String>,
    pub default_environment: Option<String>,
    /// これより古いロックは引き継ぐ
    pub lock_ttl_secs: u64,
    /// ドライバー・認証呼び出し1回あたりのタイムアウト
    pub call_timeout_secs: u64,
    pub retry: RetrySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            identity_file: None,
            owner: None,
            default_environment: None,
            lock_ttl_secs: 60 * 60,
            call_timeout_secs: 5 * 60,
            retry: RetrySettings::default(),
        }
    }
}

impl Settings {
    /// 設定ファイルを探して読み込む。無ければデフォルト
    pub fn load() -> Result<Self> {
        match find_settings_file()? {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content, path)
    }

    fn parse(content: &str, path: &Path) -> Result<Self> {
        // 空ファイルはデフォルト扱い
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let settings: Settings =
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Self::parse(content, Path::new("<inline>"))
    }

    fn validate(&self) -> Result<()> {
        let invalid = |field: &str, message: &str| ConfigError::Invalid {
            field: field.to_string(),
            message: message.to_string(),
        };
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "1以上である必要があります"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(invalid(
                "retry.backoff_multiplier",
                "1.0以上である必要があります",
            ));
        }
        if self.call_timeout_secs == 0 {
            return Err(invalid("call_timeout_secs", "1以上である必要があります"));
        }
        Ok(())
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// age秘密鍵のパス。`~/` はホームディレクトリに展開
    pub fn identity_path(&self) -> Result<PathBuf> {
        match &self.identity_file {
            Some(path) => Ok(expand_home(path)),
            None => Ok(get_config_dir()?.join(IDENTITY_FILE)),
        }
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    #[test]
    fn test_defaults() {
        let settings = Settings::from_yaml_str("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.lock_ttl(), Duration::from_secs(3600));
        assert_eq!(settings.call_timeout(), Duration::from_secs(300));
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.retry.initial_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_override() {
        let settings = Settings::from_yaml_str(
            "owner: ci-runner\ndefault_environment: staging\nretry:\n  max_attempts: 5\n",
        )
        .unwrap();
        assert_eq!(settings.owner.as_deref(), Some("ci-runner"));
        assert_eq!(settings.default_environment.as_deref(), Some("staging"));
        assert_eq!(settings.retry.max_attempts, 5);
        // 指定していない値はデフォルトのまま
        assert_eq!(settings.retry.max_delay(), Duration::from_secs(30));
        assert_eq!(settings.lock_ttl_secs, 3600);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = Settings::from_yaml_str("lock_ttl: 10\n");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let result = Settings::from_yaml_str("retry:\n  max_attempts: 0\n");
        match result {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, "retry.max_attempts"),
            other => panic!("Expected Invalid error, got {other:?}"),
        }
        assert!(Settings::from_yaml_str("retry:\n  backoff_multiplier: 0.5\n").is_err());
        assert!(Settings::from_yaml_str("call_timeout_secs: 0\n").is_err());
    }

    #[test]
    fn test_identity_path_expands_home() {
        let settings = Settings {
            identity_file: Some(PathBuf::from("~/keys/stackflow.txt")),
            ..Settings::default()
        };
        let path = settings.identity_path().unwrap();
        if let Some(home) = dirs::home_dir() {
            assert_eq!(path, home.join("keys/stackflow.txt"));
        }

        let settings = Settings {
            identity_file: Some(PathBuf::from("/etc/stackflow/key.txt")),
            ..Settings::default()
        };
        assert_eq!(
            settings.identity_path().unwrap(),
            PathBuf::from("/etc/stackflow/key.txt")
        );
    }

    #[test]
    #[serial]
    fn test_load_from_env_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("custom.yaml");
        fs::write(&config_path, "owner: from-env\n").unwrap();

        temp_env::with_var(CONFIG_PATH_ENV, Some(config_path.as_os_str()), || {
            assert_eq!(find_settings_file().unwrap(), Some(config_path.clone()));
            let settings = Settings::load().unwrap();
            assert_eq!(settings.owner.as_deref(), Some("from-env"));
        });
    }

    #[test]
    #[serial]
    fn test_missing_env_path_is_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let missing = temp_dir.path().join("missing.yaml");

        temp_env::with_var(CONFIG_PATH_ENV, Some(missing.as_os_str()), || {
            let result = Settings::load();
            assert!(matches!(result, Err(ConfigError::SettingsNotFound(_))));
        });
    }

    #[test]
    #[serial]
    fn test_parse_error_names_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("broken.yaml");
        fs::write(&config_path, "retry: [1, 2\n").unwrap();

        let err = Settings::load_from(&config_path).unwrap_err();
        assert!(err.to_string().contains("broken.yaml"));
    }
}
