pub mod deploy;
pub mod destroy;
pub mod provision;
pub mod resolve;
pub mod secrets;
pub mod status;
pub mod validate;

use stackflow_cloud::{
    FileStateStore, Provisioner, ProvisionerOptions, RetryConfig, default_owner,
};
use stackflow_config::Settings;
use stackflow_core::discovery::PROJECT_DIR;
use stackflow_core::{Project, Registry, SecretLookup};
use stackflow_secrets::{AgeIdentity, SecretError, SecretsDocument, decrypt_all};
use std::sync::Arc;
use tracing::{debug, warn};

/// コマンド共通のコンテキスト
pub struct Context {
    pub settings: Settings,
    pub registry: Arc<Registry>,
    pub project: Project,
}

impl Context {
    /// 設定・レジストリ・プロジェクトをロード
    pub fn load() -> anyhow::Result<Self> {
        let settings = Settings::load()?;
        let registry = build_registry()?;
        let project = stackflow_core::load_project(&registry)?;
        debug!(
            root = %project.root.display(),
            stacks = project.stacks.len(),
            "Project loaded"
        );
        Ok(Self {
            settings,
            registry,
            project,
        })
    }

    /// 環境名を決定（引数 > STACKFLOW_ENV > 設定ファイルの default_environment）
    pub fn environment(&self, env: Option<String>) -> anyhow::Result<String> {
        env.or_else(|| self.settings.default_environment.clone())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "環境名を指定してください: --env <ENV> または STACKFLOW_ENV=<ENV>"
                )
            })
    }

    pub fn options(&self) -> ProvisionerOptions {
        let retry = &self.settings.retry;
        ProvisionerOptions {
            owner: self.settings.owner.clone().unwrap_or_else(default_owner),
            lock_ttl: self.settings.lock_ttl(),
            call_timeout: self.settings.call_timeout(),
            retry: RetryConfig {
                max_attempts: retry.max_attempts,
                initial_delay: retry.initial_delay(),
                max_delay: retry.max_delay(),
                backoff_multiplier: retry.backoff_multiplier,
            },
        }
    }

    /// 状態ストアを接続したプロビジョナー
    pub fn provisioner(&self) -> Provisioner {
        let state = Arc::new(FileStateStore::new(self.project.root.join(PROJECT_DIR)));
        Provisioner::new(
            self.registry.clone(),
            Arc::new(self.project.stacks.clone()),
            state,
        )
        .with_options(self.options())
    }

    /// 復号したシークレットも渡したプロビジョナー
    pub fn provisioner_with_secrets(&self) -> anyhow::Result<Provisioner> {
        let provisioner = self.provisioner();
        match self.load_secrets()? {
            Some(secrets) => Ok(provisioner.with_secrets(secrets)),
            None => Ok(provisioner),
        }
    }

    /// シークレットを復号
    ///
    /// シークレットファイルまたは秘密鍵が無い場合は `None`。
    /// 自分宛てでないシークレットはスキップする。
    fn load_secrets(&self) -> anyhow::Result<Option<Arc<dyn SecretLookup>>> {
        let Some(path) = &self.project.files.secrets else {
            return Ok(None);
        };
        let document = SecretsDocument::load(path)?;

        let identity_path = self.settings.identity_path()?;
        let identity = match AgeIdentity::load(&identity_path) {
            Ok(identity) => identity,
            Err(SecretError::IdentityNotFound(path)) => {
                warn!(
                    path = %path.display(),
                    "Identity file not found; secrets are not loaded"
                );
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let outcome = decrypt_all(&document, &identity, true)?;
        if !outcome.skipped.is_empty() {
            warn!(skipped = ?outcome.skipped, "Some secrets are not encrypted for this identity");
        }
        let store: Arc<dyn SecretLookup> = outcome.store;
        Ok(Some(store))
    }
}

/// 組み込みプロバイダーを登録したレジストリ
///
/// 登録はここで一度だけ行い、以降は読み取り専用。
pub fn build_registry() -> anyhow::Result<Arc<Registry>> {
    let mut builder = Registry::builder();
    stackflow_cloud_local::register(&mut builder)?;
    Ok(Arc::new(builder.build()))
}
