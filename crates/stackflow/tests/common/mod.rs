use assert_cmd::Command;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// `.stackflow/` を持つ一時プロジェクトと、専用のユーザー設定
pub struct TestProject {
    pub root: TempDir,
    pub home: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join(".stackflow/stacks")).unwrap();

        let home = tempfile::tempdir().unwrap();
        let settings = format!(
            "identity_file: {}\nowner: cli-test\nretry:\n  max_attempts: 1\n",
            home.path().join("identity.txt").display()
        );
        fs::write(home.path().join("config.yaml"), settings).unwrap();

        Self { root, home }
    }

    pub fn write_stack(&self, name: &str, content: &str) {
        let path = self
            .root
            .path()
            .join(".stackflow/stacks")
            .join(format!("{}.yaml", name));
        fs::write(path, content).unwrap();
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    #[allow(dead_code)]
    pub fn state_file(&self, stack: &str, environment: &str) -> PathBuf {
        self.root
            .path()
            .join(".stackflow/state")
            .join(stack)
            .join(format!("{}.json", environment))
    }

    #[allow(dead_code)]
    pub fn secrets_file(&self) -> PathBuf {
        self.root.path().join(".stackflow/secrets.yaml")
    }

    /// プロジェクトと設定を環境変数で固定したコマンド
    #[allow(deprecated)]
    pub fn command(&self) -> Command {
        let mut cmd = Command::cargo_bin("stackflow").unwrap();
        cmd.current_dir(self.root.path())
            .env("STACKFLOW_PROJECT_ROOT", self.root.path())
            .env("STACKFLOW_CONFIG_PATH", self.home.path().join("config.yaml"))
            .env_remove("STACKFLOW_ENV")
            .env_remove("RUST_LOG");
        cmd
    }
}
