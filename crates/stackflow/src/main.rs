mod commands;
mod utils;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "stackflow")]
#[command(about = "スタックを書けば、インフラが立ち、アプリが届く。", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// スタック記述子を検証
    Validate,
    /// 継承を解決したスタックを表示
    Resolve {
        /// スタック名
        stack: String,
        /// 環境名（指定時は環境オーバーライドを適用）
        #[arg(short, long, env = "STACKFLOW_ENV")]
        env: Option<String>,
    },
    /// インフラスタックをプロビジョニング
    Provision {
        /// スタック名（指定しない場合は全インフラスタック）
        stacks: Vec<String>,
        /// プロファイル（環境名）
        #[arg(short, long, env = "STACKFLOW_ENV")]
        env: Option<String>,
        /// 変更内容を表示するだけで適用しない
        #[arg(long)]
        preview: bool,
    },
    /// アプリケーションスタックをデプロイ
    Deploy {
        /// スタック名
        stack: String,
        /// デプロイするバージョン
        #[arg(value_name = "VERSION")]
        release: String,
        /// 環境名
        #[arg(short, long, env = "STACKFLOW_ENV")]
        env: Option<String>,
        /// プルリクエスト番号（PR環境にデプロイ）
        #[arg(long)]
        pr: Option<u64>,
        /// 変更内容を表示するだけで適用しない
        #[arg(long)]
        preview: bool,
    },
    /// 記録済みのリソースを削除
    Destroy {
        /// スタック名
        stack: String,
        /// 環境名
        #[arg(short, long, env = "STACKFLOW_ENV")]
        env: Option<String>,
        /// 削除対象を表示するだけで実行しない
        #[arg(long)]
        preview: bool,
    },
    /// 親スタックを削除（利用中のスタックがあれば拒否）
    DestroyParent {
        /// スタック名
        stack: String,
        /// 環境名
        #[arg(short, long, env = "STACKFLOW_ENV")]
        env: Option<String>,
        /// 利用中のスタックがあっても削除する
        #[arg(long)]
        force: bool,
        /// 削除対象を表示するだけで実行しない
        #[arg(long)]
        preview: bool,
    },
    /// 実行中の操作をキャンセル
    Cancel {
        /// スタック名
        stack: String,
        /// 環境名
        #[arg(short, long, env = "STACKFLOW_ENV")]
        env: Option<String>,
    },
    /// 記録済みの状態を表示
    Status {
        /// スタック名
        stack: String,
        /// 環境名
        #[arg(short, long, env = "STACKFLOW_ENV")]
        env: Option<String>,
    },
    /// シークレット管理
    #[command(subcommand)]
    Secrets(SecretsCommands),
    /// バージョン情報を表示
    Version,
}

#[derive(Subcommand)]
enum SecretsCommands {
    /// age鍵ペアを生成
    Keygen {
        /// 既存の鍵を上書きする
        #[arg(long)]
        force: bool,
    },
    /// シークレット名の一覧
    List,
    /// シークレットを追加（値を省略すると標準入力から読む）
    Add {
        /// シークレット名
        name: String,
        /// 値
        value: Option<String>,
        /// 暗号化先の公開鍵（省略時は既存の受信者、無ければ自分の鍵）
        #[arg(short, long = "recipient")]
        recipients: Vec<String>,
    },
    /// シークレットを難読化して表示
    Get {
        /// シークレット名
        name: String,
    },
    /// シークレットを平文で表示
    Reveal {
        /// シークレット名
        name: String,
    },
    /// シークレットを削除
    Remove {
        /// シークレット名
        name: String,
    },
    /// 受信者を追加し、全シークレットを再暗号化
    AddRecipient {
        /// 追加する公開鍵 (age1...)
        public_key: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ログはstderrに出力（RUST_LOGで制御）
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match cli.command {
        // 設定ファイル不要
        Commands::Version => {
            println!("stackflow {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Secrets(command) => commands::secrets::handle(command)?,
        Commands::Validate => commands::validate::handle()?,
        Commands::Resolve { stack, env } => commands::resolve::handle(&stack, env)?,
        Commands::Provision {
            stacks,
            env,
            preview,
        } => commands::provision::handle(stacks, env, preview).await?,
        Commands::Deploy {
            stack,
            release,
            env,
            pr,
            preview,
        } => commands::deploy::handle(&stack, &release, env, pr, preview).await?,
        Commands::Destroy {
            stack,
            env,
            preview,
        } => commands::destroy::handle(&stack, env, false, false, preview).await?,
        Commands::DestroyParent {
            stack,
            env,
            force,
            preview,
        } => commands::destroy::handle(&stack, env, true, force, preview).await?,
        Commands::Cancel { stack, env } => commands::status::handle_cancel(&stack, env).await?,
        Commands::Status { stack, env } => commands::status::handle(&stack, env).await?,
    }

    Ok(())
}
