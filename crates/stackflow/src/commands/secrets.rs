use crate::SecretsCommands;
use colored::Colorize;
use stackflow_config::Settings;
use stackflow_core::discovery::{PROJECT_DIR, SECRETS_FILE};
use stackflow_secrets::{
    AgeIdentity, SecretsDocument, add_recipient, add_secret, obfuscate, read_secret,
    remove_secret,
};
use std::io::Read;
use std::path::PathBuf;

pub fn handle(command: SecretsCommands) -> anyhow::Result<()> {
    let settings = Settings::load()?;

    match command {
        // keygenはプロジェクト不要
        SecretsCommands::Keygen { force } => keygen(&settings, force)?,
        SecretsCommands::List => {
            let (_, document) = open_document()?;
            if document.secrets.is_empty() {
                println!("シークレットはありません");
                return Ok(());
            }
            println!("シークレット: {}個", document.secrets.len());
            for name in document.names() {
                let recipients = document.recipients_of(name).len();
                println!("  - {} ({}人の受信者)", name.cyan(), recipients);
            }
        }
        SecretsCommands::Add {
            name,
            value,
            recipients,
        } => {
            let (path, mut document) = open_document()?;
            let value = match value {
                Some(value) => value,
                None => read_stdin()?,
            };
            let recipients = if !recipients.is_empty() {
                recipients
            } else if !document.recipients().is_empty() {
                document.recipients().into_iter().collect()
            } else {
                vec![load_identity(&settings)?.public_key()]
            };

            add_secret(&mut document, &name, &value, &recipients)?;
            document.save(&path)?;
            println!(
                "{} {} ({}人の受信者)",
                "✓ シークレットを保存しました:".green(),
                name.cyan(),
                recipients.len()
            );
        }
        SecretsCommands::Get { name } => {
            let (_, document) = open_document()?;
            let identity = load_identity(&settings)?;
            let value = read_secret(&document, &identity, &name)?;
            println!("{}", obfuscate(&value));
        }
        SecretsCommands::Reveal { name } => {
            let (_, document) = open_document()?;
            let identity = load_identity(&settings)?;
            let value = read_secret(&document, &identity, &name)?;
            println!("{}", value.as_str());
        }
        SecretsCommands::Remove { name } => {
            let (path, mut document) = open_document()?;
            remove_secret(&mut document, &name)?;
            document.save(&path)?;
            println!("{} {}", "✓ シークレットを削除しました:".green(), name.cyan());
        }
        SecretsCommands::AddRecipient { public_key } => {
            let (path, mut document) = open_document()?;
            let identity = load_identity(&settings)?;
            let added = add_recipient(&mut document, &identity, &public_key)?;
            document.save(&path)?;
            println!(
                "{} {} ({}個のシークレットを再暗号化)",
                "✓ 受信者を追加しました:".green(),
                public_key.cyan(),
                added
            );
        }
    }

    Ok(())
}

fn keygen(settings: &Settings, force: bool) -> anyhow::Result<()> {
    let path = settings.identity_path()?;
    if path.exists() && !force {
        anyhow::bail!(
            "秘密鍵は既に存在します: {}\n上書きする場合は --force を指定してください",
            path.display()
        );
    }
    let identity = AgeIdentity::generate(&path)?;
    println!(
        "{} {}",
        "✓ 秘密鍵を生成しました:".green(),
        path.display().to_string().cyan()
    );
    println!("公開鍵: {}", identity.public_key().bold());
    Ok(())
}

fn load_identity(settings: &Settings) -> anyhow::Result<AgeIdentity> {
    Ok(AgeIdentity::load(&settings.identity_path()?)?)
}

/// プロジェクトのシークレットドキュメント（無ければ空）
fn open_document() -> anyhow::Result<(PathBuf, SecretsDocument)> {
    let root = stackflow_core::find_project_root()?;
    let path = root.join(PROJECT_DIR).join(SECRETS_FILE);
    let document = SecretsDocument::load_or_default(&path)?;
    Ok((path, document))
}

fn read_stdin() -> anyhow::Result<String> {
    let mut value = String::new();
    std::io::stdin().read_to_string(&mut value)?;
    let trimmed = value.trim_end_matches(['\r', '\n']).to_string();
    if trimmed.is_empty() {
        anyhow::bail!("値が空です");
    }
    Ok(trimmed)
}
