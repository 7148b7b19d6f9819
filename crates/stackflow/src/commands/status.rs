use super::Context;
use colored::Colorize;
use stackflow_cloud::ProvisionStatus;

/// 記録済みの状態を表示
pub async fn handle(stack: &str, env: Option<String>) -> anyhow::Result<()> {
    let ctx = Context::load()?;
    let environment = ctx.environment(env)?;
    let provisioner = ctx.provisioner();

    let state = provisioner.state(stack, &environment).await?;
    let status = match state.status {
        ProvisionStatus::Succeeded => state.status.to_string().green(),
        ProvisionStatus::Failed | ProvisionStatus::Cancelled => state.status.to_string().red(),
        ProvisionStatus::Planning | ProvisionStatus::Applying => {
            state.status.to_string().yellow()
        }
        ProvisionStatus::Idle => state.status.to_string().dimmed(),
    };

    println!("{}/{}", stack.cyan(), environment.cyan());
    println!("  状態: {} (リビジョン {})", status, state.revision);
    if let Some(version) = &state.last_applied_version {
        println!("  バージョン: {}", version.cyan());
    }
    if let Some(updated_at) = state.updated_at {
        println!("  更新日時: {}", updated_at.to_rfc3339());
    }
    if let Some(lock) = &state.lock {
        println!(
            "  {} {} ({}, {})",
            "ロック中:".yellow(),
            lock.owner,
            lock.operation,
            lock.acquired_at.to_rfc3339()
        );
    }
    if state.cancel_requested {
        println!("  {}", "キャンセル要求済み".yellow());
    }

    if state.resources.is_empty() {
        println!("  リソース: なし");
    } else {
        println!("  リソース: {}個", state.resources.len());
        for (name, resource) in &state.resources {
            println!("    - {} [{}]", name.cyan(), resource.type_key);
        }
    }
    Ok(())
}

/// 実行中の操作にキャンセルを要求
pub async fn handle_cancel(stack: &str, env: Option<String>) -> anyhow::Result<()> {
    let ctx = Context::load()?;
    let environment = ctx.environment(env)?;
    let provisioner = ctx.provisioner();

    if provisioner.cancel(stack, &environment).await? {
        println!(
            "{} {}/{}",
            "✓ キャンセルを要求しました:".green(),
            stack.cyan(),
            environment.cyan()
        );
        println!("  適用中のリソースは完了を待ち、以降のリソースはスキップされます");
    } else {
        println!(
            "{}/{} で実行中の操作はありません",
            stack.cyan(),
            environment.cyan()
        );
    }
    Ok(())
}
