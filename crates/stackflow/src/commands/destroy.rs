use super::Context;
use crate::utils::{exit_with, print_report};
use colored::Colorize;

/// `destroy` と `destroy-parent` の共通処理
pub async fn handle(
    stack: &str,
    env: Option<String>,
    parent: bool,
    force: bool,
    preview: bool,
) -> anyhow::Result<()> {
    let ctx = Context::load()?;
    let environment = ctx.environment(env)?;
    // 削除時は記録済みテンプレートを再置換するため、シークレットが必要
    let provisioner = if preview {
        ctx.provisioner()
    } else {
        ctx.provisioner_with_secrets()?
    };

    println!(
        "{} {} ({})",
        "削除:".red(),
        stack.cyan(),
        environment.cyan()
    );

    let result = if parent {
        provisioner
            .destroy_parent(stack, &environment, force, preview)
            .await
    } else {
        provisioner.destroy(stack, &environment, preview).await
    };
    let report = match result {
        Ok(report) => report,
        Err(e) => exit_with(e),
    };

    println!();
    if report.units.is_empty() {
        println!("{}", "削除するリソースはありません".dimmed());
        return Ok(());
    }
    print_report(&report);
    println!();
    if preview {
        println!("{}", "プレビューのみ。何も削除されていません".yellow());
    } else {
        println!("{}", "✓ 削除完了".green().bold());
    }
    Ok(())
}
