use super::Context;
use crate::utils::{exit_with, print_report};
use colored::Colorize;
use stackflow_cloud::ProvisionOptions;

pub async fn handle(stacks: Vec<String>, env: Option<String>, preview: bool) -> anyhow::Result<()> {
    let ctx = Context::load()?;
    let profile = ctx.environment(env)?;
    let provisioner = ctx.provisioner_with_secrets()?;

    let target = if stacks.is_empty() {
        "全インフラスタック".to_string()
    } else {
        stacks.join(", ")
    };
    println!(
        "{} {} ({})",
        "プロビジョニング:".blue(),
        target.cyan(),
        profile.cyan()
    );

    let reports = match provisioner
        .provision(&stacks, &profile, ProvisionOptions { preview })
        .await
    {
        Ok(reports) => reports,
        Err(e) => exit_with(e),
    };

    for report in &reports {
        println!();
        print_report(report);
    }
    println!();
    if preview {
        println!("{}", "プレビューのみ。変更は適用されていません".yellow());
    } else {
        println!("{}", "✓ プロビジョニング完了".green().bold());
    }
    Ok(())
}
