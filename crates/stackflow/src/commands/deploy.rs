use super::Context;
use crate::utils::{exit_with, print_report};
use colored::Colorize;
use stackflow_cloud::DeployOptions;

pub async fn handle(
    stack: &str,
    version: &str,
    env: Option<String>,
    pr: Option<u64>,
    preview: bool,
) -> anyhow::Result<()> {
    let ctx = Context::load()?;
    let environment = ctx.environment(env)?;
    let provisioner = ctx.provisioner_with_secrets()?;

    let target = match pr {
        Some(pr) => format!("{} (PR #{})", environment, pr),
        None => environment.clone(),
    };
    println!(
        "{} {} @ {} → {}",
        "デプロイ:".blue(),
        stack.cyan(),
        version.cyan(),
        target.cyan()
    );

    let options = DeployOptions {
        preview,
        pr_number: pr,
    };
    let report = match provisioner.deploy(stack, &environment, version, options).await {
        Ok(report) => report,
        Err(e) => exit_with(e),
    };

    println!();
    print_report(&report);
    println!();
    if preview {
        println!("{}", "プレビューのみ。変更は適用されていません".yellow());
    } else {
        println!("{}", "✓ デプロイ完了".green().bold());
    }
    Ok(())
}
