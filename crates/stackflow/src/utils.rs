use colored::Colorize;
use stackflow_cloud::{ProvisionError, ProvisionReport, UnitStatus};
use stackflow_core::ActionType;

/// 実行結果を表示
pub fn print_report(report: &ProvisionReport) {
    let mode = if report.preview {
        format!(" {}", "(プレビュー)".yellow())
    } else {
        String::new()
    };
    let version = report
        .version
        .as_deref()
        .map(|v| format!(" @ {}", v.cyan()))
        .unwrap_or_default();
    println!(
        "{} {}/{}{}{}",
        report.operation.to_string().bold(),
        report.stack.cyan(),
        report.environment.cyan(),
        version,
        mode
    );

    for unit in &report.units {
        let status = match &unit.status {
            UnitStatus::Succeeded => "✓ 完了".green().to_string(),
            UnitStatus::Planned => "• 計画".blue().to_string(),
            UnitStatus::Failed { message } => format!("{} {}", "✗ 失敗:".red().bold(), message),
            UnitStatus::Skipped { reason } => format!("{} {}", "- スキップ:".yellow(), reason),
        };
        println!("  {} [{}] {}", unit.name, unit.type_key.dimmed(), status);

        if !report.preview {
            continue;
        }
        if let Some(changeset) = &unit.changeset {
            for action in &changeset.actions {
                let marker = match action.action_type {
                    ActionType::Create => "+".green(),
                    ActionType::Update => "~".yellow(),
                    ActionType::Delete => "-".red(),
                    ActionType::NoOp => "=".dimmed(),
                };
                println!("      {} {}", marker, action.description);
            }
        }
    }
    println!("  {}", report.summary().to_string().dimmed());
}

/// エラーを表示して終了
///
/// 途中まで進んだ操作はレポートも表示する。
pub fn exit_with(err: ProvisionError) -> ! {
    eprintln!();
    if let Some(report) = err.report() {
        print_report(report);
        eprintln!();
    }
    let title = if err.is_preflight() {
        "✗ 実行前に中止しました（変更なし）"
    } else {
        "✗ 実行中に失敗しました"
    };
    eprintln!("{}", title.red().bold());
    eprintln!("  {}", err);
    std::process::exit(1);
}
