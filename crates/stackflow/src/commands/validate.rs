use super::build_registry;
use colored::Colorize;
use stackflow_core::StackKind;

pub fn handle() -> anyhow::Result<()> {
    println!("{}", "スタック記述子を検証中...".blue());

    // プロジェクトルートを検出
    let project_root = match stackflow_core::find_project_root() {
        Ok(root) => root,
        Err(e) => {
            eprintln!();
            eprintln!("{}", "✗ プロジェクトルートが見つかりません".red().bold());
            eprintln!("  {}", e);
            eprintln!();
            eprintln!(".stackflow/ が存在するディレクトリで実行してください");
            std::process::exit(1);
        }
    };
    println!(
        "プロジェクトルート: {}",
        project_root.display().to_string().cyan()
    );

    let registry = build_registry()?;
    let project = match stackflow_core::load_project_from_root(&project_root, &registry) {
        Ok(project) => project,
        Err(e) => {
            eprintln!();
            eprintln!("{}", "✗ 設定エラー".red().bold());
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    };

    // 継承チェーンの循環や親の種類も解決して確認
    let mut errors = Vec::new();
    for stack in project.stacks.iter() {
        if let Err(e) = stackflow_core::resolve(&stack.name, &project.stacks) {
            errors.push(e);
        }
    }
    if !errors.is_empty() {
        eprintln!();
        eprintln!("{}", "✗ 設定エラー".red().bold());
        for e in &errors {
            eprintln!("  {}", e);
        }
        std::process::exit(1);
    }

    println!("{}", "✓ スタック記述子は正常です！".green().bold());
    println!();
    println!("サマリー:");
    println!("  スタック: {}個", project.stacks.len());
    for stack in project.stacks.iter() {
        let parent = stack
            .parent
            .as_deref()
            .map(|p| format!(", 親: {}", p))
            .unwrap_or_default();
        match stack.kind {
            StackKind::Infrastructure => println!(
                "    - {} (インフラ, {}個のリソース{})",
                stack.name.cyan(),
                stack.resources.len(),
                parent
            ),
            StackKind::Application => println!(
                "    - {} ({}{})",
                stack.name.cyan(),
                stack.stack_type,
                parent
            ),
        }
    }
    if let Some(secrets) = &project.files.secrets {
        println!(
            "  シークレット: {}",
            secrets.display().to_string().cyan()
        );
    }

    Ok(())
}
