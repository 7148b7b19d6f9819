use super::build_registry;
use colored::Colorize;

/// 継承解決済みのスタックを表示（プレースホルダーは未展開のまま）
pub fn handle(stack: &str, env: Option<String>) -> anyhow::Result<()> {
    let registry = build_registry()?;
    let project = stackflow_core::load_project(&registry)?;

    let merged = match env.as_deref() {
        Some(env) => stackflow_core::resolve_for_environment(stack, env, &project.stacks)?,
        None => stackflow_core::resolve(stack, &project.stacks)?,
    };

    println!("{}: {}", "スタック".bold(), merged.name.cyan());
    println!("  種類: {}", merged.kind);
    match &merged.template {
        Some(template) => println!("  タイプ: {} ({})", template, merged.type_key),
        None => println!("  タイプ: {}", merged.type_key),
    }
    if let Some(environment) = &merged.environment {
        println!("  環境: {}", environment.cyan());
    }
    println!("  継承: {}", merged.chain.join(" → "));

    if !merged.resources.is_empty() {
        println!("  リソース:");
        for resource in &merged.resources {
            println!("    - {} [{}]", resource.name.cyan(), resource.type_key);
        }
    }
    if !merged.uses.is_empty() {
        println!("  利用リソース:");
        for resource in &merged.uses {
            println!(
                "    - {} [{}] ({})",
                resource.name.cyan(),
                resource.type_key,
                resource.owner
            );
        }
    }
    if !merged.auth.is_empty() {
        let providers: Vec<&str> = merged.auth.keys().collect();
        println!("  認証: {}", providers.join(", "));
    }

    println!("  設定:");
    let yaml = serde_yaml::to_string(&merged.config)?;
    for line in yaml.lines() {
        println!("    {}", line);
    }

    Ok(())
}
