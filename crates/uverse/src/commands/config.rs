use super::Session;
use anyhow::Context;
use colored::Colorize;
use std::collections::BTreeMap;
use uverse_config::metadata::{is_path_key, lookup};
use uverse_config::ConfigCategory;
use uverse_core::{check_paths, repair_descriptor};

const MASK: &str = "********";

/// 表示時に伏せるキー
fn is_secret(key: &str) -> bool {
    key.ends_with("PASSWORD") || key.ends_with("SECRET_KEY")
}

pub fn handle_show(session: &Session, json: bool) -> anyhow::Result<()> {
    let entries = session.store.entries(&session.base_dir);

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!("設定ファイル: {}", session.store.path().display().to_string().cyan());
    let categories = [
        ConfigCategory::Server,
        ConfigCategory::Database,
        ConfigCategory::Storage,
        ConfigCategory::Logging,
    ];
    for category in categories {
        println!();
        println!("[{}]", category.to_string().bold());
        for entry in entries.iter().filter(|e| e.category == category) {
            let value = if is_secret(&entry.key) {
                MASK.to_string()
            } else {
                entry.value.clone()
            };
            println!("  {} = {}", entry.key.cyan(), value);
            if let Some(description) = &entry.description {
                println!("      {}", description.dimmed());
            }
        }
    }
    Ok(())
}

/// `KEY=VALUE` の一覧を解釈する
fn parse_pairs(pairs: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("KEY=VALUE 形式ではありません: {}", pair))?;
            Ok((key.trim().to_string(), value.to_string()))
        })
        .collect()
}

/// 設定を保存する（パスチェックに失敗したら false）
pub fn handle_set(session: &Session, pairs: &[String]) -> anyhow::Result<bool> {
    let changes = parse_pairs(pairs)?;

    for key in changes.keys() {
        if lookup(key).is_none() {
            println!("{} {} は既知の設定項目ではありません（そのまま保存します）", "⚠".yellow(), key);
        }
    }

    let path_changes: BTreeMap<String, String> = changes
        .iter()
        .filter(|(key, _)| is_path_key(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    let report = check_paths(&path_changes, &session.base_dir);
    if !report.valid {
        eprintln!("{}", "✗ パスの確認に失敗したため保存しませんでした".red().bold());
        for (key, message) in &report.errors {
            eprintln!("  {}: {}", key.bold(), message);
        }
        return Ok(false);
    }

    session.store.update(&changes)?;
    println!(
        "{} {}",
        "✓ 設定を保存しました:".green(),
        session.store.path().display()
    );
    for key in changes.keys() {
        println!("  {}", key.cyan());
    }

    let config = session.load_config();
    match repair_descriptor(&config.paths.models_dir) {
        Ok(true) => println!("{}", "✓ mineru.json を更新しました".green()),
        Ok(false) => {}
        Err(e) => tracing::debug!("Model descriptor repair skipped: {}", e),
    }

    Ok(true)
}
