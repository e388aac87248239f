use super::Session;
use colored::Colorize;
use std::path::Path;
use uverse_config::keys;
use uverse_core::{ValidateOptions, validate_required_paths};

/// 必須パスを検証して結果を表示する（有効なら true）
pub fn handle(session: &Session) -> anyhow::Result<bool> {
    println!("{}", "必須パスを検証中...".blue());
    println!("基準ディレクトリ: {}", session.base_dir.display().to_string().cyan());
    println!("設定ファイル: {}", session.store.path().display().to_string().cyan());
    println!();

    let config = session.load_config();
    let validation = validate_required_paths(
        &config,
        &ValidateOptions {
            packaged: session.packaged,
        },
    );

    let paths: [(&str, &Path); 4] = [
        (keys::POSTGRES_DIR, &config.paths.postgres_dir),
        (keys::STORE_DIR, &config.paths.store_dir),
        (keys::MODELS_DIR, &config.paths.models_dir),
        (keys::TEMP_DIR, &config.paths.temp_dir),
    ];

    for (key, path) in paths {
        let skipped = key == keys::POSTGRES_DIR && !config.database.embedded;
        match validation.issue(key) {
            Some(issue) => {
                println!("  {} {} {}", "✗".red(), key.bold(), path.display());
                println!("      {}", issue.message.red());
            }
            None if skipped => {
                println!("  {} {} (組み込み PostgreSQL は無効)", "-".dimmed(), key.bold());
            }
            None => println!("  {} {} {}", "✓".green(), key.bold(), path.display()),
        }
    }
    println!();

    if validation.valid {
        println!("{}", "✓ すべてのパスが有効です".green().bold());
    } else {
        eprintln!("{}", "✗ パス設定に問題があります".red().bold());
        eprintln!();
        eprintln!("{}", "ヒント:".yellow());
        eprintln!("  • uverse config set KEY=VALUE でパスを変更できます");
        eprintln!("  • 相対パスは基準ディレクトリからの相対として解決されます");
    }

    Ok(validation.valid)
}
