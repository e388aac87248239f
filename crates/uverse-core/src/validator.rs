//! 必須パスの検証
//!
//! サービス起動前に各ディレクトリと実行ファイルの存在を確認する。
//! モデルディレクトリが有効な場合は `mineru.json` の修復も行う。

use crate::descriptor::{self, ModelDescriptor};
use serde::Serialize;
use std::collections::BTreeMap;
use std::env::consts::EXE_SUFFIX;
use std::path::{Path, PathBuf};
use uverse_config::{ResolvedConfig, keys, resolve_path};

/// 検証オプション
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidateOptions {
    /// パッケージ版として実行中か（ストレージディレクトリを自動作成しない）
    pub packaged: bool,
}

/// 検証エラー1件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathIssue {
    pub key: String,
    pub message: String,
}

/// 起動前検証の結果
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct PathValidation {
    pub valid: bool,
    pub errors: Vec<PathIssue>,
}

impl PathValidation {
    /// エラーメッセージを1行にまとめる
    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| format!("{}: {}", e.key, e.message))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn issue(&self, key: &str) -> Option<&PathIssue> {
        self.errors.iter().find(|e| e.key == key)
    }
}

/// 保存前チェックの結果（キーごとのエラー）
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct PathCheckReport {
    pub valid: bool,
    pub errors: BTreeMap<String, String>,
}

/// 起動前に必須パスを検証する
///
/// - PostgreSQL: `bin/pg_ctl` があること（組み込み DB 無効時はスキップ）
/// - ストレージ: `rustfs` 実行ファイルがあること（開発版はディレクトリを自動作成）
/// - モデル: `mineru.json` と pipeline モデルが有効であること
/// - 一時ディレクトリ: 可能なら作成する
pub fn validate_required_paths(config: &ResolvedConfig, options: &ValidateOptions) -> PathValidation {
    let mut errors = Vec::new();
    let mut push = |key: &str, message: String| {
        tracing::warn!("Path check failed for {}: {}", key, message);
        errors.push(PathIssue {
            key: key.to_string(),
            message,
        });
    };

    if config.database.embedded {
        if let Err(message) = check_postgres_dir(&config.paths.postgres_dir) {
            push(keys::POSTGRES_DIR, message);
        }
    } else {
        tracing::debug!("Embedded PostgreSQL disabled, skipping POSTGRES_DIR check");
    }

    let store_dir = &config.paths.store_dir;
    if !options.packaged && !store_dir.exists() {
        match std::fs::create_dir_all(store_dir) {
            Ok(()) => tracing::info!("Created store directory {}", store_dir.display()),
            Err(e) => tracing::warn!("Failed to create {}: {}", store_dir.display(), e),
        }
    }
    if let Err(message) = check_store_dir(store_dir) {
        push(keys::STORE_DIR, message);
    }

    let models_dir = &config.paths.models_dir;
    match check_models_dir(models_dir) {
        Ok(()) => {
            // 修復の失敗は検証結果に影響させない
            if let Err(e) = descriptor::repair_descriptor(models_dir) {
                tracing::warn!("Model descriptor repair failed: {}", e);
            }
        }
        Err(message) => push(keys::MODELS_DIR, message),
    }

    let temp_dir = &config.paths.temp_dir;
    if !temp_dir.exists() {
        if let Err(e) = std::fs::create_dir_all(temp_dir) {
            tracing::warn!("Failed to create temp directory {}: {}", temp_dir.display(), e);
        }
    }

    PathValidation {
        valid: errors.is_empty(),
        errors,
    }
}

/// 保存前のパス設定をチェックする
///
/// ディレクトリの作成や `mineru.json` の書き換えは行わない。
/// パス以外のキーは無視する。
pub fn check_paths(candidates: &BTreeMap<String, String>, base_dir: &Path) -> PathCheckReport {
    let mut errors = BTreeMap::new();

    for (key, value) in candidates {
        let check: fn(&Path) -> Result<(), String> = match key.as_str() {
            keys::POSTGRES_DIR => check_postgres_dir,
            keys::STORE_DIR => check_store_dir,
            keys::MODELS_DIR => check_models_dir,
            keys::TEMP_DIR => check_temp_dir,
            _ => continue,
        };

        if value.trim().is_empty() {
            errors.insert(key.clone(), "パスが設定されていません".to_string());
            continue;
        }

        let path = resolve_path(Some(value), "", base_dir);
        if let Err(message) = check(&path) {
            errors.insert(key.clone(), message);
        }
    }

    PathCheckReport {
        valid: errors.is_empty(),
        errors,
    }
}

fn require_dir(dir: &Path, label: &str) -> Result<(), String> {
    if !dir.exists() {
        return Err(format!("{}が存在しません: {}", label, dir.display()));
    }
    if !dir.is_dir() {
        return Err(format!("{}がディレクトリではありません: {}", label, dir.display()));
    }
    Ok(())
}

/// `<dir>/bin/pg_ctl` の場所
pub fn pg_ctl_path(postgres_dir: &Path) -> PathBuf {
    postgres_dir.join("bin").join(format!("pg_ctl{EXE_SUFFIX}"))
}

/// `<dir>/rustfs` の場所
pub fn rustfs_path(store_dir: &Path) -> PathBuf {
    store_dir.join(format!("rustfs{EXE_SUFFIX}"))
}

fn check_postgres_dir(dir: &Path) -> Result<(), String> {
    require_dir(dir, "PostgreSQL ディレクトリ")?;
    let pg_ctl = pg_ctl_path(dir);
    if !pg_ctl.is_file() {
        return Err(format!("pg_ctl が見つかりません: {}", pg_ctl.display()));
    }
    Ok(())
}

fn check_store_dir(dir: &Path) -> Result<(), String> {
    require_dir(dir, "ストレージディレクトリ")?;
    let rustfs = rustfs_path(dir);
    if !rustfs.is_file() {
        return Err(format!("rustfs 実行ファイルが見つかりません: {}", rustfs.display()));
    }
    Ok(())
}

fn check_models_dir(dir: &Path) -> Result<(), String> {
    require_dir(dir, "モデルディレクトリ")?;

    let descriptor = ModelDescriptor::load(dir).map_err(|e| e.to_string())?;
    let pipeline = descriptor
        .effective_pipeline(dir)
        .ok_or_else(|| "mineru.json に models-dir.pipeline が設定されていません".to_string())?;

    require_dir(&pipeline, "pipeline モデルディレクトリ")?;
    let is_empty = std::fs::read_dir(&pipeline)
        .map(|mut entries| entries.next().is_none())
        .map_err(|e| format!("pipeline モデルディレクトリを読み込めません: {}: {}", pipeline.display(), e))?;
    if is_empty {
        return Err(format!("pipeline モデルディレクトリが空です: {}", pipeline.display()));
    }
    Ok(())
}

fn check_temp_dir(dir: &Path) -> Result<(), String> {
    require_dir(dir, "一時ディレクトリ")
}
