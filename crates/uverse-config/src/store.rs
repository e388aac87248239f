//! 設定ファイル（`.env`）の保存先管理と書き換え
//!
//! 書き換え時はコメント・インデント・行末コメントを保持する。

use crate::env_file::{self, is_valid_key, split_assignment};
use crate::error::{ConfigError, Result};
use crate::metadata::{CONFIG_METADATA, ConfigCategory};
use crate::resolved::ResolvedConfig;
use crate::ENV_FILE_NAME;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// UI に返す設定項目1件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
    pub description: Option<String>,
    pub category: ConfigCategory,
}

/// `.env` ファイルの保存先
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// 使用する `.env` を決定する
    ///
    /// パッケージ版:
    /// - ユーザーデータディレクトリの `.env` を使う
    /// - 初回起動時は同梱の `<base>/.env` をコピーする
    ///
    /// 開発版:
    /// 1. `<base>/.env` が存在すればそれ
    /// 2. ユーザーデータディレクトリの `.env` が存在すればそれ
    /// 3. どちらもなければ `<base>/.env`（保存時に作成される）
    pub fn locate(data_dir: &Path, base_dir: &Path, packaged: bool) -> Self {
        let user_file = data_dir.join(ENV_FILE_NAME);
        let bundled = base_dir.join(ENV_FILE_NAME);

        if packaged {
            if !user_file.exists() && bundled.is_file() {
                match std::fs::copy(&bundled, &user_file) {
                    Ok(_) => tracing::info!(
                        "Copied bundled config {} -> {}",
                        bundled.display(),
                        user_file.display()
                    ),
                    Err(e) => tracing::warn!(
                        "Failed to copy bundled config to {}: {}",
                        user_file.display(),
                        e
                    ),
                }
            }
            return Self::new(user_file);
        }

        if bundled.exists() {
            Self::new(bundled)
        } else if user_file.exists() {
            Self::new(user_file)
        } else {
            Self::new(bundled)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// ファイルの生の内容（存在しなければ空）
    pub fn read(&self) -> env_file::EnvFile {
        env_file::EnvFile::read(&self.path).unwrap_or_default()
    }

    /// 設定を読み込んで解決する
    pub fn load(&self, base_dir: &Path) -> ResolvedConfig {
        ResolvedConfig::load(&self.path, base_dir)
    }

    /// ホワイトリストの設定項目を表示順に列挙する
    ///
    /// ファイルに無いキーはデフォルト値で補う。
    pub fn entries(&self, base_dir: &Path) -> Vec<ConfigEntry> {
        let raw = self.read();
        let resolved = ResolvedConfig::resolve(&raw, base_dir);

        CONFIG_METADATA
            .iter()
            .map(|meta| {
                let value = match raw.get(meta.key) {
                    Some(v) if !v.trim().is_empty() => v.to_string(),
                    _ => resolved.value_of(meta.key).unwrap_or_default(),
                };
                ConfigEntry {
                    key: meta.key.to_string(),
                    value,
                    description: Some(meta.description.to_string()),
                    category: meta.category,
                }
            })
            .collect()
    }

    /// 値を書き換える
    ///
    /// 既存の行はその場で置き換え、無いキーは末尾に追加する。
    /// 書き込みが成功するまでファイルは変更されない。
    pub fn update(&self, changes: &BTreeMap<String, String>) -> Result<()> {
        if let Some(bad) = changes.keys().find(|k| !is_valid_key(k)) {
            return Err(ConfigError::InvalidKey(bad.clone()));
        }
        // 改行を含む値は行を分割して別のキーを作れてしまう
        if let Some((key, _)) = changes.iter().find(|(_, v)| v.contains(['\r', '\n'])) {
            return Err(ConfigError::InvalidValue(key.clone()));
        }

        let original = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let updated = apply_changes(&original, changes);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteFailed {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        std::fs::write(&self.path, updated).map_err(|source| ConfigError::WriteFailed {
            path: self.path.clone(),
            source,
        })?;

        tracing::info!(
            "Updated {} key(s) in {}",
            changes.len(),
            self.path.display()
        );
        Ok(())
    }
}

/// テキストに変更を適用する
fn apply_changes(original: &str, changes: &BTreeMap<String, String>) -> String {
    let newline = if original.contains("\r\n") { "\r\n" } else { "\n" };
    let mut written = std::collections::BTreeSet::new();

    let mut out = String::with_capacity(original.len() + 64);
    for line in original.lines() {
        // 同じキーが複数行にある場合はすべて書き換える（読み込みは後勝ち）
        let replaced = split_assignment(line).and_then(|parts| {
            let value = changes.get(parts.key)?;
            written.insert(parts.key.to_string());
            Some(format!(
                "{}{}={}{}",
                parts.prefix,
                parts.key,
                env_file::quote_value(value),
                env_file::trailing_comment(parts.rest)
            ))
        });
        match replaced {
            Some(l) => out.push_str(&l),
            None => out.push_str(line),
        }
        out.push_str(newline);
    }

    for (key, value) in changes.iter().filter(|(k, _)| !written.contains(*k)) {
        out.push_str(&format!("{}={}{}", key, env_file::quote_value(value), newline));
    }
    out
}
