//! 設定キーのメタデータ（カテゴリ・説明）
//!
//! UI に公開する設定項目のホワイトリストを兼ねる。

use serde::{Deserialize, Serialize};

/// 設定キー名
pub mod keys {
    pub const PORT: &str = "PORT";

    pub const POSTGRES_DIR: &str = "POSTGRES_DIR";
    pub const STORE_DIR: &str = "STORE_DIR";
    pub const MODELS_DIR: &str = "MODELS_DIR";
    pub const TEMP_DIR: &str = "TEMP_DIR";

    pub const USE_EMBEDDED_PG: &str = "USE_EMBEDDED_PG";
    pub const DATABASE_HOST: &str = "DATABASE_HOST";
    pub const DATABASE_PORT: &str = "DATABASE_PORT";
    pub const DATABASE_USER: &str = "DATABASE_USER";
    pub const DATABASE_PASSWORD: &str = "DATABASE_PASSWORD";
    pub const DATABASE_NAME: &str = "DATABASE_NAME";

    pub const RUSTFS_PORT: &str = "RUSTFS_PORT";
    pub const RUSTFS_CONSOLE_PORT: &str = "RUSTFS_CONSOLE_PORT";
    pub const RUSTFS_CONSOLE_ENABLE: &str = "RUSTFS_CONSOLE_ENABLE";
    pub const RUSTFS_ACCESS_KEY: &str = "RUSTFS_ACCESS_KEY";
    pub const RUSTFS_SECRET_KEY: &str = "RUSTFS_SECRET_KEY";
    pub const RUSTFS_REGION: &str = "RUSTFS_REGION";

    pub const DEBUG: &str = "DEBUG";
    pub const LOG_LEVEL: &str = "LOG_LEVEL";
}

/// パス型の設定キー（事前チェックの対象）
pub const PATH_KEYS: [&str; 4] = [
    keys::POSTGRES_DIR,
    keys::STORE_DIR,
    keys::MODELS_DIR,
    keys::TEMP_DIR,
];

/// 設定カテゴリ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigCategory {
    Server,
    Database,
    Storage,
    Logging,
}

impl std::fmt::Display for ConfigCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigCategory::Server => write!(f, "server"),
            ConfigCategory::Database => write!(f, "database"),
            ConfigCategory::Storage => write!(f, "storage"),
            ConfigCategory::Logging => write!(f, "logging"),
        }
    }
}

/// 設定キー1件分のメタデータ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigKeyMeta {
    pub key: &'static str,
    pub category: ConfigCategory,
    pub description: &'static str,
}

const fn meta(
    key: &'static str,
    category: ConfigCategory,
    description: &'static str,
) -> ConfigKeyMeta {
    ConfigKeyMeta {
        key,
        category,
        description,
    }
}

/// UI に公開する設定項目（表示順）
pub const CONFIG_METADATA: &[ConfigKeyMeta] = &[
    meta(keys::PORT, ConfigCategory::Server, "バックエンドサービスのポート"),
    meta(
        keys::POSTGRES_DIR,
        ConfigCategory::Server,
        "PostgreSQL ディレクトリ (bin/pg_ctl を含むこと)",
    ),
    meta(
        keys::STORE_DIR,
        ConfigCategory::Server,
        "ストレージディレクトリ (rustfs 実行ファイルを含むこと)",
    ),
    meta(
        keys::MODELS_DIR,
        ConfigCategory::Server,
        "モデルディレクトリ (mineru.json と OpenDataLab/ を含むこと)",
    ),
    meta(keys::TEMP_DIR, ConfigCategory::Server, "一時ファイルディレクトリ"),
    meta(
        keys::USE_EMBEDDED_PG,
        ConfigCategory::Database,
        "組み込み PostgreSQL を使用する（false の場合は外部データベースに接続）",
    ),
    meta(keys::DATABASE_HOST, ConfigCategory::Database, "データベースホスト"),
    meta(
        keys::DATABASE_PORT,
        ConfigCategory::Database,
        "データベースポート（組み込みのデフォルトは 15432）",
    ),
    meta(keys::DATABASE_USER, ConfigCategory::Database, "データベースユーザー名"),
    meta(
        keys::DATABASE_PASSWORD,
        ConfigCategory::Database,
        "データベースパスワード",
    ),
    meta(keys::DATABASE_NAME, ConfigCategory::Database, "データベース名"),
    meta(keys::RUSTFS_PORT, ConfigCategory::Storage, "RustFS データポート"),
    meta(
        keys::RUSTFS_CONSOLE_PORT,
        ConfigCategory::Storage,
        "RustFS コンソールポート",
    ),
    meta(
        keys::RUSTFS_CONSOLE_ENABLE,
        ConfigCategory::Storage,
        "RustFS コンソールを有効にする",
    ),
    meta(keys::RUSTFS_ACCESS_KEY, ConfigCategory::Storage, "RustFS アクセスキー"),
    meta(
        keys::RUSTFS_SECRET_KEY,
        ConfigCategory::Storage,
        "RustFS シークレットキー",
    ),
    meta(keys::RUSTFS_REGION, ConfigCategory::Storage, "RustFS リージョン"),
    meta(keys::DEBUG, ConfigCategory::Logging, "デバッグモード"),
    meta(
        keys::LOG_LEVEL,
        ConfigCategory::Logging,
        "ログレベル (error, warn, info, debug, trace)",
    ),
];

/// キーのメタデータを取得
pub fn lookup(key: &str) -> Option<&'static ConfigKeyMeta> {
    CONFIG_METADATA.iter().find(|m| m.key == key)
}

pub fn is_path_key(key: &str) -> bool {
    PATH_KEYS.contains(&key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_path_key_has_metadata() {
        for key in PATH_KEYS {
            let meta = lookup(key).expect("path key must be listed");
            assert_eq!(meta.category, ConfigCategory::Server);
        }
    }

    #[test]
    fn test_metadata_keys_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for m in CONFIG_METADATA {
            assert!(seen.insert(m.key), "duplicate key {}", m.key);
        }
    }

    #[test]
    fn test_unknown_key_has_no_metadata() {
        assert!(lookup("MINERU_DEVICE").is_none());
        assert!(!is_path_key("PORT"));
        assert!(is_path_key("MODELS_DIR"));
    }
}
