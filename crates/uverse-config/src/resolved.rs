//! 設定の解決
//!
//! `.env` の値と組み込みデフォルトから [`ResolvedConfig`] を構築する。
//! パス系の設定はここで必ず絶対パスに解決される。

use crate::env_file::EnvFile;
use crate::metadata::{CONFIG_METADATA, keys};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_BACKEND_PORT: u16 = 8000;
pub const DEFAULT_DATABASE_PORT: u16 = 15432;
pub const DEFAULT_RUSTFS_PORT: u16 = 9000;
pub const DEFAULT_RUSTFS_CONSOLE_PORT: u16 = 9001;

pub const DEFAULT_POSTGRES_DIR_NAME: &str = "postgres";
pub const DEFAULT_STORE_DIR_NAME: &str = "store";
pub const DEFAULT_MODELS_DIR_NAME: &str = "models";
pub const DEFAULT_TEMP_DIR_NAME: &str = "temp";

/// 解決済みの設定（1回の監視セッションの唯一の情報源）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedConfig {
    /// 相対パス解決の基準ディレクトリ
    pub base_dir: PathBuf,
    pub ports: Ports,
    pub database: DatabaseSettings,
    pub object_store: ObjectStoreSettings,
    pub paths: ServicePaths,
    pub debug: bool,
    pub log_level: String,
    /// 認識しないキー（バックエンドの環境変数としてそのまま渡す）
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ports {
    pub backend: u16,
    pub database: u16,
    pub object_store: u16,
    pub object_store_console: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseSettings {
    /// 組み込み PostgreSQL を監視対象にするか
    pub embedded: bool,
    pub host: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub name: String,
}

impl DatabaseSettings {
    /// バックエンド向けの接続 URL
    pub fn connection_url(&self, port: u16) -> String {
        format!(
            "postgresql+asyncpg://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, port, self.name
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectStoreSettings {
    pub access_key: String,
    #[serde(skip_serializing)]
    pub secret_key: String,
    pub region: String,
    pub console_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServicePaths {
    pub postgres_dir: PathBuf,
    pub store_dir: PathBuf,
    pub models_dir: PathBuf,
    pub temp_dir: PathBuf,
}

impl ResolvedConfig {
    /// すべてデフォルト値の設定
    pub fn defaults(base_dir: &Path) -> Self {
        Self::resolve(&EnvFile::new(), base_dir)
    }

    /// 設定ファイルを読み込んで解決する
    ///
    /// ファイルが存在しない・読めない場合もエラーにせず、デフォルトを使う。
    pub fn load(path: &Path, base_dir: &Path) -> Self {
        match EnvFile::read(path) {
            Some(env) => Self::resolve(&env, base_dir),
            None => {
                tracing::info!(
                    "No config at {}, using built-in defaults",
                    path.display()
                );
                Self::defaults(base_dir)
            }
        }
    }

    /// `.env` の値にデフォルトを補って解決する（純粋関数）
    pub fn resolve(env: &EnvFile, base_dir: &Path) -> Self {
        let text = |key: &str, default: &str| -> String {
            env.get(key)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .unwrap_or(default)
                .to_string()
        };
        let port = |key: &str, default: u16| parse_port(env.get(key), default);
        let flag = |key: &str, default: bool| parse_bool(env.get(key), default);
        let path = |key: &str, default_name: &str| resolve_path(env.get(key), default_name, base_dir);

        let extra = env
            .iter()
            .filter(|(k, _)| !is_recognized(k))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Self {
            base_dir: base_dir.to_path_buf(),
            ports: Ports {
                backend: port(keys::PORT, DEFAULT_BACKEND_PORT),
                database: port(keys::DATABASE_PORT, DEFAULT_DATABASE_PORT),
                object_store: port(keys::RUSTFS_PORT, DEFAULT_RUSTFS_PORT),
                object_store_console: port(keys::RUSTFS_CONSOLE_PORT, DEFAULT_RUSTFS_CONSOLE_PORT),
            },
            database: DatabaseSettings {
                embedded: flag(keys::USE_EMBEDDED_PG, true),
                host: text(keys::DATABASE_HOST, "127.0.0.1"),
                user: text(keys::DATABASE_USER, "postgres"),
                password: text(keys::DATABASE_PASSWORD, "postgres"),
                name: text(keys::DATABASE_NAME, "knowledge_base"),
            },
            object_store: ObjectStoreSettings {
                access_key: text(keys::RUSTFS_ACCESS_KEY, "rustfsadmin"),
                secret_key: text(keys::RUSTFS_SECRET_KEY, "rustfsadmin"),
                region: text(keys::RUSTFS_REGION, "us-east-1"),
                console_enabled: flag(keys::RUSTFS_CONSOLE_ENABLE, false),
            },
            paths: ServicePaths {
                postgres_dir: path(keys::POSTGRES_DIR, DEFAULT_POSTGRES_DIR_NAME),
                store_dir: path(keys::STORE_DIR, DEFAULT_STORE_DIR_NAME),
                models_dir: path(keys::MODELS_DIR, DEFAULT_MODELS_DIR_NAME),
                temp_dir: path(keys::TEMP_DIR, DEFAULT_TEMP_DIR_NAME),
            },
            debug: flag(keys::DEBUG, false),
            log_level: text(keys::LOG_LEVEL, "info").to_lowercase(),
            extra,
        }
    }

    /// 認識済みキーの現在値を文字列で返す（UI 表示用）
    pub fn value_of(&self, key: &str) -> Option<String> {
        let value = match key {
            keys::PORT => self.ports.backend.to_string(),
            keys::DATABASE_PORT => self.ports.database.to_string(),
            keys::RUSTFS_PORT => self.ports.object_store.to_string(),
            keys::RUSTFS_CONSOLE_PORT => self.ports.object_store_console.to_string(),
            keys::USE_EMBEDDED_PG => self.database.embedded.to_string(),
            keys::DATABASE_HOST => self.database.host.clone(),
            keys::DATABASE_USER => self.database.user.clone(),
            keys::DATABASE_PASSWORD => self.database.password.clone(),
            keys::DATABASE_NAME => self.database.name.clone(),
            keys::RUSTFS_ACCESS_KEY => self.object_store.access_key.clone(),
            keys::RUSTFS_SECRET_KEY => self.object_store.secret_key.clone(),
            keys::RUSTFS_REGION => self.object_store.region.clone(),
            keys::RUSTFS_CONSOLE_ENABLE => self.object_store.console_enabled.to_string(),
            keys::POSTGRES_DIR => self.paths.postgres_dir.display().to_string(),
            keys::STORE_DIR => self.paths.store_dir.display().to_string(),
            keys::MODELS_DIR => self.paths.models_dir.display().to_string(),
            keys::TEMP_DIR => self.paths.temp_dir.display().to_string(),
            keys::DEBUG => self.debug.to_string(),
            keys::LOG_LEVEL => self.log_level.clone(),
            other => return self.extra.get(other).cloned(),
        };
        Some(value)
    }
}

fn is_recognized(key: &str) -> bool {
    CONFIG_METADATA.iter().any(|m| m.key == key)
}

/// パス設定を絶対パスに解決する
///
/// - 未設定・空文字: `<base>/<default_name>`
/// - 相対パス: `<base>` を基準に結合
/// - 絶対パス: そのまま
pub fn resolve_path(value: Option<&str>, default_name: &str, base_dir: &Path) -> PathBuf {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => base_dir.join(default_name),
        Some(v) => {
            let path = Path::new(v);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                base_dir.join(path)
            }
        }
    }
}

fn parse_port(value: Option<&str>, default: u16) -> u16 {
    value
        .and_then(|v| v.trim().parse::<u16>().ok())
        .filter(|p| *p != 0)
        .unwrap_or(default)
}

fn parse_bool(value: Option<&str>, default: bool) -> bool {
    match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        Some("true" | "1" | "yes" | "on") => true,
        Some("false" | "0" | "no" | "off") => false,
        _ => default,
    }
}
