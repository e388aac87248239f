pub mod env_file;
pub mod error;
pub mod metadata;
pub mod resolved;
pub mod store;

pub use env_file::{EnvFile, parse_env};
pub use error::*;
pub use metadata::{CONFIG_METADATA, ConfigCategory, ConfigKeyMeta, PATH_KEYS, keys};
pub use resolved::{
    DatabaseSettings, ObjectStoreSettings, Ports, ResolvedConfig, ServicePaths, resolve_path,
};
pub use store::{ConfigEntry, ConfigStore};

use std::path::PathBuf;

/// アプリケーション名（ユーザーデータディレクトリ名）
pub const APP_NAME: &str = "Uverse";

/// 設定ファイル名
pub const ENV_FILE_NAME: &str = ".env";

/// Uverse のユーザーデータディレクトリを取得
///
/// 存在しなければ作成する。
pub fn get_data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_local_dir()
        .ok_or(ConfigError::DataDirNotFound)?
        .join(APP_NAME);

    if !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)?;
    }

    Ok(data_dir)
}

/// セッションログの保存先
pub fn get_log_dir() -> Result<PathBuf> {
    let log_dir = get_data_dir()?.join("logs");
    if !log_dir.exists() {
        std::fs::create_dir_all(&log_dir)?;
    }
    Ok(log_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_get_data_dir() {
        let home = tempfile::tempdir().unwrap();
        let xdg = home.path().join("share");

        temp_env::with_vars(
            [
                ("HOME", Some(home.path().to_str().unwrap())),
                ("XDG_DATA_HOME", Some(xdg.to_str().unwrap())),
            ],
            || {
                let data_dir = get_data_dir().unwrap();
                assert!(data_dir.ends_with(APP_NAME));
                assert!(data_dir.exists());

                let log_dir = get_log_dir().unwrap();
                assert_eq!(log_dir, data_dir.join("logs"));
                assert!(log_dir.exists());
            },
        );
    }
}
