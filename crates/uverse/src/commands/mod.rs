pub mod check;
pub mod config;
pub mod run;

use anyhow::Context;
use std::path::{Path, PathBuf};
use uverse_config::{ConfigStore, ResolvedConfig};

/// コマンド共通の実行環境
#[derive(Debug, Clone)]
pub struct Session {
    pub base_dir: PathBuf,
    pub packaged: bool,
    pub store: ConfigStore,
}

impl Session {
    pub fn from_args(
        base_dir: Option<PathBuf>,
        config: Option<PathBuf>,
        packaged: bool,
    ) -> anyhow::Result<Self> {
        let base_dir = match base_dir {
            Some(dir) => absolutize(&dir)?,
            None => default_base_dir(packaged)?,
        };

        let store = match config {
            Some(path) => ConfigStore::new(absolutize(&path)?),
            None => {
                let data_dir = uverse_config::get_data_dir()
                    .context("ユーザーデータディレクトリを作成できません")?;
                ConfigStore::locate(&data_dir, &base_dir, packaged)
            }
        };

        tracing::debug!(
            "Base directory: {}, config file: {}",
            base_dir.display(),
            store.path().display()
        );

        Ok(Self {
            base_dir,
            packaged,
            store,
        })
    }

    /// 現在の設定を読み込む
    pub fn load_config(&self) -> ResolvedConfig {
        self.store.load(&self.base_dir)
    }
}

/// パッケージ版は実行ファイルのディレクトリ、開発版はカレントディレクトリ
fn default_base_dir(packaged: bool) -> anyhow::Result<PathBuf> {
    if packaged {
        let exe = std::env::current_exe().context("実行ファイルの場所を取得できません")?;
        if let Some(dir) = exe.parent() {
            return Ok(dir.to_path_buf());
        }
    }
    std::env::current_dir().context("カレントディレクトリを取得できません")
}

fn absolutize(path: &Path) -> anyhow::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
