use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("ユーザーデータディレクトリが見つかりません")]
    DataDirNotFound,

    #[error(
        "無効な設定キー: '{0}'\n\nヒント:\n  • キーは英字またはアンダースコアで始まり、英数字とアンダースコアのみ使用できます"
    )]
    InvalidKey(String),

    #[error("設定値に改行は使用できません: '{0}'")]
    InvalidValue(String),

    #[error("設定ファイルの書き込みに失敗しました: {path}\n理由: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO エラー: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
