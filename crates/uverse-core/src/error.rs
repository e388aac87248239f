use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("mineru.json が見つかりません: {0}")]
    DescriptorNotFound(PathBuf),

    #[error("mineru.json の読み込みに失敗しました: {path}\n理由: {source}")]
    DescriptorRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "mineru.json の形式が不正です: {path}\n理由: {source}\n\nヒント:\n  • JSON として正しいか確認してください"
    )]
    DescriptorParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("mineru.json の書き込みに失敗しました: {path}\n理由: {source}")]
    DescriptorWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("不明なサービス: {0}\nヒント: database, object-store, backend のいずれかを指定してください")]
    UnknownService(String),

    #[error("IO エラー: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
