use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(
        "サービス '{service}' の起動に失敗しました: {program}\n理由: {source}\n\nヒント:\n  • 実行ファイルのパスと権限を確認してください"
    )]
    SpawnFailed {
        service: String,
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "サービス '{service}' の準備完了を待機中にタイムアウトしました（ポート {port}、{timeout_secs}秒）\n\nヒント:\n  • ポートが他のプロセスに使われていないか確認してください\n  • セッションログでサービスの出力を確認してください"
    )]
    ServiceWaitTimeout {
        service: String,
        port: u16,
        timeout_secs: u64,
    },

    #[error("コマンドの実行に失敗しました: {command}\n理由: {message}")]
    CommandFailed { command: String, message: String },

    #[error("必須パスの検証に失敗しました: {0}")]
    PathValidation(String),

    #[error("サービスが見つかりません: {0}")]
    ServiceNotFound(String),

    #[error("停止要求によりサービス '{0}' の再起動を中断しました")]
    Cancelled(String),

    #[error("設定エラー: {0}")]
    Config(#[from] uverse_config::ConfigError),

    #[error(transparent)]
    Core(#[from] uverse_core::CoreError),

    #[error("IO エラー: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
