//! ログ出力の初期化

use crate::commands::Session;
use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uverse_config::ResolvedConfig;
use uverse_runtime::SessionLog;

/// 通常の CLI コマンド用（stderr のみ）
pub fn init_cli() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}

/// 監視モード用（stderr + セッションログファイル）
pub fn init_supervisor(session: &Session) -> anyhow::Result<SessionLog> {
    let config = session.load_config();
    let log_dir = uverse_config::get_log_dir().context("ログディレクトリを作成できません")?;
    let log = SessionLog::new(log_dir).context("ログディレクトリを作成できません")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(&config)));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(log.clone()),
        )
        .init();

    tracing::info!("Session log: {}", log.current_path().display());
    Ok(log)
}

/// `RUST_LOG` が無いときのフィルタ
///
/// `LOG_LEVEL` はバックエンドと共用なので Python 流の名前も受け付ける。
fn default_directive(config: &ResolvedConfig) -> String {
    if config.debug {
        return "debug".to_string();
    }
    match config.log_level.to_lowercase().as_str() {
        "warning" => "warn".to_string(),
        "critical" | "fatal" => "error".to_string(),
        other => other.to_string(),
    }
}
