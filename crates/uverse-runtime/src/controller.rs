//! サービスコントローラーのトレイト

use crate::error::Result;
use crate::platform::Platform;
use crate::probe::is_port_open;
use async_trait::async_trait;
use std::time::Duration;
use uverse_config::ResolvedConfig;
use uverse_core::ServiceKind;

/// 監視対象サービス1つ分の操作
///
/// プロセスハンドルは実装側が排他的に所有する。
#[async_trait]
pub trait ServiceController: Send + Sync {
    fn kind(&self) -> ServiceKind;

    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// 準備完了の判定に使うポート
    fn port(&self, config: &ResolvedConfig) -> u16;

    /// 準備完了を待つ上限
    fn readiness_timeout(&self) -> Duration;

    /// この設定で起動対象になるか
    fn is_enabled(&self, _config: &ResolvedConfig) -> bool {
        true
    }

    /// プロセスを起動する（準備完了は待たない）
    async fn start(&self, config: &ResolvedConfig) -> Result<()>;

    /// 準備完了後の初期化
    async fn after_ready(&self, _config: &ResolvedConfig) -> Result<()> {
        Ok(())
    }

    async fn stop(&self, force: bool) -> Result<()>;

    fn is_running(&self) -> bool;

    /// 前回の実行で残ったプロセスを片付ける
    async fn cleanup_stale(&self, config: &ResolvedConfig);

    /// 取りこぼし対策の一括終了に使うパターン
    fn sweep_pattern(&self, config: &ResolvedConfig) -> Option<String>;
}

/// 残留プロセスの片付け
///
/// パターンに一致するプロセスを終了し、それでもポートが使われていれば
/// 待ち受けているプロセスを終了する。
pub async fn cleanup_stale_processes(
    platform: &dyn Platform,
    service: &str,
    pattern: Option<&str>,
    port: u16,
) {
    if let Some(pattern) = pattern {
        let killed = platform.kill_matching(pattern);
        if killed > 0 {
            tracing::warn!(service, "Killed {} stale process(es) matching {}", killed, pattern);
        }
    }

    if !is_port_open(port).await {
        return;
    }

    let pids = platform.pids_listening_on(port);
    if pids.is_empty() {
        tracing::warn!(service, "Port {} is in use by an unknown process", port);
        return;
    }

    for pid in pids {
        tracing::warn!(
            service,
            "Port {} is occupied by process {}. Attempting cleanup...",
            port,
            pid
        );
        platform.graceful_stop(pid);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while platform.is_alive(pid) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        if platform.is_alive(pid) {
            platform.force_kill(pid);
        }
    }
}
