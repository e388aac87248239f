//! 子プロセスの起動・監視・停止
//!
//! 標準出力・標準エラーは1行ずつ `tracing` に転送する。
//! 終了は監視タスクが検知し、ハンドルを破棄する（自動再起動はしない）。

use crate::error::{Result, RuntimeError};
use crate::platform::Platform;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;

/// グレースフル停止の待機時間
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// 強制終了後の待機時間
const KILL_WAIT: Duration = Duration::from_secs(2);

/// グレースフル停止の方法
pub enum GracefulStop {
    /// 終了シグナル（Windows では taskkill）
    Signal,
    /// 停止用コマンドを実行する（例: `pg_ctl stop`）
    Command(Command),
}

/// 実行中プロセスのハンドル
#[derive(Debug, Clone)]
struct Handle {
    pid: u32,
    stop_requested: Arc<AtomicBool>,
    exited: watch::Receiver<bool>,
}

/// 1つのサービスプロセス
///
/// ハンドルは所有者（コントローラー）だけが持つ。
pub struct ManagedProcess {
    service: String,
    platform: Arc<dyn Platform>,
    handle: Arc<Mutex<Option<Handle>>>,
    stop_timeout: Duration,
}

impl ManagedProcess {
    pub fn new(service: impl Into<String>, platform: Arc<dyn Platform>) -> Self {
        Self {
            service: service.into(),
            platform,
            handle: Arc::new(Mutex::new(None)),
            stop_timeout: STOP_TIMEOUT,
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn current(&self) -> Option<Handle> {
        self.handle.lock().ok().and_then(|h| h.clone())
    }

    pub fn pid(&self) -> Option<u32> {
        self.current().map(|h| h.pid)
    }

    pub fn is_running(&self) -> bool {
        self.current().is_some()
    }

    /// プロセスを起動する
    pub fn spawn(&self, mut command: Command) -> Result<u32> {
        let program = PathBuf::from(command.as_std().get_program());
        tracing::debug!(service = %self.service, "Running: {:?}", command.as_std());

        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RuntimeError::SpawnFailed {
                service: self.service.clone(),
                program: program.clone(),
                source,
            })?;

        let pid = child.id().ok_or_else(|| RuntimeError::SpawnFailed {
            service: self.service.clone(),
            program,
            source: std::io::Error::other("process exited before its pid was read"),
        })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(self.service.clone(), "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(self.service.clone(), "stderr", stderr));
        }

        let (exit_tx, exit_rx) = watch::channel(false);
        let stop_requested = Arc::new(AtomicBool::new(false));
        if let Ok(mut slot) = self.handle.lock() {
            *slot = Some(Handle {
                pid,
                stop_requested: stop_requested.clone(),
                exited: exit_rx,
            });
        }

        let service = self.service.clone();
        let slot = self.handle.clone();
        tokio::spawn(async move {
            let status = child.wait().await;

            if let Ok(mut current) = slot.lock() {
                if current.as_ref().is_some_and(|h| h.pid == pid) {
                    *current = None;
                }
            }

            let requested = stop_requested.load(Ordering::SeqCst);
            match status {
                Ok(status) if requested => {
                    tracing::info!(service = %service, "Process {} stopped ({})", pid, status)
                }
                Ok(status) => {
                    tracing::error!(service = %service, "Process {} exited unexpectedly ({})", pid, status)
                }
                Err(e) => tracing::error!(service = %service, "Failed to wait for process {}: {}", pid, e),
            }
            let _ = exit_tx.send(true);
        });

        tracing::info!(service = %self.service, "Started process {}", pid);
        Ok(pid)
    }

    /// プロセスを停止する
    ///
    /// 1. `force` でなければグレースフル停止を送り、最大 `stop_timeout` 待つ
    /// 2. まだ生きていれば強制終了
    /// 3. `sweep` があれば同名プロセスを一括終了（取りこぼし対策）
    pub async fn stop(&self, force: bool, graceful: GracefulStop, sweep: Option<&str>) -> Result<()> {
        let Some(handle) = self.current() else {
            tracing::debug!(service = %self.service, "Not running, nothing to stop");
            if let Some(pattern) = sweep {
                self.platform.kill_matching(pattern);
            }
            return Ok(());
        };
        handle.stop_requested.store(true, Ordering::SeqCst);
        let pid = handle.pid;

        let mut exited = false;
        if !force {
            tracing::info!(service = %self.service, "Stopping process {}", pid);
            match graceful {
                GracefulStop::Signal => {
                    self.platform.graceful_stop(pid);
                }
                GracefulStop::Command(command) => run_stop_command(&self.service, command, self.stop_timeout).await,
            }
            exited = wait_exit(handle.exited.clone(), self.stop_timeout).await;
            if !exited {
                tracing::warn!(
                    service = %self.service,
                    "Process {} did not exit within {:?}, killing",
                    pid,
                    self.stop_timeout
                );
            }
        }

        if !exited {
            tracing::info!(service = %self.service, "Killing process {}", pid);
            self.platform.force_kill(pid);
            if !wait_exit(handle.exited.clone(), KILL_WAIT).await {
                tracing::warn!(service = %self.service, "Process {} still alive after kill", pid);
            }
        }

        if let Some(pattern) = sweep {
            let killed = self.platform.kill_matching(pattern);
            if killed > 0 {
                tracing::warn!(service = %self.service, "Swept {} leftover process(es)", killed);
            }
        }
        Ok(())
    }

    /// 終了を待つ（期限切れなら false）
    pub async fn wait_exited(&self, timeout: Duration) -> bool {
        match self.current() {
            Some(handle) => wait_exit(handle.exited, timeout).await,
            None => true,
        }
    }
}

async fn wait_exit(mut exited: watch::Receiver<bool>, timeout: Duration) -> bool {
    // 送信側が閉じていれば監視タスクは終わっている
    match tokio::time::timeout(timeout, exited.wait_for(|done| *done)).await {
        Ok(_) => true,
        Err(_) => false,
    }
}

async fn run_stop_command(service: &str, mut command: Command, timeout: Duration) {
    tracing::debug!(service = %service, "Running: {:?}", command.as_std());
    command.stdin(Stdio::null()).kill_on_drop(true);
    match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(out)) if out.status.success() => {}
        Ok(Ok(out)) => tracing::warn!(
            service = %service,
            "Stop command failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        ),
        Ok(Err(e)) => tracing::warn!(service = %service, "Stop command could not run: {}", e),
        Err(_) => tracing::warn!(service = %service, "Stop command timed out"),
    }
}

/// 出力を1行ずつ転送する
///
/// UTF-8 でない行（ロケール依存のメッセージなど）も置換して転送し、
/// EOF まで読み続ける。途中でパイプを閉じると子プロセスが書き込みで落ちる。
async fn forward_lines<R>(service: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if !line.is_empty() {
                    tracing::info!(target: "uverse::service", service = %service, stream, "{}", line);
                }
            }
            Err(e) => {
                tracing::debug!(service = %service, "Stopped reading {}: {}", stream, e);
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::platform::current_platform;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn test_spawn_and_graceful_stop() {
        let process = ManagedProcess::new("sleeper", current_platform());
        let pid = process.spawn(sh("echo ready; exec sleep 30")).unwrap();

        assert!(process.is_running());
        assert_eq!(process.pid(), Some(pid));

        process.stop(false, GracefulStop::Signal, None).await.unwrap();
        assert!(process.wait_exited(Duration::from_secs(1)).await);
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn test_self_exit_clears_handle() {
        let process = ManagedProcess::new("short", current_platform());
        process.spawn(sh("exit 3")).unwrap();

        assert!(process.wait_exited(Duration::from_secs(5)).await);
        assert!(!process.is_running());
        assert_eq!(process.pid(), None);
    }

    #[tokio::test]
    async fn test_stubborn_process_is_killed() {
        let process = ManagedProcess::new("stubborn", current_platform())
            .with_stop_timeout(Duration::from_millis(300));
        process.spawn(sh("trap '' TERM; exec sleep 30")).unwrap();
        // trap が設定されるまで少し待つ
        tokio::time::sleep(Duration::from_millis(100)).await;

        process.stop(false, GracefulStop::Signal, None).await.unwrap();
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn test_force_stop_skips_graceful() {
        let process = ManagedProcess::new("forced", current_platform());
        process.spawn(sh("exec sleep 30")).unwrap();

        let started = std::time::Instant::now();
        process.stop(true, GracefulStop::Signal, None).await.unwrap();
        assert!(!process.is_running());
        assert!(started.elapsed() < STOP_TIMEOUT);
    }

    #[tokio::test]
    async fn test_stop_command_is_used() {
        let process = ManagedProcess::new("cmd-stop", current_platform());
        let pid = process.spawn(sh("exec sleep 30")).unwrap();

        let stop = sh(&format!("kill -TERM {}", pid));
        process.stop(false, GracefulStop::Command(stop), None).await.unwrap();
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_error() {
        let process = ManagedProcess::new("missing", current_platform());
        let err = process
            .spawn(Command::new("/nonexistent/uverse-binary"))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::SpawnFailed { .. }));
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn test_non_utf8_output_keeps_process_alive() {
        let process = ManagedProcess::new("cp932", current_platform());
        process
            .spawn(sh("printf '\\377\\376 broken\\n'; sleep 0.3; echo after; exec sleep 30"))
            .unwrap();

        // 2行目の書き込みでパイプが閉じていれば SIGPIPE で落ちる
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(process.is_running());

        process.stop(true, GracefulStop::Signal, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_forward_lines_reads_past_invalid_utf8() {
        let input: &[u8] = b"ok\n\xff\xfe bad\nafter\n";
        let mut reader = input;
        forward_lines("test".to_string(), "stdout", &mut reader).await;
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_stop_when_not_running_is_ok() {
        let process = ManagedProcess::new("idle", current_platform());
        process.stop(false, GracefulStop::Signal, None).await.unwrap();
    }
}
