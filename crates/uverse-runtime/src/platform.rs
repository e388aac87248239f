//! OS ごとのプロセス操作
//!
//! シグナル送信・生存確認・名前による一括終了をまとめる。
//! いずれも同期処理（終了時のスイープから呼べるように）。

use std::process::Command;
use std::sync::Arc;

/// プロセス操作のトレイト
pub trait Platform: Send + Sync {
    /// 実行ファイル名（Windows では `.exe` を付ける）
    fn executable_name(&self, base: &str) -> String {
        format!("{}{}", base, std::env::consts::EXE_SUFFIX)
    }

    /// 終了要求を送る（送信できたら true）
    fn graceful_stop(&self, pid: u32) -> bool;

    /// 強制終了
    fn force_kill(&self, pid: u32);

    fn is_alive(&self, pid: u32) -> bool;

    /// コマンドラインがパターンに一致するプロセスを強制終了する
    ///
    /// 自プロセスは除外する。終了させた数を返す。
    fn kill_matching(&self, pattern: &str) -> usize;

    /// 指定ポートで待ち受けているプロセスの PID
    fn pids_listening_on(&self, port: u16) -> Vec<u32>;
}

/// 現在の OS の実装
pub fn current_platform() -> Arc<dyn Platform> {
    #[cfg(unix)]
    {
        Arc::new(UnixPlatform)
    }
    #[cfg(windows)]
    {
        Arc::new(WindowsPlatform)
    }
}

fn parse_pids(stdout: &[u8]) -> Vec<u32> {
    String::from_utf8_lossy(stdout)
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .filter(|pid| *pid != std::process::id())
        .collect()
}

/// `pgrep -f` 用に POSIX 拡張正規表現のメタ文字をエスケープする
///
/// インストール先に `(` や `+` が含まれていても自分自身に一致させる。
fn escape_ere(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if matches!(
            c,
            '.' | '[' | ']' | '(' | ')' | '*' | '+' | '?' | '{' | '}' | '|' | '^' | '$' | '\\'
        ) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// `tasklist /FO CSV /NH` の出力からイメージ名が一致する行の PID を取り出す
#[cfg(any(windows, test))]
fn parse_tasklist_pids(stdout: &[u8], image: &str) -> Vec<u32> {
    String::from_utf8_lossy(stdout)
        .lines()
        .filter_map(|line| {
            let mut cols = line.split(',').map(|c| c.trim().trim_matches('"'));
            let name = cols.next()?;
            let pid = cols.next()?.parse::<u32>().ok()?;
            name.eq_ignore_ascii_case(image).then_some(pid)
        })
        .filter(|pid| *pid != std::process::id())
        .collect()
}

#[cfg(unix)]
pub use unix::UnixPlatform;

#[cfg(unix)]
mod unix {
    use super::*;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    #[derive(Debug, Clone, Copy, Default)]
    pub struct UnixPlatform;

    fn send(pid: u32, sig: Option<Signal>) -> nix::Result<()> {
        let pid = i32::try_from(pid).map_err(|_| nix::errno::Errno::EINVAL)?;
        signal::kill(Pid::from_raw(pid), sig)
    }

    impl Platform for UnixPlatform {
        fn graceful_stop(&self, pid: u32) -> bool {
            tracing::debug!("Sending SIGTERM to process {}", pid);
            match send(pid, Some(Signal::SIGTERM)) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!("Failed to send SIGTERM to {}: {}", pid, e);
                    false
                }
            }
        }

        fn force_kill(&self, pid: u32) {
            tracing::debug!("Sending SIGKILL to process {}", pid);
            if let Err(e) = send(pid, Some(Signal::SIGKILL)) {
                tracing::debug!("Failed to send SIGKILL to {}: {}", pid, e);
            }
        }

        fn is_alive(&self, pid: u32) -> bool {
            // signal 0 で存在確認
            send(pid, None).is_ok()
        }

        fn kill_matching(&self, pattern: &str) -> usize {
            let output = match Command::new("pgrep")
                .arg("-f")
                .arg(escape_ere(pattern))
                .output()
            {
                Ok(out) => out,
                Err(e) => {
                    tracing::debug!("pgrep unavailable: {}", e);
                    return 0;
                }
            };

            let pids = parse_pids(&output.stdout);
            for pid in &pids {
                tracing::info!("Killing leftover process {} matching {}", pid, pattern);
                self.force_kill(*pid);
            }
            pids.len()
        }

        fn pids_listening_on(&self, port: u16) -> Vec<u32> {
            // lsof -ti:{port}
            match Command::new("lsof")
                .arg("-t")
                .arg(format!("-i:{}", port))
                .output()
            {
                Ok(out) if out.status.success() => parse_pids(&out.stdout),
                _ => vec![],
            }
        }
    }
}

#[cfg(windows)]
pub use windows::WindowsPlatform;

#[cfg(windows)]
mod windows {
    use super::*;
    use std::path::Path;

    #[derive(Debug, Clone, Copy, Default)]
    pub struct WindowsPlatform;

    fn taskkill(args: &[&str]) -> bool {
        Command::new("taskkill")
            .args(args)
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    impl Platform for WindowsPlatform {
        fn graceful_stop(&self, pid: u32) -> bool {
            taskkill(&["/PID", &pid.to_string()])
        }

        fn force_kill(&self, pid: u32) {
            if !taskkill(&["/F", "/T", "/PID", &pid.to_string()]) {
                tracing::debug!("taskkill /F failed for {}", pid);
            }
        }

        fn is_alive(&self, pid: u32) -> bool {
            Command::new("tasklist")
                .args(["/FI", &format!("PID eq {}", pid), "/NH"])
                .output()
                .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
                .unwrap_or(false)
        }

        fn kill_matching(&self, pattern: &str) -> usize {
            // taskkill はイメージ名でしか絞り込めない
            let image = Path::new(pattern)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| pattern.to_string());
            let pids = match Command::new("tasklist")
                .args(["/FI", &format!("IMAGENAME eq {}", image), "/FO", "CSV", "/NH"])
                .output()
            {
                Ok(out) => parse_tasklist_pids(&out.stdout, &image),
                Err(e) => {
                    tracing::debug!("tasklist unavailable: {}", e);
                    return 0;
                }
            };

            let mut killed = 0;
            for pid in pids {
                tracing::info!("Killing leftover process {} ({})", pid, image);
                if taskkill(&["/F", "/T", "/PID", &pid.to_string()]) {
                    killed += 1;
                }
            }
            killed
        }

        fn pids_listening_on(&self, port: u16) -> Vec<u32> {
            let Ok(out) = Command::new("netstat").args(["-ano", "-p", "TCP"]).output() else {
                return vec![];
            };
            let suffix = format!(":{}", port);
            let text = String::from_utf8_lossy(&out.stdout);
            let mut pids: Vec<u32> = text
                .lines()
                .filter_map(|line| {
                    let cols: Vec<&str> = line.split_whitespace().collect();
                    match cols.as_slice() {
                        [_, local, _, state, pid] if local.ends_with(&suffix) && *state == "LISTENING" => {
                            pid.parse().ok()
                        }
                        _ => None,
                    }
                })
                .filter(|pid| *pid != std::process::id())
                .collect();
            pids.sort_unstable();
            pids.dedup();
            pids
        }
    }
}
