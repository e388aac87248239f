//! ポート到達性の確認
//!
//! サービスの準備完了は TCP 接続できるかどうかで判定する。

use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};

/// 試行間隔
pub const PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// 1回の接続試行の上限
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// ポート待機のトレイト
#[async_trait]
pub trait PortProbe: Send + Sync {
    /// ポートに接続できるまで待機する（期限切れなら false）
    async fn wait_for_port(&self, port: u16, timeout: Duration) -> bool;
}

/// ループバックへの TCP 接続で確認する
#[derive(Debug, Clone, Copy)]
pub struct TcpPortProbe {
    host: IpAddr,
    interval: Duration,
}

impl Default for TcpPortProbe {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            interval: PROBE_INTERVAL,
        }
    }
}

impl TcpPortProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[async_trait]
impl PortProbe for TcpPortProbe {
    async fn wait_for_port(&self, port: u16, budget: Duration) -> bool {
        let addr = SocketAddr::new(self.host, port);
        let deadline = Instant::now() + budget;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if try_connect(addr).await {
                tracing::debug!("Port {} reachable after {} attempt(s)", port, attempts);
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!("Port {} not reachable after {} attempt(s)", port, attempts);
                return false;
            }
            sleep(self.interval.min(deadline - now)).await;
        }
    }
}

async fn try_connect(addr: SocketAddr) -> bool {
    matches!(timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await, Ok(Ok(_)))
}

/// ポートが既に使われているか（1回だけ確認）
pub async fn is_port_open(port: u16) -> bool {
    try_connect(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// 確実に閉じているポートを得る
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn test_wait_for_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let probe = TcpPortProbe::new();
        assert!(probe.wait_for_port(port, Duration::from_secs(2)).await);
        assert!(is_port_open(port).await);
    }

    #[tokio::test]
    async fn test_wait_for_closed_port_times_out() {
        let port = closed_port().await;
        let probe = TcpPortProbe::new().with_interval(Duration::from_millis(50));

        let started = std::time::Instant::now();
        assert!(!probe.wait_for_port(port, Duration::from_millis(300)).await);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!is_port_open(port).await);
    }

    #[tokio::test]
    async fn test_port_that_opens_later() {
        let port = closed_port().await;
        let probe = TcpPortProbe::new().with_interval(Duration::from_millis(50));

        let server = tokio::spawn(async move {
            sleep(Duration::from_millis(200)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            sleep(Duration::from_secs(2)).await;
            drop(listener);
        });

        assert!(probe.wait_for_port(port, Duration::from_secs(2)).await);
        server.abort();
    }
}
