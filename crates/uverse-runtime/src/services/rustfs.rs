//! RustFS（S3 互換オブジェクトストレージ）

use crate::controller::{ServiceController, cleanup_stale_processes};
use crate::error::Result;
use crate::platform::Platform;
use crate::process::{GracefulStop, ManagedProcess};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use uverse_config::ResolvedConfig;
use uverse_core::ServiceKind;

pub const OBJECT_STORE_READY_TIMEOUT: Duration = Duration::from_secs(8);

pub struct RustfsController {
    platform: Arc<dyn Platform>,
    process: ManagedProcess,
    executable: Mutex<Option<PathBuf>>,
}

impl RustfsController {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            process: ManagedProcess::new(ServiceKind::ObjectStore.as_str(), platform.clone()),
            platform,
            executable: Mutex::new(None),
        }
    }

    fn executable_for(&self, config: &ResolvedConfig) -> PathBuf {
        config
            .paths
            .store_dir
            .join(self.platform.executable_name("rustfs"))
    }
}

/// `:<port>` 形式のアドレス
pub fn listen_address(port: u16) -> String {
    format!(":{}", port)
}

/// rustfs の引数
pub fn rustfs_args(config: &ResolvedConfig) -> Vec<String> {
    let store = &config.object_store;
    let mut args = vec![
        config.paths.store_dir.join("data").display().to_string(),
        "--address".to_string(),
        listen_address(config.ports.object_store),
        "--access-key".to_string(),
        store.access_key.clone(),
        "--secret-key".to_string(),
        store.secret_key.clone(),
        "--region".to_string(),
        store.region.clone(),
    ];
    if store.console_enabled {
        args.push("--console-enable".to_string());
        args.push("--console-address".to_string());
        args.push(listen_address(config.ports.object_store_console));
    }
    args
}

#[async_trait]
impl ServiceController for RustfsController {
    fn kind(&self) -> ServiceKind {
        ServiceKind::ObjectStore
    }

    fn port(&self, config: &ResolvedConfig) -> u16 {
        config.ports.object_store
    }

    fn readiness_timeout(&self) -> Duration {
        OBJECT_STORE_READY_TIMEOUT
    }

    async fn start(&self, config: &ResolvedConfig) -> Result<()> {
        let store_dir = &config.paths.store_dir;
        std::fs::create_dir_all(store_dir.join("data"))?;

        let executable = self.executable_for(config);
        if let Ok(mut slot) = self.executable.lock() {
            *slot = Some(executable.clone());
        }

        let mut cmd = Command::new(&executable);
        cmd.args(rustfs_args(config)).current_dir(store_dir);
        self.process.spawn(cmd)?;
        Ok(())
    }

    async fn stop(&self, force: bool) -> Result<()> {
        let sweep = self
            .executable
            .lock()
            .ok()
            .and_then(|e| e.as_ref().map(|p| p.display().to_string()));
        self.process
            .stop(force, GracefulStop::Signal, sweep.as_deref())
            .await
    }

    fn is_running(&self) -> bool {
        self.process.is_running()
    }

    async fn cleanup_stale(&self, config: &ResolvedConfig) {
        let pattern = self.sweep_pattern(config);
        cleanup_stale_processes(
            self.platform.as_ref(),
            self.name(),
            pattern.as_deref(),
            config.ports.object_store,
        )
        .await;
    }

    fn sweep_pattern(&self, config: &ResolvedConfig) -> Option<String> {
        Some(self.executable_for(config).display().to_string())
    }
}
