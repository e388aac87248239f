//! アプリケーションバックエンド

use crate::controller::{ServiceController, cleanup_stale_processes};
use crate::error::Result;
use crate::platform::Platform;
use crate::process::{GracefulStop, ManagedProcess};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use uverse_config::{ResolvedConfig, keys};
use uverse_core::{DESCRIPTOR_FILE_NAME, ServiceKind};

pub const BACKEND_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// 開発時に使う Python インタプリタ（`PYTHON` で上書き可能）
const DEFAULT_PYTHON: &str = "python3";

/// バックエンドの起動方法
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendLaunch {
    /// 同梱の実行ファイル
    Packaged { executable: PathBuf },
    /// `python3 backend/main.py`
    Script { interpreter: String, script: PathBuf },
}

impl BackendLaunch {
    pub fn resolve(config: &ResolvedConfig, packaged: bool, platform: &dyn Platform) -> Self {
        let backend_dir = config.base_dir.join("backend");
        if packaged {
            BackendLaunch::Packaged {
                executable: backend_dir.join(platform.executable_name("uverse-backend")),
            }
        } else {
            BackendLaunch::Script {
                interpreter: std::env::var("PYTHON").unwrap_or_else(|_| DEFAULT_PYTHON.to_string()),
                script: backend_dir.join("main.py"),
            }
        }
    }

    fn command(&self) -> Command {
        match self {
            BackendLaunch::Packaged { executable } => Command::new(executable),
            BackendLaunch::Script { interpreter, script } => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(script);
                cmd
            }
        }
    }

    /// プロセス一括終了用のパターン
    fn pattern(&self) -> String {
        match self {
            BackendLaunch::Packaged { executable } => executable.display().to_string(),
            BackendLaunch::Script { script, .. } => script.display().to_string(),
        }
    }
}

/// バックエンドに渡す環境変数
///
/// 未知のキーをそのまま渡した上で、管理対象のキーを上書きする。
pub fn backend_env(config: &ResolvedConfig) -> BTreeMap<String, String> {
    let mut env = config.extra.clone();
    let db = &config.database;
    let store = &config.object_store;
    let ports = &config.ports;
    let store_address = format!(":{}", ports.object_store);

    let managed = [
        (keys::PORT, ports.backend.to_string()),
        // データベースとストレージはスーパーバイザーが管理する
        (keys::USE_EMBEDDED_PG, "false".to_string()),
        ("UVERSE_MANAGED_SERVICES", "1".to_string()),
        (keys::DATABASE_HOST, db.host.clone()),
        (keys::DATABASE_PORT, ports.database.to_string()),
        (keys::DATABASE_USER, db.user.clone()),
        (keys::DATABASE_PASSWORD, db.password.clone()),
        (keys::DATABASE_NAME, db.name.clone()),
        ("DATABASE_URL", db.connection_url(ports.database)),
        ("RUSTFS_ENDPOINT", format!("http://127.0.0.1{}", store_address)),
        ("RUSTFS_ADDRESS", store_address.clone()),
        (keys::RUSTFS_ACCESS_KEY, store.access_key.clone()),
        (keys::RUSTFS_SECRET_KEY, store.secret_key.clone()),
        (keys::RUSTFS_REGION, store.region.clone()),
        (keys::MODELS_DIR, config.paths.models_dir.display().to_string()),
        (keys::TEMP_DIR, config.paths.temp_dir.display().to_string()),
        (
            "MINERU_TOOLS_CONFIG_JSON",
            config.paths.models_dir.join(DESCRIPTOR_FILE_NAME).display().to_string(),
        ),
        ("MINERU_MODEL_SOURCE", "local".to_string()),
        (keys::DEBUG, config.debug.to_string()),
        (keys::LOG_LEVEL, config.log_level.clone()),
        ("PYTHONUNBUFFERED", "1".to_string()),
        ("PYTHONIOENCODING", "utf-8".to_string()),
    ];
    env.extend(managed.into_iter().map(|(k, v)| (k.to_string(), v)));
    env
}

pub struct BackendController {
    platform: Arc<dyn Platform>,
    process: ManagedProcess,
    packaged: bool,
    launch: Mutex<Option<BackendLaunch>>,
}

impl BackendController {
    pub fn new(platform: Arc<dyn Platform>, packaged: bool) -> Self {
        Self {
            process: ManagedProcess::new(ServiceKind::Backend.as_str(), platform.clone()),
            platform,
            packaged,
            launch: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ServiceController for BackendController {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Backend
    }

    fn port(&self, config: &ResolvedConfig) -> u16 {
        config.ports.backend
    }

    fn readiness_timeout(&self) -> Duration {
        BACKEND_READY_TIMEOUT
    }

    async fn start(&self, config: &ResolvedConfig) -> Result<()> {
        let launch = BackendLaunch::resolve(config, self.packaged, self.platform.as_ref());
        if let Ok(mut slot) = self.launch.lock() {
            *slot = Some(launch.clone());
        }

        let mut cmd = launch.command();
        cmd.envs(backend_env(config))
            .current_dir(config.base_dir.join("backend"));
        self.process.spawn(cmd)?;
        Ok(())
    }

    async fn stop(&self, force: bool) -> Result<()> {
        let sweep = self
            .launch
            .lock()
            .ok()
            .and_then(|l| l.as_ref().map(BackendLaunch::pattern));
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
            config.ports.backend,
        )
        .await;
    }

    fn sweep_pattern(&self, config: &ResolvedConfig) -> Option<String> {
        Some(BackendLaunch::resolve(config, self.packaged, self.platform.as_ref()).pattern())
    }
}
