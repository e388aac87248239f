//! サービス全体の起動・停止シーケンス
//!
//! 状態遷移: `idle → starting → {started | failed}`
//!
//! - 起動は database → object-store → backend の順に1つずつ行い、
//!   各サービスのポートに接続できてから次に進む
//! - 途中で失敗したら、この試行で起動したものを逆順に強制停止する
//! - 起動・再起動・停止・設定更新は `sequence` ロックで直列化する
//!   （状態の読み取りはロックを待たない）
//! - 停止要求は `epoch` を進め、実行中の起動・再起動を打ち切ってからロックを取る

use crate::controller::ServiceController;
use crate::error::{Result, RuntimeError};
use crate::platform::Platform;
use crate::probe::PortProbe;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use uverse_config::{ConfigStore, PATH_KEYS, ResolvedConfig};
use uverse_core::{
    LifecycleStatus, PathCheckReport, PathValidation, ServiceKind, ServiceStatus, ValidateOptions,
    check_paths, repair_descriptor, validate_required_paths,
};

/// 停止シーケンス全体の上限
pub const SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);

/// 失敗後の再起動で停止と起動の間に置く待ち時間
pub const RESTART_DELAY: Duration = Duration::from_millis(500);

/// スーパーバイザーの起動設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// 相対パス解決の基準ディレクトリ
    pub base_dir: PathBuf,
    pub packaged: bool,
    pub shutdown_budget: Duration,
    pub restart_delay: Duration,
}

impl SupervisorSettings {
    pub fn new(base_dir: impl Into<PathBuf>, packaged: bool) -> Self {
        Self {
            base_dir: base_dir.into(),
            packaged,
            shutdown_budget: SHUTDOWN_BUDGET,
            restart_delay: RESTART_DELAY,
        }
    }
}

/// 起動前検証
pub trait Preflight: Send + Sync {
    /// 起動直前の検証（必要なら `mineru.json` を修復する）
    fn validate(&self, config: &ResolvedConfig) -> PathValidation;

    /// 保存前のパスチェック（副作用なし）
    fn check(&self, candidates: &BTreeMap<String, String>, base_dir: &Path) -> PathCheckReport;

    /// 設定保存後の `mineru.json` 修復
    fn repair(&self, config: &ResolvedConfig);
}

/// ファイルシステムを実際に確認する実装
#[derive(Debug, Clone, Copy, Default)]
pub struct PathPreflight {
    options: ValidateOptions,
}

impl PathPreflight {
    pub fn new(options: ValidateOptions) -> Self {
        Self { options }
    }
}

impl Preflight for PathPreflight {
    fn validate(&self, config: &ResolvedConfig) -> PathValidation {
        validate_required_paths(config, &self.options)
    }

    fn check(&self, candidates: &BTreeMap<String, String>, base_dir: &Path) -> PathCheckReport {
        check_paths(candidates, base_dir)
    }

    fn repair(&self, config: &ResolvedConfig) {
        let models_dir = &config.paths.models_dir;
        match repair_descriptor(models_dir) {
            Ok(true) => tracing::info!("Model descriptor updated after config save"),
            Ok(false) => {}
            Err(e) => tracing::warn!("Model descriptor repair skipped: {}", e),
        }
    }
}

/// スーパーバイザーの共有状態
///
/// 設定は `update_config` でのみ丸ごと差し替える。
pub struct SupervisorContext {
    pub settings: SupervisorSettings,
    pub store: ConfigStore,
    config: RwLock<Arc<ResolvedConfig>>,
    preflight: Arc<dyn Preflight>,
}

impl SupervisorContext {
    pub fn new(settings: SupervisorSettings, store: ConfigStore, preflight: Arc<dyn Preflight>) -> Self {
        let config = store.load(&settings.base_dir);
        Self {
            settings,
            store,
            config: RwLock::new(Arc::new(config)),
            preflight,
        }
    }

    /// 現在の設定
    pub fn config(&self) -> Arc<ResolvedConfig> {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn replace_config(&self, config: ResolvedConfig) {
        let config = Arc::new(config);
        match self.config.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }
}

/// UI に返す状態
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub status: LifecycleStatus,
    pub error: Option<String>,
    pub path_check: Option<PathValidation>,
    pub services: Vec<ServiceStatus>,
}

/// 設定更新の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Saved,
    /// パスチェックに失敗（何も保存していない）
    Rejected(BTreeMap<String, String>),
}

pub struct Orchestrator {
    context: SupervisorContext,
    controllers: Vec<Arc<dyn ServiceController>>,
    probe: Arc<dyn PortProbe>,
    platform: Arc<dyn Platform>,
    status: watch::Sender<StatusSnapshot>,
    fatal: watch::Sender<bool>,
    /// 停止要求のたびに進める（これより前の起動は打ち切る）
    epoch: watch::Sender<u64>,
    sequence: Mutex<()>,
}

impl Orchestrator {
    /// `controllers` は起動順に並べる
    pub fn new(
        context: SupervisorContext,
        controllers: Vec<Arc<dyn ServiceController>>,
        probe: Arc<dyn PortProbe>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        let (status, _) = watch::channel(StatusSnapshot::default());
        let (fatal, _) = watch::channel(false);
        let (epoch, _) = watch::channel(0);
        Self {
            context,
            controllers,
            probe,
            platform,
            status,
            fatal,
            epoch,
            sequence: Mutex::new(()),
        }
    }

    pub fn context(&self) -> &SupervisorContext {
        &self.context
    }

    pub fn config(&self) -> Arc<ResolvedConfig> {
        self.context.config()
    }

    pub fn status(&self) -> LifecycleStatus {
        self.status.borrow().status
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    /// 監視タスクが panic したら true になる
    pub fn fatal_signal(&self) -> watch::Receiver<bool> {
        self.fatal.subscribe()
    }

    /// 現在の状態（サービスの稼働状況はその場で確認する）
    pub fn snapshot(&self) -> StatusSnapshot {
        let mut snapshot = self.status.borrow().clone();
        snapshot.services = self.service_statuses();
        snapshot
    }

    fn service_statuses(&self) -> Vec<ServiceStatus> {
        let config = self.config();
        self.controllers
            .iter()
            .map(|c| ServiceStatus {
                name: c.kind(),
                port: c.port(&config),
                running: c.is_running(),
            })
            .collect()
    }

    fn set_status(&self, status: LifecycleStatus, error: Option<String>) {
        let services = self.service_statuses();
        self.status.send_modify(|s| {
            s.status = status;
            s.error = error;
            s.services = services;
        });
    }

    /// `from` → `starting` を不可分に行う
    fn begin_start(&self, from: LifecycleStatus) -> bool {
        self.status.send_if_modified(|s| {
            if s.status != from {
                return false;
            }
            s.status = LifecycleStatus::Starting;
            s.error = None;
            true
        })
    }

    /// 全サービスを起動して結果の状態を返す
    ///
    /// `idle` 以外から呼ばれた場合は何もしない。
    pub async fn start_all(&self) -> LifecycleStatus {
        if !self.begin_start(LifecycleStatus::Idle) {
            tracing::debug!("Start requested while {}, ignoring", self.status());
            return self.status();
        }
        let epoch = *self.epoch.borrow();
        self.run_start_sequence(false, epoch).await
    }

    /// UI からの起動要求
    ///
    /// - idle: バックグラウンドで起動
    /// - failed: 全停止してから起動し直す
    /// - starting / started: 何もしない
    pub fn request_start(self: &Arc<Self>) -> LifecycleStatus {
        let stop_first = if self.begin_start(LifecycleStatus::Idle) {
            false
        } else if self.begin_start(LifecycleStatus::Failed) {
            tracing::info!("Restarting all services after failure");
            true
        } else {
            return self.status();
        };

        let epoch = *self.epoch.borrow();
        let this = self.clone();
        self.spawn_supervised(async move {
            this.run_start_sequence(stop_first, epoch).await;
        });
        LifecycleStatus::Starting
    }

    /// 監視タスクを起動する（panic したら failed にして通知する）
    fn spawn_supervised<F>(self: &Arc<Self>, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!("Supervision task panicked");
                    this.set_status(
                        LifecycleStatus::Failed,
                        Some("内部エラーが発生しました".to_string()),
                    );
                    this.fatal.send_replace(true);
                }
            }
        });
    }

    /// 起動シーケンスが終わるまで待つ
    pub async fn wait_for_start(&self) -> StatusSnapshot {
        let mut rx = self.subscribe();
        // 送信側は self が持っているので閉じることはない
        let _ = rx.wait_for(|s| s.status.is_settled()).await;
        self.snapshot()
    }

    /// `epoch` が進んだら途中で打ち切る
    ///
    /// 起動済みのサービスは打ち切った側（`stop_all`）が停止する。
    async fn run_start_sequence(&self, stop_first: bool, epoch: u64) -> LifecycleStatus {
        let _guard = self.sequence.lock().await;
        let mut cancel = self.epoch.subscribe();

        tokio::select! {
            status = self.start_sequence(stop_first) => status,
            _ = cancel.wait_for(|current| *current != epoch) => {
                tracing::warn!("Startup cancelled by shutdown request");
                LifecycleStatus::Idle
            }
        }
    }

    async fn start_sequence(&self, stop_first: bool) -> LifecycleStatus {
        if stop_first {
            self.stop_controllers().await;
            tokio::time::sleep(self.context.settings.restart_delay).await;
        }

        let config = self.config();

        let validation = self.context.preflight.validate(&config);
        let valid = validation.valid;
        let summary = validation.summary();
        self.status.send_modify(|s| s.path_check = Some(validation));
        if !valid {
            tracing::error!("Path validation failed: {}", summary);
            self.set_status(
                LifecycleStatus::Failed,
                Some(RuntimeError::PathValidation(summary).to_string()),
            );
            return LifecycleStatus::Failed;
        }

        let enabled: Vec<_> = self
            .controllers
            .iter()
            .filter(|c| c.is_enabled(&config))
            .cloned()
            .collect();

        for controller in &enabled {
            controller.cleanup_stale(&config).await;
        }

        let mut started: Vec<Arc<dyn ServiceController>> = Vec::new();
        for controller in &enabled {
            started.push(controller.clone());
            if let Err(e) = self.start_one(controller.as_ref(), &config).await {
                tracing::error!(service = controller.name(), "Startup aborted: {}", e);
                self.abort_started(&started).await;
                self.set_status(LifecycleStatus::Failed, Some(e.to_string()));
                return LifecycleStatus::Failed;
            }
        }

        tracing::info!("All services started");
        self.set_status(LifecycleStatus::Started, None);
        LifecycleStatus::Started
    }

    /// 1サービスを起動して準備完了まで待つ
    async fn start_one(&self, controller: &dyn ServiceController, config: &ResolvedConfig) -> Result<()> {
        let port = controller.port(config);
        let timeout = controller.readiness_timeout();
        tracing::info!(service = controller.name(), "Starting (port {})", port);

        controller.start(config).await?;

        if !self.probe.wait_for_port(port, timeout).await {
            return Err(RuntimeError::ServiceWaitTimeout {
                service: controller.name().to_string(),
                port,
                timeout_secs: timeout.as_secs(),
            });
        }
        tracing::info!(service = controller.name(), "Ready on port {}", port);

        if let Err(e) = controller.after_ready(config).await {
            tracing::warn!(service = controller.name(), "Post-start setup failed: {}", e);
        }
        Ok(())
    }

    /// 今回の試行で起動したものを逆順に強制停止する
    async fn abort_started(&self, started: &[Arc<dyn ServiceController>]) {
        for controller in started.iter().rev() {
            if let Err(e) = controller.stop(true).await {
                tracing::warn!(service = controller.name(), "Forced stop failed: {}", e);
            }
        }
    }

    /// 1サービスだけ再起動する
    pub async fn restart_service(&self, kind: ServiceKind) -> Result<()> {
        let controller = self
            .controllers
            .iter()
            .find(|c| c.kind() == kind)
            .cloned()
            .ok_or_else(|| RuntimeError::ServiceNotFound(kind.to_string()))?;

        let epoch = *self.epoch.borrow();
        let _guard = self.sequence.lock().await;
        let config = self.config();
        if !controller.is_enabled(&config) {
            return Err(RuntimeError::ServiceNotFound(kind.to_string()));
        }

        let mut cancel = self.epoch.subscribe();
        let restart = async {
            tracing::info!(service = controller.name(), "Restarting");
            if let Err(e) = controller.stop(false).await {
                tracing::warn!(service = controller.name(), "Stop before restart failed: {}", e);
            }
            self.start_one(controller.as_ref(), &config).await
        };
        let result = tokio::select! {
            result = restart => result,
            _ = cancel.wait_for(|current| *current != epoch) => {
                tracing::warn!(service = controller.name(), "Restart cancelled by shutdown request");
                return Err(RuntimeError::Cancelled(kind.to_string()));
            }
        };
        let services = self.service_statuses();
        match &result {
            Ok(()) => self.status.send_modify(|s| s.services = services),
            Err(e) => {
                let message = e.to_string();
                self.status.send_modify(|s| {
                    s.error = Some(message);
                    s.services = services;
                });
            }
        }
        result
    }

    /// 全サービスを停止して idle に戻す
    ///
    /// 起動中・再起動中なら打ち切ってから停止する。
    pub async fn stop_all(&self) {
        self.epoch.send_modify(|epoch| *epoch += 1);
        let _guard = self.sequence.lock().await;
        self.stop_controllers().await;
        self.set_status(LifecycleStatus::Idle, None);
    }

    /// 逆順にグレースフル停止し、期限を過ぎたら残りを強制停止する
    async fn stop_controllers(&self) {
        let budget = self.context.settings.shutdown_budget;
        let graceful = async {
            for controller in self.controllers.iter().rev() {
                if controller.is_running() {
                    if let Err(e) = controller.stop(false).await {
                        tracing::warn!(service = controller.name(), "Stop failed: {}", e);
                    }
                }
            }
        };

        if tokio::time::timeout(budget, graceful).await.is_err() {
            tracing::warn!("Shutdown exceeded {:?}, forcing remaining services", budget);
        }

        for controller in self.controllers.iter().rev() {
            if controller.is_running() {
                if let Err(e) = controller.stop(true).await {
                    tracing::warn!(service = controller.name(), "Forced stop failed: {}", e);
                }
            }
        }

        let remaining: Vec<&str> = self
            .controllers
            .iter()
            .filter(|c| c.is_running())
            .map(|c| c.name())
            .collect();
        if remaining.is_empty() {
            tracing::info!("All services stopped");
        } else {
            tracing::error!("Services still running after shutdown: {}", remaining.join(", "));
        }
    }

    /// 強制停止して idle に戻す（panic 時など）
    pub async fn force_stop_all(&self) {
        for controller in self.controllers.iter().rev() {
            if let Err(e) = controller.stop(true).await {
                tracing::warn!(service = controller.name(), "Forced stop failed: {}", e);
            }
        }
        self.set_status(LifecycleStatus::Idle, None);
    }

    /// 設定を更新する
    ///
    /// パス系のキーは保存前にチェックし、1つでも不正なら何も保存しない。
    pub async fn update_config(&self, changes: BTreeMap<String, String>) -> Result<UpdateOutcome> {
        let _guard = self.sequence.lock().await;
        let base_dir = &self.context.settings.base_dir;

        let path_changes: BTreeMap<String, String> = changes
            .iter()
            .filter(|(k, _)| PATH_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let report = self.context.preflight.check(&path_changes, base_dir);
        if !report.valid {
            tracing::warn!("Config update rejected: {:?}", report.errors);
            return Ok(UpdateOutcome::Rejected(report.errors));
        }

        self.context.store.update(&changes)?;
        let config = self.context.store.load(base_dir);
        self.context.preflight.repair(&config);
        self.context.replace_config(config);
        tracing::info!("Configuration reloaded");
        Ok(UpdateOutcome::Saved)
    }

    /// 全サービスの実行ファイルを名前で強制終了する（同期）
    ///
    /// プロセス終了時のガードから呼ぶ。
    pub fn emergency_sweep(&self) {
        let config = self.config();
        for controller in &self.controllers {
            if let Some(pattern) = controller.sweep_pattern(&config) {
                let killed = self.platform.kill_matching(&pattern);
                if killed > 0 {
                    tracing::warn!(service = controller.name(), "Swept {} process(es) on exit", killed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    type Events = Arc<StdMutex<Vec<String>>>;

    fn record(events: &Events, event: impl Into<String>) {
        events.lock().unwrap().push(event.into());
    }

    fn count(events: &Events, event: &str) -> usize {
        events.lock().unwrap().iter().filter(|e| *e == event).count()
    }

    struct FakeController {
        kind: ServiceKind,
        port: u16,
        events: Events,
        running: AtomicBool,
        fail_start: bool,
        start_delay: Duration,
        needs_embedded_db: bool,
        /// グレースフル停止が返ってこない
        hang_on_graceful: bool,
    }

    impl FakeController {
        fn new(kind: ServiceKind, port: u16, events: &Events) -> Self {
            Self {
                kind,
                port,
                events: events.clone(),
                running: AtomicBool::new(false),
                fail_start: false,
                start_delay: Duration::ZERO,
                needs_embedded_db: false,
                hang_on_graceful: false,
            }
        }
    }

    #[async_trait]
    impl ServiceController for FakeController {
        fn kind(&self) -> ServiceKind {
            self.kind
        }

        fn port(&self, _config: &ResolvedConfig) -> u16 {
            self.port
        }

        fn readiness_timeout(&self) -> Duration {
            Duration::from_secs(1)
        }

        fn is_enabled(&self, config: &ResolvedConfig) -> bool {
            !self.needs_embedded_db || config.database.embedded
        }

        async fn start(&self, _config: &ResolvedConfig) -> Result<()> {
            record(&self.events, format!("start:{}", self.kind));
            tokio::time::sleep(self.start_delay).await;
            if self.fail_start {
                return Err(RuntimeError::SpawnFailed {
                    service: self.kind.to_string(),
                    program: PathBuf::from("missing"),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self, force: bool) -> Result<()> {
            let mode = if force { "force" } else { "graceful" };
            record(&self.events, format!("stop:{}:{}", self.kind, mode));
            if !force && self.hang_on_graceful {
                std::future::pending::<()>().await;
            }
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        async fn cleanup_stale(&self, _config: &ResolvedConfig) {}

        fn sweep_pattern(&self, _config: &ResolvedConfig) -> Option<String> {
            None
        }
    }

    /// `unreachable` のポートだけ準備完了にならない
    ///
    /// `slow` のポートは本物と同じく30秒待ってから諦める。
    struct FakeProbe {
        events: Events,
        unreachable: Option<u16>,
        slow: Option<u16>,
    }

    #[async_trait]
    impl PortProbe for FakeProbe {
        async fn wait_for_port(&self, port: u16, _timeout: Duration) -> bool {
            record(&self.events, format!("probe:{}", port));
            if Some(port) == self.slow {
                tokio::time::sleep(Duration::from_secs(30)).await;
                return false;
            }
            Some(port) != self.unreachable
        }
    }

    struct FakePreflight {
        valid: bool,
        events: Events,
    }

    impl Preflight for FakePreflight {
        fn validate(&self, _config: &ResolvedConfig) -> PathValidation {
            record(&self.events, "validate");
            if self.valid {
                PathValidation {
                    valid: true,
                    errors: vec![],
                }
            } else {
                PathValidation {
                    valid: false,
                    errors: vec![uverse_core::PathIssue {
                        key: "POSTGRES_DIR".to_string(),
                        message: "pg_ctl が見つかりません".to_string(),
                    }],
                }
            }
        }

        fn check(&self, candidates: &BTreeMap<String, String>, _base_dir: &Path) -> PathCheckReport {
            let errors: BTreeMap<String, String> = candidates
                .iter()
                .filter(|(_, v)| v.contains("bad"))
                .map(|(k, _)| (k.clone(), "存在しません".to_string()))
                .collect();
            PathCheckReport {
                valid: errors.is_empty(),
                errors,
            }
        }

        fn repair(&self, _config: &ResolvedConfig) {
            record(&self.events, "repair");
        }
    }

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        events: Events,
        _dir: tempfile::TempDir,
    }

    fn harness(configure: impl FnOnce(&mut Vec<FakeController>), unreachable: Option<u16>, valid: bool) -> Harness {
        harness_with(configure, unreachable, None, valid)
    }

    fn harness_with(
        configure: impl FnOnce(&mut Vec<FakeController>),
        unreachable: Option<u16>,
        slow: Option<u16>,
        valid: bool,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let events: Events = Arc::default();

        let mut fakes = vec![
            FakeController::new(ServiceKind::Database, 15432, &events),
            FakeController::new(ServiceKind::ObjectStore, 9000, &events),
            FakeController::new(ServiceKind::Backend, 8000, &events),
        ];
        configure(&mut fakes);
        let controllers: Vec<Arc<dyn ServiceController>> = fakes
            .into_iter()
            .map(|c| Arc::new(c) as Arc<dyn ServiceController>)
            .collect();

        let mut settings = SupervisorSettings::new(dir.path(), false);
        settings.restart_delay = Duration::from_millis(10);
        let context = SupervisorContext::new(
            settings,
            ConfigStore::new(dir.path().join(".env")),
            Arc::new(FakePreflight {
                valid,
                events: events.clone(),
            }),
        );
        let orchestrator = Orchestrator::new(
            context,
            controllers,
            Arc::new(FakeProbe {
                events: events.clone(),
                unreachable,
                slow,
            }),
            crate::platform::current_platform(),
        );

        Harness {
            orchestrator: Arc::new(orchestrator),
            events,
            _dir: dir,
        }
    }

    fn events(h: &Harness) -> Vec<String> {
        h.events.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_start_sequence_is_gated_by_probes() {
        let h = harness(|_| {}, None, true);

        assert_eq!(h.orchestrator.start_all().await, LifecycleStatus::Started);
        assert_eq!(
            events(&h),
            vec![
                "validate",
                "start:database",
                "probe:15432",
                "start:object-store",
                "probe:9000",
                "start:backend",
                "probe:8000",
            ]
        );

        let snapshot = h.orchestrator.snapshot();
        assert_eq!(snapshot.status, LifecycleStatus::Started);
        assert!(snapshot.services.iter().all(|s| s.running));
    }

    #[tokio::test]
    async fn test_backend_timeout_tears_down_started_services() {
        let h = harness(|_| {}, Some(8000), true);

        assert_eq!(h.orchestrator.start_all().await, LifecycleStatus::Failed);
        assert_eq!(count(&h.events, "stop:database:force"), 1);
        assert_eq!(count(&h.events, "stop:object-store:force"), 1);
        assert_eq!(count(&h.events, "stop:backend:force"), 1);

        // 逆順に停止
        let log = events(&h);
        let pos = |e: &str| log.iter().position(|x| x == e).unwrap();
        assert!(pos("stop:backend:force") < pos("stop:object-store:force"));
        assert!(pos("stop:object-store:force") < pos("stop:database:force"));

        let snapshot = h.orchestrator.snapshot();
        assert_eq!(snapshot.status, LifecycleStatus::Failed);
        assert!(snapshot.error.unwrap().contains("backend"));
        assert!(snapshot.services.iter().all(|s| !s.running));
    }

    #[tokio::test]
    async fn test_spawn_failure_stops_earlier_services() {
        let h = harness(|fakes| fakes[1].fail_start = true, None, true);

        assert_eq!(h.orchestrator.start_all().await, LifecycleStatus::Failed);
        let log = events(&h);
        assert!(!log.iter().any(|e| e == "start:backend"));
        assert!(!log.iter().any(|e| e == "probe:9000"));
        assert_eq!(count(&h.events, "stop:database:force"), 1);
        assert_eq!(count(&h.events, "stop:object-store:force"), 1);
    }

    #[tokio::test]
    async fn test_invalid_paths_prevent_start() {
        let h = harness(|_| {}, None, false);

        assert_eq!(h.orchestrator.start_all().await, LifecycleStatus::Failed);
        assert_eq!(events(&h), vec!["validate"]);

        let snapshot = h.orchestrator.snapshot();
        let check = snapshot.path_check.unwrap();
        assert!(!check.valid);
        assert_eq!(check.errors[0].key, "POSTGRES_DIR");
        assert!(snapshot.error.unwrap().contains("pg_ctl"));
    }

    #[tokio::test]
    async fn test_concurrent_requests_start_once() {
        let h = harness(
            |fakes| fakes[0].start_delay = Duration::from_millis(50),
            None,
            true,
        );

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let orchestrator = h.orchestrator.clone();
            tasks.push(tokio::spawn(async move { orchestrator.request_start() }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let snapshot = h.orchestrator.wait_for_start().await;
        assert_eq!(snapshot.status, LifecycleStatus::Started);
        assert_eq!(count(&h.events, "start:database"), 1);
        assert_eq!(count(&h.events, "start:backend"), 1);

        // started 中の要求は何もしない
        assert_eq!(h.orchestrator.request_start(), LifecycleStatus::Started);
        assert_eq!(h.orchestrator.start_all().await, LifecycleStatus::Started);
        assert_eq!(count(&h.events, "start:database"), 1);
    }

    #[tokio::test]
    async fn test_request_start_from_failed_restarts_all() {
        let h = harness(|_| {}, None, false);
        assert_eq!(h.orchestrator.start_all().await, LifecycleStatus::Failed);

        assert_eq!(h.orchestrator.request_start(), LifecycleStatus::Starting);
        let snapshot = h.orchestrator.wait_for_start().await;
        assert_eq!(snapshot.status, LifecycleStatus::Failed);
        assert_eq!(count(&h.events, "validate"), 2);
    }

    #[tokio::test]
    async fn test_stop_all_is_reverse_order_and_returns_to_idle() {
        let h = harness(|_| {}, None, true);
        h.orchestrator.start_all().await;
        h.events.lock().unwrap().clear();

        h.orchestrator.stop_all().await;
        assert_eq!(
            events(&h),
            vec![
                "stop:backend:graceful",
                "stop:object-store:graceful",
                "stop:database:graceful",
            ]
        );
        assert_eq!(h.orchestrator.status(), LifecycleStatus::Idle);

        // idle からは再び起動できる
        assert_eq!(h.orchestrator.start_all().await, LifecycleStatus::Started);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_during_startup_is_bounded() {
        let h = harness_with(|_| {}, None, Some(9000), true);

        assert_eq!(h.orchestrator.request_start(), LifecycleStatus::Starting);
        // object-store の準備待ちに入るまで進める
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.orchestrator.status(), LifecycleStatus::Starting);
        assert_eq!(count(&h.events, "probe:9000"), 1);

        let started = tokio::time::Instant::now();
        h.orchestrator.stop_all().await;
        assert!(started.elapsed() < SHUTDOWN_BUDGET, "took {:?}", started.elapsed());

        let snapshot = h.orchestrator.wait_for_start().await;
        assert_eq!(snapshot.status, LifecycleStatus::Idle);
        assert!(snapshot.services.iter().all(|s| !s.running));
        assert!(!events(&h).iter().any(|e| e == "start:backend"));

        // 打ち切られた起動が後から状態を書き換えない
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.orchestrator.status(), LifecycleStatus::Idle);

        // 停止後は再び起動できる
        assert_eq!(h.orchestrator.request_start(), LifecycleStatus::Starting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_during_restart_is_bounded() {
        let h = harness_with(|_| {}, None, Some(8000), true);

        let orchestrator = h.orchestrator.clone();
        let restart = tokio::spawn(async move { orchestrator.restart_service(ServiceKind::Backend).await });
        tokio::time::sleep(Duration::from_secs(1)).await;

        let started = tokio::time::Instant::now();
        h.orchestrator.stop_all().await;
        assert!(started.elapsed() < SHUTDOWN_BUDGET);

        let err = restart.await.unwrap().unwrap_err();
        assert!(matches!(err, RuntimeError::Cancelled(_)));
        assert!(!h.orchestrator.snapshot().services.iter().any(|s| s.running));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_graceful_stop_is_forced_after_budget() {
        let h = harness(|fakes| fakes[2].hang_on_graceful = true, None, true);
        h.orchestrator.start_all().await;
        h.events.lock().unwrap().clear();

        let started = tokio::time::Instant::now();
        h.orchestrator.stop_all().await;
        let elapsed = started.elapsed();
        assert!(elapsed >= SHUTDOWN_BUDGET);
        assert!(elapsed < SHUTDOWN_BUDGET + Duration::from_secs(1), "took {:?}", elapsed);

        // backend のグレースフル停止で止まったまま期限切れ、残りは強制停止
        let log = events(&h);
        assert_eq!(log[0], "stop:backend:graceful");
        assert!(!log.iter().any(|e| e == "stop:database:graceful"));
        assert_eq!(count(&h.events, "stop:backend:force"), 1);
        assert_eq!(count(&h.events, "stop:object-store:force"), 1);
        assert_eq!(count(&h.events, "stop:database:force"), 1);

        let snapshot = h.orchestrator.snapshot();
        assert_eq!(snapshot.status, LifecycleStatus::Idle);
        assert!(snapshot.services.iter().all(|s| !s.running));
    }

    #[tokio::test]
    async fn test_disabled_database_is_skipped() {
        let h = harness(|fakes| fakes[0].needs_embedded_db = true, None, true);
        let outcome = h
            .orchestrator
            .update_config(BTreeMap::from([(
                "USE_EMBEDDED_PG".to_string(),
                "false".to_string(),
            )]))
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Saved);

        assert_eq!(h.orchestrator.start_all().await, LifecycleStatus::Started);
        let log = events(&h);
        assert!(!log.iter().any(|e| e == "start:database" || e == "probe:15432"));
        assert_eq!(count(&h.events, "start:backend"), 1);
    }

    #[tokio::test]
    async fn test_restart_service() {
        let h = harness(|_| {}, None, true);
        h.orchestrator.start_all().await;
        h.events.lock().unwrap().clear();

        h.orchestrator.restart_service(ServiceKind::ObjectStore).await.unwrap();
        assert_eq!(
            events(&h),
            vec!["stop:object-store:graceful", "start:object-store", "probe:9000"]
        );
        assert_eq!(h.orchestrator.status(), LifecycleStatus::Started);
    }

    #[tokio::test]
    async fn test_restart_service_timeout_reports_error() {
        let h = harness(|_| {}, Some(8000), true);

        let err = h.orchestrator.restart_service(ServiceKind::Backend).await.unwrap_err();
        assert!(matches!(err, RuntimeError::ServiceWaitTimeout { port: 8000, .. }));
        assert!(h.orchestrator.snapshot().error.is_some());
    }

    #[tokio::test]
    async fn test_update_config_rejects_bad_paths() {
        let h = harness(|_| {}, None, true);
        let env = h.orchestrator.context().store.path().to_path_buf();

        let outcome = h
            .orchestrator
            .update_config(BTreeMap::from([
                ("PORT".to_string(), "8100".to_string()),
                ("MODELS_DIR".to_string(), "bad/models".to_string()),
            ]))
            .await
            .unwrap();

        match outcome {
            UpdateOutcome::Rejected(errors) => assert!(errors.contains_key("MODELS_DIR")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!env.exists());
        assert_eq!(h.orchestrator.config().ports.backend, 8000);
    }

    #[tokio::test]
    async fn test_update_config_persists_and_swaps() {
        let h = harness(|_| {}, None, true);

        let outcome = h
            .orchestrator
            .update_config(BTreeMap::from([("PORT".to_string(), "8100".to_string())]))
            .await
            .unwrap();

        assert_eq!(outcome, UpdateOutcome::Saved);
        assert_eq!(h.orchestrator.config().ports.backend, 8100);
        assert_eq!(count(&h.events, "repair"), 1);
        let text = std::fs::read_to_string(h.orchestrator.context().store.path()).unwrap();
        assert_eq!(text, "PORT=8100\n");
    }
}
