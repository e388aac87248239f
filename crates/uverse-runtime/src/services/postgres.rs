//! 組み込み PostgreSQL

use crate::controller::{ServiceController, cleanup_stale_processes};
use crate::error::{Result, RuntimeError};
use crate::platform::Platform;
use crate::process::{GracefulStop, ManagedProcess};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use uverse_config::ResolvedConfig;
use uverse_core::ServiceKind;

pub const DATABASE_READY_TIMEOUT: Duration = Duration::from_secs(30);

const LOOPBACK: &str = "127.0.0.1";

const HBA_CONF: &str = "\
# TYPE  DATABASE        USER            ADDRESS                 METHOD
local   all             all                                     trust
host    all             all             127.0.0.1/32            trust
host    all             all             ::1/128                 trust
";

/// PostgreSQL のディレクトリ構成
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresLayout {
    pub bin_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl PostgresLayout {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            bin_dir: config.paths.postgres_dir.join("bin"),
            data_dir: config.paths.postgres_dir.join("data"),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.data_dir.join("PG_VERSION").exists()
    }
}

pub struct PostgresController {
    platform: Arc<dyn Platform>,
    process: ManagedProcess,
    layout: Mutex<Option<PostgresLayout>>,
}

impl PostgresController {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            process: ManagedProcess::new(ServiceKind::Database.as_str(), platform.clone()),
            platform,
            layout: Mutex::new(None),
        }
    }

    fn executable(&self, layout: &PostgresLayout, name: &str) -> PathBuf {
        layout.bin_dir.join(self.platform.executable_name(name))
    }

    fn current_layout(&self) -> Option<PostgresLayout> {
        self.layout.lock().ok().and_then(|l| l.clone())
    }

    /// データベースクラスタを初期化する（初回のみ）
    async fn init_cluster(&self, layout: &PostgresLayout, config: &ResolvedConfig) -> Result<()> {
        tracing::info!("Initializing PostgreSQL cluster at {}", layout.data_dir.display());
        std::fs::create_dir_all(&layout.data_dir)?;

        let initdb = self.executable(layout, "initdb");
        let mut cmd = Command::new(&initdb);
        cmd.arg("-D")
            .arg(&layout.data_dir)
            .arg("-U")
            .arg(&config.database.user)
            .args(["--encoding=UTF8", "--locale=C", "--lc-collate=C", "--lc-ctype=C"])
            .env("LC_ALL", "C")
            .current_dir(&layout.bin_dir);
        run_checked(cmd, "initdb").await?;

        std::fs::write(layout.data_dir.join("pg_hba.conf"), HBA_CONF)?;
        tracing::info!("Configured pg_hba.conf for local trust authentication");
        Ok(())
    }

    fn psql(&self, layout: &PostgresLayout, config: &ResolvedConfig, database: &str) -> Command {
        let mut cmd = Command::new(self.executable(layout, "psql"));
        cmd.arg("-h")
            .arg(LOOPBACK)
            .arg("-p")
            .arg(config.ports.database.to_string())
            .arg("-U")
            .arg(&config.database.user)
            .arg("-d")
            .arg(database)
            .env("PGPASSWORD", &config.database.password)
            .current_dir(&layout.bin_dir);
        cmd
    }
}

#[async_trait]
impl ServiceController for PostgresController {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Database
    }

    fn port(&self, config: &ResolvedConfig) -> u16 {
        config.ports.database
    }

    fn readiness_timeout(&self) -> Duration {
        DATABASE_READY_TIMEOUT
    }

    fn is_enabled(&self, config: &ResolvedConfig) -> bool {
        config.database.embedded
    }

    async fn start(&self, config: &ResolvedConfig) -> Result<()> {
        let layout = PostgresLayout::from_config(config);
        if let Ok(mut slot) = self.layout.lock() {
            *slot = Some(layout.clone());
        }

        if !layout.is_initialized() {
            self.init_cluster(&layout, config).await?;
        }
        configure_server(&layout.data_dir, config.ports.database)?;

        let mut cmd = Command::new(self.executable(&layout, "postgres"));
        cmd.arg("-D")
            .arg(&layout.data_dir)
            .arg("-p")
            .arg(config.ports.database.to_string())
            .env("LC_ALL", "C")
            .current_dir(&layout.bin_dir);
        self.process.spawn(cmd)?;
        Ok(())
    }

    /// アプリ用データベースを作成し、初回は init.sql を流す
    async fn after_ready(&self, config: &ResolvedConfig) -> Result<()> {
        let layout = PostgresLayout::from_config(config);
        let name = &config.database.name;

        let mut exists = self.psql(&layout, config, "postgres");
        exists.arg("-tAc").arg(format!(
            "SELECT 1 FROM pg_database WHERE datname = '{}'",
            name.replace('\'', "''")
        ));
        let out = run_checked(exists, "psql").await?;
        if String::from_utf8_lossy(&out).trim() == "1" {
            tracing::debug!("Database {} already exists", name);
            return Ok(());
        }

        tracing::info!("Creating database {}", name);
        let mut create = self.psql(&layout, config, "postgres");
        create
            .arg("-c")
            .arg(format!("CREATE DATABASE \"{}\"", name.replace('"', "\"\"")));
        run_checked(create, "psql").await?;

        let init_sql = config.base_dir.join("init.sql");
        if init_sql.is_file() {
            tracing::info!("Running {}", init_sql.display());
            let mut init = self.psql(&layout, config, name);
            init.arg("-f").arg(&init_sql);
            run_checked(init, "psql").await?;
        }
        Ok(())
    }

    async fn stop(&self, force: bool) -> Result<()> {
        let layout = self.current_layout();
        let graceful = match &layout {
            Some(layout) => {
                let mut cmd = Command::new(self.executable(layout, "pg_ctl"));
                cmd.arg("stop")
                    .arg("-D")
                    .arg(&layout.data_dir)
                    .args(["-m", "fast"])
                    .current_dir(&layout.bin_dir);
                GracefulStop::Command(cmd)
            }
            None => GracefulStop::Signal,
        };
        let sweep = layout.map(|l| self.executable(&l, "postgres").display().to_string());
        self.process.stop(force, graceful, sweep.as_deref()).await
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
            config.ports.database,
        )
        .await;
    }

    fn sweep_pattern(&self, config: &ResolvedConfig) -> Option<String> {
        let layout = PostgresLayout::from_config(config);
        Some(self.executable(&layout, "postgres").display().to_string())
    }
}

/// コマンドを実行し、失敗ならエラーにする（標準出力を返す）
async fn run_checked(mut cmd: Command, label: &str) -> Result<Vec<u8>> {
    tracing::debug!("Running: {:?}", cmd.as_std());
    let output = cmd.output().await.map_err(|e| RuntimeError::CommandFailed {
        command: label.to_string(),
        message: e.to_string(),
    })?;
    if !output.status.success() {
        return Err(RuntimeError::CommandFailed {
            command: label.to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

/// `postgresql.conf` のポートと待ち受けアドレスを設定する
fn configure_server(data_dir: &Path, port: u16) -> Result<()> {
    let path = data_dir.join("postgresql.conf");
    let current = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    let updated = apply_server_settings(&current, port);
    if updated != current {
        std::fs::write(&path, updated)?;
        tracing::info!("Configured postgresql.conf (port {})", port);
    }
    Ok(())
}

fn apply_server_settings(text: &str, port: u16) -> String {
    let settings = [
        ("port", port.to_string()),
        ("listen_addresses", format!("'{}'", LOOPBACK)),
    ];
    let mut found = [false; 2];

    let mut lines: Vec<String> = text
        .lines()
        .map(|line| {
            let setting = line
                .split_once('=')
                .map(|(key, _)| key.trim())
                .and_then(|key| settings.iter().position(|(name, _)| *name == key));
            match setting {
                Some(i) => {
                    found[i] = true;
                    format!("{} = {}", settings[i].0, settings[i].1)
                }
                None => line.to_string(),
            }
        })
        .collect();

    for (i, (name, value)) in settings.iter().enumerate() {
        if !found[i] {
            lines.push(format!("{} = {}", name, value));
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}
