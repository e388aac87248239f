use super::Session;
use crate::control::{self, ControlState};
use anyhow::Context;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use uverse_core::ValidateOptions;
use uverse_runtime::{
    Orchestrator, PathPreflight, SessionLog, SupervisorContext, SupervisorSettings, TcpPortProbe,
    current_platform, default_controllers,
};

/// プロセス終了時に取りこぼしたサービスを名前で終了させる
struct ExitGuard(Arc<Orchestrator>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.emergency_sweep();
    }
}

enum ExitReason {
    Signal,
    Requested,
    Fatal,
}

fn build_orchestrator(session: Session) -> Orchestrator {
    let platform = current_platform();
    let settings = SupervisorSettings::new(session.base_dir, session.packaged);
    let preflight = PathPreflight::new(ValidateOptions {
        packaged: session.packaged,
    });
    let context = SupervisorContext::new(settings, session.store, Arc::new(preflight));
    Orchestrator::new(
        context,
        default_controllers(platform.clone(), session.packaged),
        Arc::new(TcpPortProbe::new()),
        platform,
    )
}

pub async fn handle(
    session: Session,
    log: SessionLog,
    control_port: u16,
    autostart: bool,
) -> anyhow::Result<()> {
    tracing::info!(
        "Uverse supervisor {} (base: {}, config: {}, packaged: {})",
        env!("CARGO_PKG_VERSION"),
        session.base_dir.display(),
        session.store.path().display(),
        session.packaged
    );

    let orchestrator = Arc::new(build_orchestrator(session));
    let guard = ExitGuard(orchestrator.clone());

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, control_port))
        .await
        .with_context(|| format!("コントロール API のポート {} を使用できません", control_port))?;
    tracing::info!("Control API listening on http://{}", listener.local_addr()?);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let state = ControlState::new(orchestrator.clone(), shutdown_tx.clone(), Some(log));
    let server = tokio::spawn(control::serve(listener, state, shutdown_rx.clone()));

    if autostart {
        orchestrator.request_start();
    }

    let mut fatal = orchestrator.fatal_signal();
    let reason = tokio::select! {
        _ = shutdown_signal() => ExitReason::Signal,
        _ = shutdown_rx.wait_for(|stop| *stop) => ExitReason::Requested,
        _ = fatal.wait_for(|fatal| *fatal) => ExitReason::Fatal,
    };

    match reason {
        ExitReason::Fatal => {
            tracing::error!("Supervisor failed unexpectedly, forcing shutdown");
            orchestrator.force_stop_all().await;
            shutdown_tx.send_replace(true);
            drop(guard);
            std::process::exit(1);
        }
        ExitReason::Signal => tracing::info!("Received shutdown signal"),
        ExitReason::Requested => {}
    }

    // 停止中にもう一度シグナルを受けたら待たずに強制停止する
    tokio::select! {
        _ = orchestrator.stop_all() => {}
        _ = shutdown_signal() => {
            tracing::warn!("Received second shutdown signal, forcing");
            orchestrator.force_stop_all().await;
        }
    }
    shutdown_tx.send_replace(true);
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Control API stopped with error: {}", e),
        Err(e) => tracing::warn!("Control API task failed: {}", e),
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Ctrl-C / SIGTERM（Windows ではコンソールのクローズ）を待つ
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(windows)]
    let terminate = async {
        match tokio::signal::windows::ctrl_close() {
            Ok(mut close) => {
                close.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for console close: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(any(unix, windows)))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
