//! In-process backend: the service runs as a plain foreground process.
//!
//! SIGTERM/SIGINT (Ctrl+C elsewhere) stop it, SIGHUP reloads it. The
//! supervision loop also ends when the lifecycle reaches a finished state by
//! other means, e.g. a `stop` sent over the terminal relay.

use super::{
    BackendContext, BackendFactory, ServiceBackend, ServiceControl, ServiceStatus,
};
use crate::error::{BackendError, Result, ServiceError};
use crate::lifecycle::{LifecycleCore, LifecycleState};
use crate::terminal::{Endpoints, TerminalClient};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

const BACKEND_NAME: &str = "standard";

pub struct StandardFactory;

impl BackendFactory for StandardFactory {
    fn create_backend(
        &self,
        ctx: BackendContext,
    ) -> std::result::Result<Box<dyn ServiceBackend>, BackendError> {
        Ok(Box::new(StandardBackend::new(ctx.core)))
    }

    fn create_control(
        &self,
        service_id: String,
    ) -> std::result::Result<Box<dyn ServiceControl>, BackendError> {
        Ok(Box::new(StandardControl::new(service_id)))
    }
}

pub struct StandardBackend {
    core: Arc<LifecycleCore>,
    quit: Notify,
    reload: Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalAction {
    Stop,
    Reload,
}

impl StandardBackend {
    pub fn new(core: Arc<LifecycleCore>) -> Self {
        Self {
            core,
            quit: Notify::new(),
            reload: Notify::new(),
        }
    }

    async fn request_stop(&self) {
        match self.core.stop().await {
            Ok(outcome) if outcome.result.is_completed() => {}
            Ok(outcome) => info!(result = %outcome.result, "Stop not completed, service keeps running"),
            Err(e) => warn!(error = %e, "Stop request rejected"),
        }
    }

    async fn request_reload(&self) {
        if let Err(e) = self.core.reload().await {
            warn!(error = %e, "Reload request rejected");
        }
    }
}

#[async_trait]
impl ServiceBackend for StandardBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    async fn run_service(&self, _args: &[String]) -> i32 {
        info!("Starting service");
        match self.core.start().await {
            Ok(outcome) if outcome.result.is_completed() => {}
            Ok(outcome) => {
                error!(result = %outcome.result, "Service failed to start");
                return failure_code(self.core.exit_code());
            }
            Err(e) => {
                error!(error = %e, "Service failed to start");
                return failure_code(self.core.exit_code());
            }
        }

        let mut states = self.core.subscribe();
        let mut signals = Signals::new();
        info!("Service running");

        while !self.core.state().is_finished() {
            tokio::select! {
                action = signals.recv() => match action {
                    SignalAction::Stop => self.request_stop().await,
                    SignalAction::Reload => self.request_reload().await,
                },
                _ = self.quit.notified() => self.request_stop().await,
                _ = self.reload.notified() => self.request_reload().await,
                change = states.recv() => {
                    if change.is_none() {
                        break;
                    }
                }
            }
        }

        let state = self.core.state();
        let code = match state {
            LifecycleState::Failed => failure_code(self.core.exit_code()),
            _ => self.core.exit_code(),
        };
        info!(exit_code = code, state = %state, "Service finished");
        code
    }

    fn quit_service(&self) {
        self.quit.notify_one();
    }

    fn reload_service(&self) {
        self.reload.notify_one();
    }
}

fn failure_code(recorded: i32) -> i32 {
    if recorded == 0 {
        1
    } else {
        recorded
    }
}

#[cfg(unix)]
struct Signals {
    terminate: Option<tokio::signal::unix::Signal>,
    interrupt: Option<tokio::signal::unix::Signal>,
    hangup: Option<tokio::signal::unix::Signal>,
}

#[cfg(unix)]
impl Signals {
    fn new() -> Self {
        use tokio::signal::unix::{signal, SignalKind};
        let install = |kind: SignalKind, label: &str| match signal(kind) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(signal = label, error = %e, "Failed to install signal handler");
                None
            }
        };
        Self {
            terminate: install(SignalKind::terminate(), "SIGTERM"),
            interrupt: install(SignalKind::interrupt(), "SIGINT"),
            hangup: install(SignalKind::hangup(), "SIGHUP"),
        }
    }

    async fn recv(&mut self) -> SignalAction {
        tokio::select! {
            Some(()) = recv_opt(&mut self.terminate) => {
                info!("Received SIGTERM");
                SignalAction::Stop
            }
            Some(()) = recv_opt(&mut self.interrupt) => {
                info!("Received SIGINT");
                SignalAction::Stop
            }
            Some(()) = recv_opt(&mut self.hangup) => {
                info!("Received SIGHUP");
                SignalAction::Reload
            }
        }
    }
}

#[cfg(unix)]
async fn recv_opt(signal: &mut Option<tokio::signal::unix::Signal>) -> Option<()> {
    match signal {
        Some(signal) => signal.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn new() -> Self {
        Signals
    }

    async fn recv(&mut self) -> SignalAction {
        loop {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C");
                return SignalAction::Stop;
            }
            std::future::pending::<()>().await;
        }
    }
}

/// Controls a standard-backend service through its terminal relay
pub struct StandardControl {
    service_id: String,
    endpoints: Endpoints,
}

impl StandardControl {
    pub fn new(service_id: String) -> Self {
        let endpoints = Endpoints::for_service(&service_id);
        Self::with_endpoints(service_id, endpoints)
    }

    pub fn with_endpoints(service_id: String, endpoints: Endpoints) -> Self {
        Self {
            service_id,
            endpoints,
        }
    }

    async fn send(&self, kind: &str) -> Result<()> {
        let mut client = TerminalClient::connect(&self.endpoints)
            .await
            .map_err(|_| ServiceError::NotReachable(self.service_id.clone()))?;
        let outcome = client.command(kind, Vec::new()).await?;
        if outcome.result.is_completed() {
            Ok(())
        } else {
            Err(ServiceError::Remote(format!("{} {}", kind, outcome.result)))
        }
    }
}

#[async_trait]
impl ServiceControl for StandardControl {
    fn backend(&self) -> &str {
        BACKEND_NAME
    }

    fn service_id(&self) -> &str {
        &self.service_id
    }

    async fn status(&self) -> ServiceStatus {
        match TerminalClient::connect(&self.endpoints).await {
            Ok(client) => match client.state() {
                LifecycleState::Running | LifecycleState::Resuming | LifecycleState::Starting => {
                    ServiceStatus::Running
                }
                LifecycleState::Paused | LifecycleState::Pausing => ServiceStatus::Paused,
                LifecycleState::Failed => ServiceStatus::Errored,
                LifecycleState::Created | LifecycleState::Stopping | LifecycleState::Stopped => {
                    ServiceStatus::Stopped
                }
            },
            Err(_) if !self.endpoints.local.exists() && !self.endpoints.global.exists() => {
                ServiceStatus::Stopped
            }
            Err(_) => ServiceStatus::Unknown,
        }
    }

    /// Launch the current executable detached under this backend.
    async fn start(&self) -> Result<()> {
        let exe = std::env::current_exe()?;
        debug!(exe = %exe.display(), service = %self.service_id, "Spawning service process");
        tokio::process::Command::new(exe)
            .args(["--backend", BACKEND_NAME])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.send("stop").await
    }

    async fn reload(&self) -> Result<()> {
        self.send("reload").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::machine::tests::ScriptedHooks;
    use crate::lifecycle::CommandResult;
    use std::time::Duration;

    #[tokio::test]
    async fn test_quit_stops_and_returns_exit_code() {
        let core = LifecycleCore::new(Arc::new(ScriptedHooks::default().stop_exit_code(4)));
        let backend = Arc::new(StandardBackend::new(Arc::clone(&core)));

        let runner = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move { backend.run_service(&[]).await })
        };
        backend.quit_service();

        let code = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, 4);
        assert_eq!(core.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_failed_start_returns_failure() {
        let core = LifecycleCore::new(Arc::new(
            ScriptedHooks::default().returning("start", CommandResult::failed("no port")),
        ));
        let backend = StandardBackend::new(Arc::clone(&core));
        assert_eq!(backend.run_service(&[]).await, 1);
        assert_eq!(core.state(), LifecycleState::Failed);
    }

    #[tokio::test]
    async fn test_external_stop_ends_supervision() {
        let core = LifecycleCore::new(Arc::new(ScriptedHooks::default()));
        let backend = Arc::new(StandardBackend::new(Arc::clone(&core)));
        let runner = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move { backend.run_service(&[]).await })
        };

        while core.state() != LifecycleState::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        core.stop().await.unwrap();

        let code = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_denied_quit_keeps_running() {
        let core = LifecycleCore::new(Arc::new(
            ScriptedHooks::default().returning("stop", CommandResult::Denied),
        ));
        let backend = Arc::new(StandardBackend::new(Arc::clone(&core)));
        let runner = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move { backend.run_service(&[]).await })
        };

        backend.quit_service();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(core.state(), LifecycleState::Running);
        assert!(!runner.is_finished());

        core.fail("test teardown").await;
        let code = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, 1);
    }

    #[tokio::test]
    async fn test_runtime_failure_exits_non_zero() {
        let core = LifecycleCore::new(Arc::new(ScriptedHooks::default()));
        let backend = Arc::new(StandardBackend::new(Arc::clone(&core)));
        let runner = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move { backend.run_service(&[]).await })
        };

        while core.state() != LifecycleState::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        core.fail("unrecoverable").await;

        let code = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(code, 0);
        assert_eq!(core.state(), LifecycleState::Failed);
    }

    #[tokio::test]
    async fn test_control_reports_stopped_without_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let control = StandardControl::with_endpoints(
            "svcA".to_string(),
            Endpoints::in_dir(dir.path(), "svcA"),
        );
        assert_eq!(control.status().await, ServiceStatus::Stopped);
        assert!(matches!(
            control.stop().await,
            Err(ServiceError::NotReachable(_))
        ));
    }
}
