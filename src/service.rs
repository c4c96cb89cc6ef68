//! Process-wide service owner
//!
//! Ties the lifecycle core, the backend registry and the terminal relay
//! together and picks between supervised and terminal-attach mode.

use crate::backend::{BackendContext, BackendRegistry, RawSocket, ServiceBackend};
use crate::cmd_attach;
use crate::error::{Result, ServiceError};
use crate::lifecycle::{LifecycleCore, ServiceHooks, StateChange, Value};
use crate::runtime_dir;
use crate::service_config::ServiceConfig;
use crate::terminal::{Endpoints, TerminalClient, TerminalMode, TerminalServer};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Connection attempts after asking the backend to start the service
const START_RETRIES: u32 = 20;
const START_RETRY_DELAY: Duration = Duration::from_millis(250);

static INSTANCE: StdMutex<Option<Weak<Service>>> = StdMutex::new(None);

/// What the process entry point parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    pub backend: String,
    /// Attach to a running instance instead of running the service
    pub terminal: bool,
    pub args: Vec<String>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            backend: crate::clienv::DEFAULT_BACKEND.to_string(),
            terminal: false,
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct TerminalSettings {
    active: bool,
    mode: TerminalMode,
    global: bool,
    start_with_terminal: bool,
}

pub struct Service {
    name: String,
    core: Arc<LifecycleCore>,
    registry: Arc<BackendRegistry>,
    relay: TerminalServer,
    terminal: StdMutex<TerminalSettings>,
    backend: StdMutex<Option<Arc<dyn ServiceBackend>>>,
}

impl Service {
    /// Create the process's only service. Fails while another instance is
    /// alive.
    pub fn new(
        name: impl Into<String>,
        hooks: Arc<dyn ServiceHooks>,
        registry: BackendRegistry,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        let endpoints = Endpoints::for_service(&name);
        Self::with_endpoints(name, hooks, registry, endpoints)
    }

    pub fn with_endpoints(
        name: impl Into<String>,
        hooks: Arc<dyn ServiceHooks>,
        registry: BackendRegistry,
        endpoints: Endpoints,
    ) -> Result<Arc<Self>> {
        let mut slot = INSTANCE.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().and_then(Weak::upgrade).is_some() {
            return Err(ServiceError::AlreadyInstantiated);
        }

        let name = name.into();
        let core = LifecycleCore::new(hooks);
        let relay = TerminalServer::with_endpoints(name.clone(), Arc::clone(&core), endpoints);
        let service = Arc::new(Self {
            name,
            core,
            registry: Arc::new(registry),
            relay,
            terminal: StdMutex::new(TerminalSettings::default()),
            backend: StdMutex::new(None),
        });
        *slot = Some(Arc::downgrade(&service));

        debug!(service = %service.name, "Service instance created");
        Ok(service)
    }

    /// The live instance, if any
    pub fn instance() -> Option<Arc<Service>> {
        INSTANCE
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleCore> {
        &self.core
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn relay(&self) -> &TerminalServer {
        &self.relay
    }

    pub fn endpoints(&self) -> &Endpoints {
        self.relay.endpoints()
    }

    pub fn runtime_dir(&self) -> PathBuf {
        runtime_dir::runtime_dir(&self.name)
    }

    pub fn add_callback<F>(&self, kind: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        self.core.add_callback(kind, handler)
    }

    /// Take the terminal settings from a loaded config file. The relay starts
    /// once the service is running.
    pub fn apply_config(&self, config: &ServiceConfig) {
        let mut settings = self.settings_mut();
        settings.active = config.terminal.active;
        settings.mode = config.terminal.mode;
        settings.global = config.terminal.global;
        settings.start_with_terminal = config.terminal.start_with_terminal;
        drop(settings);
        self.relay.set_mode(config.terminal.mode);
    }

    /// Run the service in the mode `options` selects; returns the process
    /// exit code.
    pub async fn exec(self: &Arc<Self>, options: LaunchOptions) -> i32 {
        info!(
            service = %self.name,
            backend = %options.backend,
            terminal = options.terminal,
            "Launching service"
        );

        if options.terminal {
            return self.run_attached(&options.backend, &options.args).await;
        }

        let ctx = BackendContext {
            service_name: self.name.clone(),
            core: Arc::clone(&self.core),
        };
        let backend: Arc<dyn ServiceBackend> = match self.registry.find_backend(&options.backend, ctx)
        {
            Ok(backend) => Arc::from(backend),
            Err(e) => {
                error!(backend = %options.backend, error = %e, "Failed to resolve service backend");
                return 1;
            }
        };
        *self.backend.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&backend));

        let watcher = self.spawn_state_watcher();
        let code = BackendRegistry::run_supervised(backend.as_ref(), &options.args).await;

        watcher.abort();
        let _ = watcher.await;
        self.relay.stop().await;
        self.backend
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        info!(service = %self.name, exit_code = code, "Service exited");
        code
    }

    /// Forward every state change to the backend and start or stop the relay
    /// with the lifecycle.
    fn spawn_state_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let mut states = self.core.subscribe();
        let service = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(change) = states.recv().await {
                let Some(service) = service.upgrade() else {
                    break;
                };
                service.on_state_changed(change).await;
            }
        })
    }

    async fn on_state_changed(&self, change: StateChange) {
        if let Some(backend) = self.current_backend() {
            backend.state_changed(&change);
        }

        if change.to.is_running() {
            let settings = self.settings();
            if settings.active && !self.relay.is_running() {
                let started = self.relay.start(settings.global).await;
                self.settings_mut().active = started;
            }
        } else if change.to.is_finished() {
            self.relay.stop().await;
        }
    }

    async fn run_attached(&self, backend: &str, args: &[String]) -> i32 {
        if !self.terminal_active() {
            let e = ServiceError::TerminalDisabled(self.name.clone());
            error!(error = %e, "Cannot attach to service");
            return 1;
        }

        let client = match self.connect_terminal(backend).await {
            Ok(client) => client,
            Err(e) => {
                error!(service = %self.name, error = %e, "Failed to attach to service");
                return 1;
            }
        };

        match cmd_attach::cmd_attach(client, args).await {
            Ok(code) => code,
            Err(e) => {
                error!(error = %e, "Terminal session failed");
                1
            }
        }
    }

    async fn connect_terminal(&self, backend: &str) -> Result<TerminalClient> {
        let first = match TerminalClient::connect(self.endpoints()).await {
            Ok(client) => return Ok(client),
            Err(e) => e,
        };
        if !nothing_listening(&first) {
            // An instance is there but refused or dropped the terminal
            return Err(first);
        }
        if !self.start_with_terminal() {
            debug!(error = %first, "Service not reachable");
            return Err(ServiceError::NotReachable(self.name.clone()));
        }

        let service_id = self.registry.current_service_id(backend, &self.name)?;
        let control = self.registry.create_control(backend, service_id)?;
        info!(service = %self.name, backend = %backend, "Service not running, starting it");
        control.start().await?;

        for attempt in 1..=START_RETRIES {
            tokio::time::sleep(START_RETRY_DELAY).await;
            match TerminalClient::connect(self.endpoints()).await {
                Ok(client) => return Ok(client),
                Err(e) => debug!(attempt, error = %e, "Waiting for service terminal"),
            }
        }
        Err(ServiceError::NotReachable(self.name.clone()))
    }

    pub fn terminal_active(&self) -> bool {
        self.settings().active
    }

    /// Enable or disable the relay. Returns whether the setting changed; an
    /// enable that fails to bind leaves it disabled.
    pub async fn set_terminal_active(&self, active: bool) -> bool {
        let settings = self.settings();
        if settings.active == active {
            return false;
        }

        if !active {
            self.settings_mut().active = false;
            self.relay.stop().await;
            return true;
        }

        let started = if self.core.state().is_running() {
            self.relay.start(settings.global).await
        } else {
            true
        };
        self.settings_mut().active = started;
        started
    }

    pub fn terminal_mode(&self) -> TerminalMode {
        self.settings().mode
    }

    pub fn set_terminal_mode(&self, mode: TerminalMode) {
        let mut settings = self.settings_mut();
        if settings.mode == mode {
            return;
        }
        settings.mode = mode;
        drop(settings);
        self.relay.set_mode(mode);
    }

    pub fn global_terminal(&self) -> bool {
        self.settings().global
    }

    /// Takes effect on the next relay start.
    pub fn set_global_terminal(&self, global: bool) {
        let mut settings = self.settings_mut();
        if settings.global == global {
            return;
        }
        settings.global = global;
        drop(settings);
        if self.relay.is_running() {
            warn!("Terminal scope changed while the terminal server is listening - restart the terminal to apply it");
        }
    }

    pub fn start_with_terminal(&self) -> bool {
        self.settings().start_with_terminal
    }

    pub fn set_start_with_terminal(&self, start: bool) {
        self.settings_mut().start_with_terminal = start;
    }

    /// Sockets the service manager handed over under `name`
    pub fn sockets(&self, name: &str) -> Vec<RawSocket> {
        self.current_backend()
            .map(|backend| backend.activated_sockets(name))
            .unwrap_or_default()
    }

    /// The single default activated socket, if any
    pub fn socket(&self) -> Option<RawSocket> {
        let sockets = self.sockets("");
        if sockets.len() > 1 {
            warn!(count = sockets.len(), "Multiple activated sockets, using the first");
        }
        sockets.first().copied()
    }

    /// Ask the backend to stop the service
    pub fn quit(&self) {
        match self.current_backend() {
            Some(backend) => backend.quit_service(),
            None => warn!("Quit requested but no backend is running"),
        }
    }

    pub fn reload(&self) {
        match self.current_backend() {
            Some(backend) => backend.reload_service(),
            None => warn!("Reload requested but no backend is running"),
        }
    }

    fn current_backend(&self) -> Option<Arc<dyn ServiceBackend>> {
        self.backend
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn settings(&self) -> TerminalSettings {
        *self.terminal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settings_mut(&self) -> std::sync::MutexGuard<'_, TerminalSettings> {
        self.terminal.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Connect errors that mean no instance owns the endpoint
fn nothing_listening(err: &ServiceError) -> bool {
    match err {
        ServiceError::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendFactory, ServiceControl};
    use crate::error::BackendError;
    use crate::lifecycle::{CommandResult, LifecycleState};
    use crate::service_config::TerminalConfig;
    use crate::terminal::{RelayState, TerminalDecision, TerminalInfo};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// The instance slot is process-wide, so service tests run one at a time.
    static SERIAL: StdMutex<()> = StdMutex::new(());

    struct TestHooks;

    #[async_trait]
    impl ServiceHooks for TestHooks {
        async fn on_start(&self) -> CommandResult {
            CommandResult::Completed
        }

        async fn on_stop(&self, exit_code: &mut i32) -> CommandResult {
            *exit_code = 0;
            CommandResult::Completed
        }

        fn terminal_connected(&self, _terminal: &TerminalInfo) -> TerminalDecision {
            TerminalDecision::Accept
        }
    }

    /// Leaves the fail-closed terminal policy in place
    struct RefuseTerminals;

    #[async_trait]
    impl ServiceHooks for RefuseTerminals {
        async fn on_start(&self) -> CommandResult {
            CommandResult::Completed
        }
    }

    /// Backend that cannot be loaded; its control counts start requests.
    #[derive(Default)]
    struct BrokenFactory {
        starts: Arc<AtomicUsize>,
    }

    struct CountingControl {
        starts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ServiceControl for CountingControl {
        fn backend(&self) -> &str {
            "broken"
        }

        fn service_id(&self) -> &str {
            "svcA"
        }

        async fn start(&self) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl BackendFactory for BrokenFactory {
        fn create_backend(
            &self,
            _ctx: BackendContext,
        ) -> std::result::Result<Box<dyn ServiceBackend>, BackendError> {
            Err(BackendError::LoadFailed {
                name: "broken".to_string(),
                reason: "missing service manager library".to_string(),
            })
        }

        fn create_control(
            &self,
            _service_id: String,
        ) -> std::result::Result<Box<dyn ServiceControl>, BackendError> {
            Ok(Box::new(CountingControl {
                starts: Arc::clone(&self.starts),
            }))
        }
    }

    fn terminal_config(start_with_terminal: bool) -> ServiceConfig {
        ServiceConfig {
            backend: None,
            terminal: TerminalConfig {
                active: true,
                start_with_terminal,
                ..Default::default()
            },
        }
    }

    fn service_in(dir: &tempfile::TempDir, registry: BackendRegistry) -> Arc<Service> {
        Service::with_endpoints(
            "svcA",
            Arc::new(TestHooks),
            registry,
            Endpoints::in_dir(dir.path(), "svcA"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_second_instance_rejected() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = tempfile::tempdir().unwrap();
        let first = service_in(&dir, BackendRegistry::new());

        let second = Service::with_endpoints(
            "svcB",
            Arc::new(TestHooks),
            BackendRegistry::new(),
            Endpoints::in_dir(dir.path(), "svcB"),
        );
        assert!(matches!(second, Err(ServiceError::AlreadyInstantiated)));
        assert!(Arc::ptr_eq(&Service::instance().unwrap(), &first));

        drop(first);
        assert!(Service::instance().is_none());
        let _again = service_in(&dir, BackendRegistry::new());
    }

    #[tokio::test]
    async fn test_unknown_backend_exits_without_transition() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(&dir, BackendRegistry::new());

        let code = service.exec(LaunchOptions::default()).await;
        assert_eq!(code, 1);
        assert_eq!(service.lifecycle().state(), LifecycleState::Created);
    }

    #[tokio::test]
    async fn test_terminal_mode_requires_terminal_support() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(&dir, BackendRegistry::with_defaults());

        let options = LaunchOptions {
            terminal: true,
            ..LaunchOptions::default()
        };
        assert_eq!(service.exec(options).await, 1);
    }

    #[tokio::test]
    async fn test_attach_to_missing_service_fails() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(&dir, BackendRegistry::with_defaults());
        service.apply_config(&ServiceConfig {
            backend: None,
            terminal: crate::service_config::TerminalConfig {
                active: true,
                ..Default::default()
            },
        });

        let options = LaunchOptions {
            terminal: true,
            args: vec!["stop".to_string()],
            ..LaunchOptions::default()
        };
        assert_eq!(service.exec(options).await, 1);
    }

    #[tokio::test]
    async fn test_settings_change_only() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(&dir, BackendRegistry::new());

        assert!(service.set_terminal_active(true).await);
        assert!(!service.set_terminal_active(true).await);
        assert!(service.terminal_active());
        // Not running yet, so nothing is listening.
        assert_eq!(service.relay().state(), RelayState::Stopped);

        service.set_terminal_mode(TerminalMode::ReadOnly);
        assert_eq!(service.relay().mode(), TerminalMode::ReadOnly);
        service.set_global_terminal(true);
        assert!(service.global_terminal());

        assert!(service.set_terminal_active(false).await);
        assert!(!service.terminal_active());
    }

    #[tokio::test]
    async fn test_no_backend_means_no_sockets() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(&dir, BackendRegistry::new());

        assert!(service.sockets("").is_empty());
        assert_eq!(service.socket(), None);
        service.quit();
        service.reload();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_enable_terminal_while_running() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(&dir, BackendRegistry::new());
        service.lifecycle().start().await.unwrap();

        assert!(service.set_terminal_active(true).await);
        assert!(service.relay().is_running());
        assert!(!service.set_terminal_active(true).await);
        assert!(service.relay().is_running());
        assert!(service.endpoints().local.exists());

        service.set_global_terminal(true);

        assert!(service.set_terminal_active(false).await);
        assert_eq!(service.relay().state(), RelayState::Stopped);
        assert!(!service.endpoints().local.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_supervised_run_stopped_from_terminal() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(&dir, BackendRegistry::with_defaults());
        service.apply_config(&ServiceConfig {
            backend: None,
            terminal: crate::service_config::TerminalConfig {
                active: true,
                ..Default::default()
            },
        });

        let runner = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.exec(LaunchOptions::default()).await })
        };

        let wait = async {
            while !service.relay().is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait).await.unwrap();

        let mut client = TerminalClient::connect(service.endpoints()).await.unwrap();
        assert_eq!(client.state(), LifecycleState::Running);
        let outcome = client.command("stop", Vec::new()).await.unwrap();
        assert_eq!(outcome.result, CommandResult::Completed);
        assert_eq!(outcome.state, LifecycleState::Stopped);

        let code = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(service.relay().state(), RelayState::Stopped);
    }

    #[tokio::test]
    async fn test_backend_load_failure_exits_without_transition() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = tempfile::tempdir().unwrap();
        let mut registry = BackendRegistry::new();
        registry.register("broken", Arc::new(BrokenFactory::default()));
        let service = service_in(&dir, registry);

        let options = LaunchOptions {
            backend: "broken".to_string(),
            ..LaunchOptions::default()
        };
        assert_eq!(service.exec(options).await, 1);
        assert_eq!(service.lifecycle().state(), LifecycleState::Created);
    }

    #[test]
    fn test_only_missing_endpoint_counts_as_not_running() {
        use std::io::{Error, ErrorKind};
        assert!(nothing_listening(&Error::from(ErrorKind::NotFound).into()));
        assert!(nothing_listening(&Error::from(ErrorKind::ConnectionRefused).into()));
        assert!(!nothing_listening(&Error::from(ErrorKind::PermissionDenied).into()));
        assert!(!nothing_listening(&ServiceError::Remote(
            "service closed the terminal connection".to_string()
        )));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_refused_terminal_does_not_start_another_instance() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = tempfile::tempdir().unwrap();
        let factory = BrokenFactory::default();
        let starts = Arc::clone(&factory.starts);
        let mut registry = BackendRegistry::new();
        registry.register("broken", Arc::new(factory));

        let service = Service::with_endpoints(
            "svcA",
            Arc::new(RefuseTerminals),
            registry,
            Endpoints::in_dir(dir.path(), "svcA"),
        )
        .unwrap();
        service.apply_config(&terminal_config(true));
        service.lifecycle().start().await.unwrap();
        assert!(service.relay().start(false).await);

        let options = LaunchOptions {
            backend: "broken".to_string(),
            terminal: true,
            args: vec!["stop".to_string()],
        };
        assert_eq!(service.exec(options).await, 1);
        assert_eq!(starts.load(Ordering::SeqCst), 0);
        assert_eq!(service.lifecycle().state(), LifecycleState::Running);

        service.relay().stop().await;
    }
}
