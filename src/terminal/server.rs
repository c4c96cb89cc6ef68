use super::session::TerminalSession;
use super::transport::{self, Listener, Stream};
use super::{authorize, Endpoints, TerminalDecision, TerminalInfo, TerminalMode, TerminalScope};
use crate::lifecycle::LifecycleCore;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long `stop` waits for busy sessions before aborting them
const SESSION_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Stopped,
    Starting,
    Listening,
    Stopping,
}

struct Shared {
    service_name: String,
    core: Arc<LifecycleCore>,
    mode: RwLock<TerminalMode>,
    next_id: AtomicU64,
    owner_uid: Option<u32>,
}

struct Listening {
    scope: TerminalScope,
    endpoint: PathBuf,
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
}

/// Accepts terminal connections and runs one [`TerminalSession`] per
/// connection.
pub struct TerminalServer {
    shared: Arc<Shared>,
    endpoints: Endpoints,
    state: RwLock<RelayState>,
    listening: Mutex<Option<Listening>>,
}

impl TerminalServer {
    pub fn new(service_name: impl Into<String>, core: Arc<LifecycleCore>) -> Self {
        let service_name = service_name.into();
        let endpoints = Endpoints::for_service(&service_name);
        Self::with_endpoints(service_name, core, endpoints)
    }

    pub fn with_endpoints(
        service_name: impl Into<String>,
        core: Arc<LifecycleCore>,
        endpoints: Endpoints,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                service_name: service_name.into(),
                core,
                mode: RwLock::new(TerminalMode::default()),
                next_id: AtomicU64::new(1),
                owner_uid: transport::owner_uid(),
            }),
            endpoints,
            state: RwLock::new(RelayState::Stopped),
            listening: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RelayState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.state() == RelayState::Listening
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn mode(&self) -> TerminalMode {
        *self.shared.mode.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies to connections accepted from now on.
    pub fn set_mode(&self, mode: TerminalMode) {
        *self.shared.mode.write().unwrap_or_else(PoisonError::into_inner) = mode;
    }

    /// Scope of the live endpoint, if listening
    pub async fn scope(&self) -> Option<TerminalScope> {
        self.listening.lock().await.as_ref().map(|l| l.scope)
    }

    /// Bind the endpoint and start accepting. Returns whether the server is
    /// listening; on failure it stays stopped.
    pub async fn start(&self, global: bool) -> bool {
        let mut listening = self.listening.lock().await;
        if let Some(current) = listening.as_ref() {
            if current.scope != TerminalScope::from_global(global) {
                warn!("Terminal server already listening with a different scope - restart it to apply the change");
            }
            return true;
        }

        self.set_state(RelayState::Starting);
        let scope = TerminalScope::from_global(global);
        let endpoint = self.endpoints.path(scope).to_path_buf();

        let listener = match transport::bind(&endpoint, scope) {
            Ok(listener) => listener,
            Err(e) => {
                error!(endpoint = %endpoint.display(), error = %e, "Failed to start terminal server");
                self.set_state(RelayState::Stopped);
                return false;
            }
        };

        let cancel = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.shared),
            scope,
            cancel.clone(),
        ));

        info!(endpoint = %endpoint.display(), scope = ?scope, "Terminal server listening");
        *listening = Some(Listening {
            scope,
            endpoint,
            cancel,
            accept_task,
        });
        self.set_state(RelayState::Listening);
        true
    }

    /// Close the endpoint and end every session. No-op when stopped.
    ///
    /// The listener is only cleared once the accept loop has finished, so a
    /// stop that is itself cancelled can be completed by the next call.
    pub async fn stop(&self) {
        let mut listening = self.listening.lock().await;
        let Some(current) = listening.as_mut() else {
            debug!("Terminal server already stopped");
            return;
        };

        self.set_state(RelayState::Stopping);
        current.cancel.cancel();
        if let Err(e) = (&mut current.accept_task).await {
            warn!(error = %e, "Terminal accept loop ended abnormally");
        }
        transport::remove_endpoint(&current.endpoint);
        *listening = None;
        self.set_state(RelayState::Stopped);
        info!("Terminal server stopped");
    }

    fn set_state(&self, state: RelayState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

impl Drop for TerminalServer {
    fn drop(&mut self) {
        if let Ok(mut listening) = self.listening.try_lock() {
            if let Some(current) = listening.take() {
                current.cancel.cancel();
                transport::remove_endpoint(&current.endpoint);
            }
        }
    }
}

async fn accept_loop(
    listener: Listener,
    shared: Arc<Shared>,
    scope: TerminalScope,
    cancel: CancellationToken,
) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("Terminal session panicked");
                    }
                }
            }

            conn = listener.accept() => match conn {
                Ok((stream, peer_uid)) => {
                    if let Some(session) = admit(&shared, stream, peer_uid, scope, cancel.child_token()) {
                        sessions.spawn(async move {
                            let _ = session.run().await;
                        });
                    }
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    drop(listener);
    let drained = tokio::time::timeout(SESSION_GRACE, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            remaining = sessions.len(),
            "Terminal sessions did not finish in time, aborting"
        );
        sessions.shutdown().await;
    }
}

fn admit(
    shared: &Shared,
    stream: Stream,
    peer_uid: Option<u32>,
    scope: TerminalScope,
    cancel: CancellationToken,
) -> Option<TerminalSession<Stream>> {
    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);

    if !authorize(scope, peer_uid, shared.owner_uid) {
        warn!(terminal = id, peer_uid = ?peer_uid, "Refused terminal from a different user");
        return None;
    }

    let info = TerminalInfo {
        id,
        scope,
        mode: *shared.mode.read().unwrap_or_else(PoisonError::into_inner),
        peer_uid,
    };
    match shared.core.hooks().terminal_connected(&info) {
        TerminalDecision::Accept => {
            debug!(terminal = id, "Terminal accepted");
            Some(TerminalSession::new(
                stream,
                info,
                shared.service_name.clone(),
                Arc::clone(&shared.core),
                cancel,
            ))
        }
        TerminalDecision::Disconnect => None,
    }
}
