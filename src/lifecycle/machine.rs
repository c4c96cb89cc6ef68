use super::callbacks::CallbackRegistry;
use super::hooks::ServiceHooks;
use super::state::{Command, CommandResult, LifecycleState, StateChange, Transition};
use super::value::Value;
use crate::error::{Result, ServiceError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock, Weak};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Result of a dispatched command together with the state it left behind
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub result: CommandResult,
    pub state: LifecycleState,
    /// Return value of a callback command, `Null` otherwise
    pub value: Value,
}

impl Outcome {
    fn new(result: CommandResult, state: LifecycleState) -> Self {
        Self {
            result,
            state,
            value: Value::Null,
        }
    }

    fn with_value(mut self, value: Value) -> Self {
        self.value = value;
        self
    }
}

/// Owner of the canonical state machine.
///
/// Transitions are serialized by `command_lock`, which is held only while a
/// command runs its hook. State reads and subscriber fan-out never wait on it.
pub struct LifecycleCore {
    hooks: Arc<dyn ServiceHooks>,
    command_lock: Mutex<()>,
    state: RwLock<LifecycleState>,
    exit_code: AtomicI32,
    callbacks: CallbackRegistry,
    subscribers: StdMutex<HashMap<u64, mpsc::UnboundedSender<StateChange>>>,
    next_subscriber: AtomicU64,
}

impl LifecycleCore {
    pub fn new(hooks: Arc<dyn ServiceHooks>) -> Arc<Self> {
        Arc::new(Self {
            hooks,
            command_lock: Mutex::new(()),
            state: RwLock::new(LifecycleState::Created),
            exit_code: AtomicI32::new(0),
            callbacks: CallbackRegistry::new(),
            subscribers: StdMutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
        })
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Acquire)
    }

    pub fn hooks(&self) -> &Arc<dyn ServiceHooks> {
        &self.hooks
    }

    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    /// Shorthand for [`CallbackRegistry::register`].
    pub fn add_callback<F>(&self, kind: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        self.callbacks.register(kind, handler)
    }

    /// Call a dynamic callback directly, bypassing the command gate.
    pub fn invoke(&self, kind: &str, args: &[Value]) -> Value {
        self.callbacks.invoke(kind, args)
    }

    pub async fn start(&self) -> Result<Outcome> {
        self.dispatch(Command::Start).await
    }

    pub async fn stop(&self) -> Result<Outcome> {
        self.dispatch(Command::Stop).await
    }

    pub async fn reload(&self) -> Result<Outcome> {
        self.dispatch(Command::Reload).await
    }

    pub async fn pause(&self) -> Result<Outcome> {
        self.dispatch(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<Outcome> {
        self.dispatch(Command::Resume).await
    }

    /// Run one command through the gate, the hook and the state machine.
    ///
    /// Illegal edges return [`ServiceError::IllegalTransition`] and leave the
    /// state untouched.
    pub async fn dispatch(&self, command: Command) -> Result<Outcome> {
        let _guard = self.command_lock.lock().await;
        self.callbacks.seal();

        let from = self.state();
        debug!(command = command.name(), state = %from, "Dispatching command");

        if !self.hooks.verify_command(&command) {
            info!(command = command.name(), "Command denied by verification");
            return Ok(Outcome::new(CommandResult::Denied, from));
        }

        match command {
            Command::Callback { kind, args } => {
                let value = match self.hooks.on_callback(&kind, &args).await {
                    Some(value) => value,
                    None => self.callbacks.invoke(&kind, &args),
                };
                Ok(Outcome::new(CommandResult::Completed, from).with_value(value))
            }
            command => {
                let transition = from.transition_for(&command).ok_or_else(|| {
                    warn!(command = command.name(), state = %from, "Rejected illegal transition");
                    ServiceError::illegal(from, &command)
                })?;
                self.transition(from, command, transition).await
            }
        }
    }

    async fn transition(
        &self,
        from: LifecycleState,
        command: Command,
        transition: Transition,
    ) -> Result<Outcome> {
        if let Some(via) = transition.via {
            self.set_state(via);
        }
        let mut abort_guard = AbortGuard {
            core: self,
            command: command.name().to_string(),
            revert_to: if command == Command::Start {
                LifecycleState::Failed
            } else {
                from
            },
            armed: true,
        };

        let result = match command {
            Command::Start => {
                if self.hooks.pre_start() {
                    self.hooks.on_start().await
                } else {
                    CommandResult::failed("pre-start check failed")
                }
            }
            Command::Stop => {
                let mut exit_code = self.exit_code();
                let result = self.hooks.on_stop(&mut exit_code).await;
                self.exit_code.store(exit_code, Ordering::Release);
                result
            }
            Command::Reload => self.hooks.on_reload().await,
            Command::Pause => self.hooks.on_pause().await,
            Command::Resume => self.hooks.on_resume().await,
            Command::Callback { .. } => CommandResult::failed("callbacks have no transition"),
        };

        let to = match (&result, &command) {
            (CommandResult::Completed, _) => transition.target,
            (_, Command::Start) => LifecycleState::Failed,
            _ => from,
        };
        abort_guard.armed = false;
        self.set_state(to);

        match &result {
            CommandResult::Completed => {
                info!(command = command.name(), state = %to, "Command completed")
            }
            CommandResult::Denied => {
                info!(command = command.name(), state = %to, "Command denied by service")
            }
            CommandResult::Failed(reason) => {
                warn!(command = command.name(), state = %to, reason = %reason, "Command failed")
            }
        }

        Ok(Outcome::new(result, to))
    }

    /// Unrecoverable backend error: move to `Failed` from any state.
    pub async fn fail(&self, reason: &str) {
        let _guard = self.command_lock.lock().await;
        error!(reason = %reason, state = %self.state(), "Service failed");
        self.set_state(LifecycleState::Failed);
    }

    /// Receive every state change from now on. Dropping the subscription
    /// removes it.
    pub fn subscribe(self: &Arc<Self>) -> StateSubscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        debug!(subscriber = id, "State subscriber added");
        StateSubscription {
            id,
            receiver: rx,
            core: Arc::downgrade(self),
        }
    }

    pub fn unsubscribe(&self, id: u64) {
        let removed = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();
        if removed {
            debug!(subscriber = id, "State subscriber removed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn set_state(&self, to: LifecycleState) {
        let from = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *state, to)
        };
        if from == to {
            return;
        }

        debug!(from = %from, to = %to, "State changed");
        let change = StateChange { from, to };
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, tx| tx.send(change).is_ok());
    }
}

/// Restores a settled state when a transition is dropped while its hook
/// is still running, e.g. when the task that dispatched it is aborted.
struct AbortGuard<'a> {
    core: &'a LifecycleCore,
    command: String,
    revert_to: LifecycleState,
    armed: bool,
}

impl Drop for AbortGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(
                command = %self.command,
                state = %self.revert_to,
                "Command aborted before its hook returned"
            );
            self.core.set_state(self.revert_to);
        }
    }
}

/// Live feed of [`StateChange`] events
pub struct StateSubscription {
    id: u64,
    receiver: mpsc::UnboundedReceiver<StateChange>,
    core: Weak<LifecycleCore>,
}

impl StateSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<StateChange> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StateChange> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for StateSubscription {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.unsubscribe(self.id);
        }
    }
}
