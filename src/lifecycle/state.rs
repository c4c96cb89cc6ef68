use super::value::Value;
use rkyv::{Archive, Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of the service process
#[derive(Archive, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[rkyv(derive(Debug))]
pub enum LifecycleState {
    /// Instance exists, no start attempted yet
    Created,
    Starting,
    Running,
    Pausing,
    Paused,
    Resuming,
    Stopping,
    Stopped,
    /// Start failed or the backend hit an unrecoverable error
    Failed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Created => "created",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Pausing => "pausing",
            LifecycleState::Paused => "paused",
            LifecycleState::Resuming => "resuming",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Failed => "failed",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, LifecycleState::Running)
    }

    /// Terminal states: nothing but `fail` leaves them.
    pub fn is_finished(&self) -> bool {
        matches!(self, LifecycleState::Stopped | LifecycleState::Failed)
    }

    /// Legal edge for `command` out of this state, if any.
    pub fn transition_for(&self, command: &Command) -> Option<Transition> {
        use LifecycleState::*;
        match (self, command) {
            (Created, Command::Start) => Some(Transition::via(Starting, Running)),
            (Running, Command::Pause) => Some(Transition::via(Pausing, Paused)),
            (Paused, Command::Resume) => Some(Transition::via(Resuming, Running)),
            (Running | Paused, Command::Stop) => Some(Transition::via(Stopping, Stopped)),
            (Running, Command::Reload) => Some(Transition::direct(Running)),
            _ => None,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A legal edge: optional intermediate state, then the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub via: Option<LifecycleState>,
    pub target: LifecycleState,
}

impl Transition {
    fn via(via: LifecycleState, target: LifecycleState) -> Self {
        Self {
            via: Some(via),
            target,
        }
    }

    fn direct(target: LifecycleState) -> Self {
        Self { via: None, target }
    }
}

/// Outcome of a lifecycle hook or of a whole dispatch
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum CommandResult {
    Completed,
    /// Rejected by policy; the state did not change
    Denied,
    /// The transition could not complete
    Failed(String),
}

impl CommandResult {
    pub fn failed(reason: impl Into<String>) -> Self {
        CommandResult::Failed(reason.into())
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, CommandResult::Completed)
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandResult::Completed => f.write_str("completed"),
            CommandResult::Denied => f.write_str("denied"),
            CommandResult::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Every external trigger is translated into exactly one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start,
    Stop,
    Reload,
    Pause,
    Resume,
    Callback { kind: String, args: Vec<Value> },
}

impl Command {
    /// Map a wire/CLI command name onto a command. Anything that is not a
    /// builtin lifecycle verb becomes a dynamic callback.
    pub fn parse(kind: &str, args: Vec<Value>) -> Self {
        match kind {
            "start" => Command::Start,
            "stop" => Command::Stop,
            "reload" => Command::Reload,
            "pause" => Command::Pause,
            "resume" => Command::Resume,
            _ => Command::Callback {
                kind: kind.to_string(),
                args,
            },
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Reload => "reload",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Callback { kind, .. } => kind,
        }
    }
}

/// Notification emitted on every state change
#[derive(Archive, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub struct StateChange {
    pub from: LifecycleState,
    pub to: LifecycleState,
}
