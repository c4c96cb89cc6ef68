use crate::lifecycle::{Command, LifecycleState};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("a service instance already exists in this process")]
    AlreadyInstantiated,

    #[error("command '{command}' is not allowed in state {from}")]
    IllegalTransition {
        from: LifecycleState,
        command: String,
    },

    #[error("callback registry is sealed; '{kind}' must be registered before dispatch begins")]
    CallbacksSealed { kind: String },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("terminal mode is not enabled for service '{0}'")]
    TerminalDisabled(String),

    #[error("no running instance of '{0}' is reachable")]
    NotReachable(String),

    #[error("operation not supported by backend '{backend}': {operation}")]
    Unsupported { backend: String, operation: String },

    #[error("service refused the request: {0}")]
    Remote(String),

    #[error("relay protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    pub fn illegal(from: LifecycleState, command: &Command) -> Self {
        Self::IllegalTransition {
            from,
            command: command.name().to_string(),
        }
    }
}

/// Backend resolution failures. `NotFound` is a configuration mistake,
/// `LoadFailed` an environment problem; callers report them differently.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("no backend registered under the name '{0}'")]
    NotFound(String),

    #[error("backend '{name}' failed to load: {reason}")]
    LoadFailed { name: String, reason: String },
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("failed to encode frame: {0}")]
    Encode(String),

    #[error("failed to decode frame: {0}")]
    Decode(String),

    #[error("unexpected frame: {0}")]
    Unexpected(String),

    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServiceError>;
