pub mod backend;
pub mod clienv;
mod cmd_attach;
pub mod error;
pub mod lifecycle;
pub mod runtime_dir;
pub mod service;
pub mod service_config;
pub mod terminal;

pub use backend::{BackendFactory, BackendRegistry, ServiceBackend, ServiceControl};
pub use error::{BackendError, Result, ServiceError};
pub use lifecycle::{Command, CommandResult, LifecycleCore, LifecycleState, ServiceHooks, Value};
pub use service::{LaunchOptions, Service};
pub use service_config::ServiceConfig;
pub use terminal::{TerminalClient, TerminalDecision, TerminalInfo, TerminalMode};
