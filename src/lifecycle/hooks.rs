use super::state::{Command, CommandResult};
use super::value::Value;
use crate::terminal::{TerminalDecision, TerminalInfo};
use async_trait::async_trait;
use tracing::warn;

/// Service logic implemented by the embedding application.
/// Only `on_start` is required; everything else has a permissive default.
#[async_trait]
pub trait ServiceHooks: Send + Sync {
    /// Checked before `on_start`. Returning `false` fails the start.
    fn pre_start(&self) -> bool {
        true
    }

    async fn on_start(&self) -> CommandResult;

    /// `exit_code` is recorded whatever the returned result is.
    async fn on_stop(&self, exit_code: &mut i32) -> CommandResult {
        let _ = exit_code;
        CommandResult::Completed
    }

    async fn on_reload(&self) -> CommandResult {
        CommandResult::Completed
    }

    async fn on_pause(&self) -> CommandResult {
        CommandResult::Completed
    }

    async fn on_resume(&self) -> CommandResult {
        CommandResult::Completed
    }

    /// Handle a named command. `None` falls through to the dynamic callback
    /// registry.
    async fn on_callback(&self, kind: &str, args: &[Value]) -> Option<Value> {
        let _ = (kind, args);
        None
    }

    /// Gate run before every command. `false` denies it.
    fn verify_command(&self, command: &Command) -> bool {
        let _ = command;
        true
    }

    /// Dispatch point for every authorized terminal connection.
    fn terminal_connected(&self, terminal: &TerminalInfo) -> TerminalDecision {
        warn!(
            terminal = terminal.id,
            "Terminal connected but was not handled - disconnecting it again"
        );
        TerminalDecision::Disconnect
    }
}
