//! Lifecycle state machine and command dispatch
//!
//! Every backend and every terminal session drives the service through
//! [`LifecycleCore`]:
//!
//! ```text
//! Created -> Starting -> Running <-> Pausing/Paused/Resuming
//!                 |         |
//!                 v         v
//!              Failed    Stopping -> Stopped
//! ```

pub mod callbacks;
pub mod machine;
pub mod hooks;
pub mod state;
pub mod value;

pub use machine::{LifecycleCore, Outcome, StateSubscription};
pub use callbacks::{CallbackFn, CallbackRegistry};
pub use hooks::ServiceHooks;
pub use state::{Command, CommandResult, LifecycleState, StateChange, Transition};
pub use value::Value;
