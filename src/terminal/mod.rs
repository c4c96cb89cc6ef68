//! Terminal relay - attach to a running service as if it ran in a terminal
//!
//! ```text
//! ┌──────────────┐  frames   ┌────────────────┐  dispatch  ┌───────────────┐
//! │ TerminalClient│ ───────▶ │ TerminalSession │ ─────────▶ │ LifecycleCore │
//! │  (--terminal) │ ◀─────── │  (per conn)     │ ◀───────── │  (state feed) │
//! └──────────────┘  events   └────────────────┘   changes  └───────────────┘
//!                         accepted by TerminalServer
//! ```
//!
//! Frames are `[4-byte length (little-endian)][rkyv bytes]`.

pub mod client;
pub mod protocol;
pub mod server;
pub mod session;
mod transport;

pub use client::TerminalClient;
pub use server::{RelayState, TerminalServer};
pub use session::TerminalSession;

use crate::runtime_dir;
use rkyv::{Archive, Deserialize, Serialize};
use std::path::{Path, PathBuf};

const LOCAL_SOCKET_NAME: &str = "terminal.sock";

/// What an attached terminal may do
#[derive(
    Archive,
    Deserialize,
    Serialize,
    serde::Serialize,
    serde::Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
)]
#[rkyv(derive(Debug))]
#[serde(rename_all = "kebab-case")]
pub enum TerminalMode {
    /// Receive state events only
    ReadOnly,
    /// Send commands only
    WriteOnly,
    /// Commands and events, subscribed on connect
    ReadWriteActive,
    /// Commands and events, subscribe on request
    #[default]
    ReadWritePassive,
}

impl TerminalMode {
    pub fn can_command(&self) -> bool {
        !matches!(self, TerminalMode::ReadOnly)
    }

    pub fn can_subscribe(&self) -> bool {
        !matches!(self, TerminalMode::WriteOnly)
    }
}

/// Who may reach the rendezvous endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalScope {
    /// Owning user only
    Local,
    /// Any local user
    Global,
}

impl TerminalScope {
    pub fn from_global(global: bool) -> Self {
        if global {
            TerminalScope::Global
        } else {
            TerminalScope::Local
        }
    }
}

/// Connection details handed to
/// [`ServiceHooks::terminal_connected`](crate::lifecycle::ServiceHooks::terminal_connected)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalInfo {
    pub id: u64,
    pub scope: TerminalScope,
    pub mode: TerminalMode,
    /// Peer user id, when the transport reports one
    pub peer_uid: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalDecision {
    Accept,
    Disconnect,
}

/// Local scope admits only the owning user; global scope admits anyone.
pub fn authorize(scope: TerminalScope, peer_uid: Option<u32>, owner_uid: Option<u32>) -> bool {
    match scope {
        TerminalScope::Global => true,
        TerminalScope::Local => match (peer_uid, owner_uid) {
            (Some(peer), Some(owner)) => peer == owner,
            // Transport without credentials: the endpoint itself is private
            (None, None) => true,
            _ => false,
        },
    }
}

/// Rendezvous paths for a service. Clients derive the same paths from the
/// service name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub local: PathBuf,
    pub global: PathBuf,
}

impl Endpoints {
    pub fn for_service(service_name: &str) -> Self {
        Self {
            local: runtime_dir::runtime_dir(service_name).join(LOCAL_SOCKET_NAME),
            global: std::env::temp_dir().join(format!("{}-terminal.sock", service_name)),
        }
    }

    /// Both endpoints inside `dir`
    pub fn in_dir(dir: &Path, service_name: &str) -> Self {
        Self {
            local: dir.join(LOCAL_SOCKET_NAME),
            global: dir.join(format!("{}-terminal.sock", service_name)),
        }
    }

    pub fn path(&self, scope: TerminalScope) -> &Path {
        match scope {
            TerminalScope::Local => &self.local,
            TerminalScope::Global => &self.global,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_scope_refuses_other_principal() {
        assert!(authorize(TerminalScope::Local, Some(1000), Some(1000)));
        assert!(!authorize(TerminalScope::Local, Some(1001), Some(1000)));
        assert!(!authorize(TerminalScope::Local, None, Some(1000)));
    }

    #[test]
    fn test_global_scope_admits_other_principal() {
        assert!(authorize(TerminalScope::Global, Some(1001), Some(1000)));
        assert!(authorize(TerminalScope::Global, None, Some(1000)));
    }

    #[test]
    fn test_mode_permissions() {
        assert!(!TerminalMode::ReadOnly.can_command());
        assert!(TerminalMode::ReadOnly.can_subscribe());
        assert!(TerminalMode::WriteOnly.can_command());
        assert!(!TerminalMode::WriteOnly.can_subscribe());
        assert!(TerminalMode::ReadWritePassive.can_command());
        assert!(TerminalMode::ReadWriteActive.can_subscribe());
    }

    #[test]
    fn test_endpoints_in_dir() {
        let dir = Path::new("/tmp/x");
        let endpoints = Endpoints::in_dir(dir, "svcA");
        assert_eq!(endpoints.path(TerminalScope::Local), dir.join("terminal.sock"));
        assert_eq!(
            endpoints.path(TerminalScope::Global),
            dir.join("svcA-terminal.sock")
        );
    }
}
