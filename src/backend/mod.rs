//! Backend contract
//!
//! A backend supervises the process the way one OS service manager expects
//! and turns its native events into lifecycle commands. The runtime only
//! talks to these traits; implementations are looked up by name in the
//! [`BackendRegistry`].

pub mod registry;
pub mod standard;

pub use registry::{BackendDescriptor, BackendRegistry};
pub use standard::{StandardBackend, StandardControl, StandardFactory};

use crate::error::{BackendError, Result, ServiceError};
use crate::lifecycle::{LifecycleCore, StateChange};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

#[cfg(unix)]
pub type RawSocket = std::os::fd::RawFd;
#[cfg(windows)]
pub type RawSocket = std::os::windows::io::RawSocket;
#[cfg(not(any(unix, windows)))]
pub type RawSocket = i32;

/// Everything a factory gets to build a backend
#[derive(Clone)]
pub struct BackendContext {
    pub service_name: String,
    pub core: Arc<LifecycleCore>,
}

/// Runs the service under native supervision
#[async_trait]
pub trait ServiceBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Supervise the process until it should exit; returns the exit code.
    async fn run_service(&self, args: &[String]) -> i32;

    /// Ask the service to stop
    fn quit_service(&self);

    fn reload_service(&self);

    /// Sockets handed over by the service manager under `name`; empty name
    /// means the default sockets.
    fn activated_sockets(&self, name: &str) -> Vec<RawSocket> {
        let _ = name;
        Vec::new()
    }

    /// Reporting hook run for every lifecycle change
    fn state_changed(&self, change: &StateChange) {
        let _ = change;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceStatus {
    Running,
    Paused,
    Stopped,
    Errored,
    Unknown,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Running => "running",
            ServiceStatus::Paused => "paused",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Errored => "errored",
            ServiceStatus::Unknown => "unknown",
        }
    }
}

/// Controls a service from outside its process
#[async_trait]
pub trait ServiceControl: Send + Sync {
    fn backend(&self) -> &str;

    fn service_id(&self) -> &str;

    async fn status(&self) -> ServiceStatus {
        ServiceStatus::Unknown
    }

    async fn start(&self) -> Result<()> {
        Err(self.unsupported("start"))
    }

    async fn stop(&self) -> Result<()> {
        Err(self.unsupported("stop"))
    }

    async fn reload(&self) -> Result<()> {
        Err(self.unsupported("reload"))
    }

    fn unsupported(&self, operation: &str) -> ServiceError {
        ServiceError::Unsupported {
            backend: self.backend().to_string(),
            operation: operation.to_string(),
        }
    }
}

/// Produces backends and controls for one backend name
pub trait BackendFactory: Send + Sync {
    fn create_backend(&self, ctx: BackendContext)
        -> std::result::Result<Box<dyn ServiceBackend>, BackendError>;

    fn create_control(
        &self,
        service_id: String,
    ) -> std::result::Result<Box<dyn ServiceControl>, BackendError>;

    /// Id of the service running in this process
    fn current_service_id(&self, service_name: &str) -> String {
        service_name.to_string()
    }

    /// Id the backend uses for `service_name`, optionally within `domain`
    fn find_service_id(&self, service_name: &str, domain: Option<&str>) -> String {
        let _ = domain;
        service_name.to_string()
    }
}
