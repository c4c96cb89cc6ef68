//! Writable, owner-only runtime directory for the relay rendezvous endpoint.
//!
//! Resolution order: `/run` for root on POSIX, the per-user runtime dir, the
//! OS temp dir, the current directory. The directory is never removed on
//! shutdown.

use crate::clienv;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Runtime directory for `service_name`, created on demand.
pub fn runtime_dir(service_name: &str) -> PathBuf {
    match runtime_root() {
        Some(root) => runtime_dir_in(&root, service_name),
        None => current_dir(),
    }
}

/// Root under which per-service runtime directories are created.
pub fn runtime_root() -> Option<PathBuf> {
    if let Some(root) = clienv::runtime_dir_override() {
        return Some(root);
    }

    #[cfg(unix)]
    {
        // SAFETY: geteuid has no preconditions and cannot fail
        if unsafe { libc::geteuid() } == 0 {
            return Some(PathBuf::from("/run"));
        }
    }

    dirs::runtime_dir().or_else(|| {
        let tmp = std::env::temp_dir();
        (!tmp.as_os_str().is_empty()).then_some(tmp)
    })
}

/// `root/service_name`, created with mode 0700 if missing. Falls back to the
/// current directory when it cannot be created.
pub fn runtime_dir_in(root: &Path, service_name: &str) -> PathBuf {
    let dir = root.join(service_name);
    if dir.is_dir() {
        return dir;
    }

    // create_dir_all tolerates a concurrent creator
    if let Err(e) = std::fs::create_dir_all(&dir) {
        warn!(dir = %dir.display(), error = %e, "Failed to create runtime dir, using current directory");
        return current_dir();
    }
    debug!(dir = %dir.display(), "Created runtime dir");

    if let Err(e) = restrict_to_owner(&dir) {
        warn!(dir = %dir.display(), error = %e, "Failed to set permissions on runtime dir");
    }
    dir
}

#[cfg(unix)]
fn restrict_to_owner(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn restrict_to_owner(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

fn current_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}
