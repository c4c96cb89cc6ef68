use std::path::PathBuf;

const ENV_CONFIG: &str = "SVCRT_CONFIG";
const ENV_BACKEND: &str = "SVCRT_BACKEND";
const ENV_LOG: &str = "SVCRT_LOG";
const ENV_RUST_LOG: &str = "RUST_LOG";
const ENV_RUNTIME_DIR: &str = "SVCRT_RUNTIME_DIR";

const FALLBACK_CONFIG_DIR: &str = "~/.config";
pub const DEFAULT_BACKEND: &str = "standard";
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Non-empty value of an environment variable
fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Config file override ($SVCRT_CONFIG)
pub fn config_path_override() -> Option<PathBuf> {
    let path = env_opt(ENV_CONFIG).map(PathBuf::from);
    tracing::trace!(path = ?path, "SVCRT_CONFIG env var");
    path
}

/// Per-service config directory (~/.config/<service>)
pub fn config_dir(service_name: &str) -> PathBuf {
    let dir = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
        .join(service_name);
    tracing::trace!(dir = %dir.display(), "Resolved config directory");
    dir
}

/// Backend override ($SVCRT_BACKEND)
pub fn backend() -> Option<String> {
    let val = env_opt(ENV_BACKEND);
    tracing::trace!(value = ?val, "SVCRT_BACKEND env var");
    val
}

/// Log filter ($SVCRT_LOG, then $RUST_LOG, then "info")
pub fn log_filter() -> String {
    env_opt(ENV_LOG)
        .or_else(|| env_opt(ENV_RUST_LOG))
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string())
}

/// Runtime root override ($SVCRT_RUNTIME_DIR)
pub fn runtime_dir_override() -> Option<PathBuf> {
    let path = env_opt(ENV_RUNTIME_DIR).map(PathBuf::from);
    tracing::trace!(path = ?path, "SVCRT_RUNTIME_DIR env var");
    path
}
