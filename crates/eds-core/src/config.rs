//! Environment resolvers shared by the server and the client.
//!
//! Every resolver takes the command-line value first, then the environment,
//! then a default.

use crate::slots::ServerIdentity;
use std::path::{Path, PathBuf};

pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const MIN_TIMEOUT_SECS: u64 = 1;
pub const MAX_TIMEOUT_SECS: u64 = 1000;

const SOCKET_DIR: &str = "eds";
const SOCKET_FILE: &str = "channel.sock";

pub fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

/// Non-blank value of an environment variable.
pub fn env_value(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

fn flag_value(flag: Option<&str>) -> Option<String> {
    flag.filter(|value| !value.trim().is_empty())
        .map(str::to_string)
}

pub fn resolve_server_name(flag: Option<&str>) -> String {
    if let Some(value) = flag_value(flag) {
        return value;
    }
    if let Some(value) = env_value("EDS_SERVER_NAME") {
        return value;
    }
    env_value("CLEARCASE_ROOT")
        .and_then(|root| clearcase_view_tag(&root))
        .unwrap_or_default()
}

/// View tag of a ClearCase view root such as `/view/my_view`.
pub fn clearcase_view_tag(root: &str) -> Option<String> {
    let tag = root.trim_end_matches('/').rsplit('/').next()?;
    if tag.is_empty() {
        None
    } else {
        Some(tag.to_string())
    }
}

pub fn resolve_host_name() -> String {
    if let Some(value) = env_value("HOSTNAME") {
        return value.trim().to_string();
    }
    if let Ok(value) = std::fs::read_to_string("/etc/hostname") {
        let value = value.trim();
        if !value.is_empty() {
            return value.to_string();
        }
    }
    "localhost".to_string()
}

pub fn resolve_user_name() -> String {
    env_value("USER")
        .or_else(|| env_value("LOGNAME"))
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn resolve_socket_path(flag: Option<&str>, identity: &ServerIdentity) -> PathBuf {
    if let Some(value) = flag_value(flag) {
        return PathBuf::from(value);
    }
    if let Some(value) = env_value("EDS_SOCKET") {
        return PathBuf::from(value);
    }
    let runtime_dir = if let Some(value) = env_value("XDG_RUNTIME_DIR") {
        PathBuf::from(value)
    } else if let Some(uid) = env_value("UID") {
        PathBuf::from(format!("/run/user/{uid}"))
    } else {
        PathBuf::from("/tmp")
    };
    socket_path_in(&runtime_dir, identity)
}

pub fn socket_path_in(runtime_dir: &Path, identity: &ServerIdentity) -> PathBuf {
    runtime_dir
        .join(SOCKET_DIR)
        .join(identity.slug())
        .join(SOCKET_FILE)
}

pub fn resolve_log_dir(flag: Option<&str>) -> Option<PathBuf> {
    flag_value(flag)
        .or_else(|| env_value("EDS_LOG_DIR"))
        .map(PathBuf::from)
}

pub fn clamp_timeout_secs(value: u64) -> u64 {
    value.clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS)
}
