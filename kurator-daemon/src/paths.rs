use std::path::{Path, PathBuf};

use kurator_core::config::kurator_root;

pub const DAEMON_LOG: &str = "daemon.log";
pub const DAEMON_SOCKET: &str = "daemon.sock";

pub fn socket_path(home: &Path) -> PathBuf {
    kurator_root(home).join(DAEMON_SOCKET)
}

pub fn logs_dir(home: &Path) -> PathBuf {
    kurator_root(home).join("logs")
}

pub fn log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_LOG)
}
