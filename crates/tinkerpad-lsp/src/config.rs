//! Settings for the language-intelligence feature and server executable
//! resolution.

use crate::error::{LspError, LspResult};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Argument selecting language-server mode on the phpactor binary.
pub const SERVER_MODE_ARG: &str = "language-server";

const SERVER_BINARY: &str = "phpactor";

/// Editor-facing settings, persisted by the surrounding application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LspSettings {
    /// Master switch for the whole feature.
    pub enabled: bool,

    /// Request completions automatically while typing.
    pub auto_trigger: bool,

    /// Project the scratch document belongs to.
    pub project_root: Option<PathBuf>,

    /// Explicit server executable, overriding auto-detection.
    pub server_path: Option<PathBuf>,
}

impl Default for LspSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_trigger: true,
            project_root: None,
            server_path: None,
        }
    }
}

impl LspSettings {
    /// Stable signature used to detect whether applying this configuration
    /// would change anything.
    pub fn signature(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.enabled,
            self.auto_trigger,
            self.project_root
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            self.server_path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        )
    }
}

/// Locate the server executable.
///
/// An explicit override takes priority and must point at an executable file;
/// otherwise the binary is searched on PATH plus the known install
/// directories.
pub fn resolve_server_executable(override_path: Option<&Path>) -> LspResult<PathBuf> {
    if let Some(path) = override_path {
        if is_executable_file(path) {
            return Ok(path.to_path_buf());
        }
        return Err(LspError::launch_failed(format!(
            "server override is not an executable file: {}",
            path.display()
        )));
    }

    for dir in search_dirs() {
        let candidate = dir.join(SERVER_BINARY);
        if is_executable_file(&candidate) {
            return Ok(candidate);
        }
    }

    Err(LspError::launch_failed(format!(
        "{SERVER_BINARY} not found on PATH"
    )))
}

/// PATH value handed to the spawned server, with the known install
/// directories appended so phpactor's own subprocesses resolve too.
pub fn augmented_path() -> OsString {
    std::env::join_paths(search_dirs()).unwrap_or_else(|_| {
        std::env::var_os("PATH").unwrap_or_default()
    })
}

fn search_dirs() -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> =
        std::env::split_paths(&std::env::var_os("PATH").unwrap_or_default()).collect();
    out.extend(extra_install_dirs());
    out
}

/// Directories phpactor commonly lands in that are not always on PATH.
fn extra_install_dirs() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(home) = dirs::home_dir() {
        out.push(home.join(".local/bin"));
        out.push(home.join(".composer/vendor/bin"));
        out.push(home.join(".config/composer/vendor/bin"));
    }
    out.push(PathBuf::from("/usr/local/bin"));
    out.push(PathBuf::from("/opt/homebrew/bin"));
    out
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path) -> bool {
    path.is_file()
}
