//! Process context attached to a session
//!
//! argv and hostname can identify people and machines, so they are only
//! gathered when `collect_context` is enabled.

use std::ffi::OsString;
use std::path::Path;
use std::process::Command;

/// Wire value for `argv` when context is not collected
pub const ARGV_NOT_COLLECTED: &str = "not collected";

/// Wire value for `host` when context is not collected
pub const HOST_NOT_COLLECTED: &str = "not.collected";

/// Name used when neither the caller nor argv provide one
const FALLBACK_NAME: &str = "progvis";

/// argv/hostname snapshot of the reporting process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedContext {
    /// Command line, space separated
    pub argv: String,
    /// Machine hostname
    pub host: String,
}

impl CollectedContext {
    /// Capture argv and hostname of the current process
    pub fn gather() -> Self {
        Self {
            argv: join_args(std::env::args_os()),
            host: detect_hostname().unwrap_or_else(|| "unknown".to_string()),
        }
    }
}

/// Space-join arguments; non-UTF-8 bytes become U+FFFD
fn join_args<I: IntoIterator<Item = OsString>>(args: I) -> String {
    args.into_iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Base filename of the running program
pub fn program_name() -> String {
    name_from_arg0(std::env::args_os().next())
}

fn name_from_arg0(arg0: Option<OsString>) -> String {
    arg0.as_deref()
        .and_then(|arg0| Path::new(arg0).file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_NAME.to_string())
}

/// Resolve the session name, falling back to the program name.
///
/// Blank names count as missing.
pub fn resolve_name(name: Option<&str>) -> String {
    match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => name.to_string(),
        None => {
            let fallback = program_name();
            tracing::warn!(
                name = %fallback,
                "Consider specifying a session name, defaulted to program name"
            );
            fallback
        }
    }
}

fn detect_hostname() -> Option<String> {
    let output = Command::new("hostname")
        .output()
        .ok()
        .filter(|output| output.status.success())?;

    let hostname = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if hostname.is_empty() {
        None
    } else {
        Some(hostname)
    }
}
