//! Individual fact probes
//!
//! Each probe inspects one corner of the stack (session environment, portal
//! backends, portals.conf, systemd units, PipeWire) and reports what it sees.
//! Probes never fail collection: they return partial data or `None` and let
//! the orchestrator in [`crate::facts`] degrade the snapshot gracefully.

use std::process::Command;

use tracing::trace;

mod backends;
mod pipewire;
mod portal_config;
mod services;
mod session;

pub use backends::{discover_backends, owned_portal_names, parse_portal_file, portal_file_dirs};
pub(crate) use backends::backend_owned_names;
pub use pipewire::{probe_pipewire, probe_wireplumber};
pub use portal_config::{config_paths, parse_portals_conf, read_portals_config};
pub use services::{
    journal_excerpt, restart_unit, unit_states, ServiceError, PIPEWIRE_UNITS, PORTAL_UNITS,
};
pub use session::{classify_desktop, detect_session, SessionFacts};

/// Run a command and capture trimmed stdout.
///
/// Returns `None` if the binary is missing or exits non-zero.
pub(crate) fn run_command(cmd: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(cmd).args(args).output().ok()?;
    if !output.status.success() {
        trace!(cmd, ?args, code = ?output.status.code(), "command exited non-zero");
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Check whether a command exists in PATH
pub(crate) fn command_available(cmd: &str) -> bool {
    Command::new("which")
        .arg(cmd)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Check if a process with the exact given name is running
pub(crate) fn is_process_running(name: &str) -> bool {
    Command::new("pgrep")
        .arg("-x")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
