//! systemd user unit probe
//!
//! Queries unit states in one `systemctl --user show` round trip, pulls
//! journal excerpts for broken units, and restarts units on behalf of the
//! fix engine.

use std::{collections::BTreeMap, process::Command};

use thiserror::Error;
use tracing::{debug, warn};

use crate::facts::state::UnitState;

/// Portal units worth watching, frontend first
pub const PORTAL_UNITS: &[&str] = &[
    "xdg-desktop-portal.service",
    "xdg-desktop-portal-kde.service",
    "xdg-desktop-portal-gnome.service",
    "xdg-desktop-portal-gtk.service",
    "xdg-desktop-portal-wlr.service",
    "xdg-desktop-portal-hyprland.service",
    "xdg-desktop-portal-lxqt.service",
];

/// PipeWire stack units
pub const PIPEWIRE_UNITS: &[&str] = &[
    "pipewire.service",
    "pipewire.socket",
    "wireplumber.service",
    "pipewire-media-session.service",
    "pipewire-pulse.service",
    "pipewire-pulse.socket",
];

/// Errors from service operations
#[derive(Debug, Error)]
pub enum ServiceError {
    /// systemctl itself could not be spawned
    #[error("systemctl unavailable: {source}")]
    SystemctlUnavailable {
        #[source]
        source: std::io::Error,
    },

    /// The restart command ran but reported failure
    #[error("failed to restart {unit}: {stderr}")]
    RestartFailed { unit: String, stderr: String },
}

/// Query the state of several units in a single systemctl call.
///
/// Every requested unit appears in the result; units systemd does not know
/// come back as [`UnitState::NotFound`], and if systemctl itself is missing
/// everything is [`UnitState::Unknown`].
pub fn unit_states(units: &[&str]) -> BTreeMap<String, UnitState> {
    let output = Command::new("systemctl")
        .arg("--user")
        .args(["show", "-p", "Id", "-p", "LoadState", "-p", "ActiveState"])
        .args(units)
        .output();

    match output {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            parse_unit_blocks(&stdout, units)
        }
        Ok(output) => {
            warn!(
                code = ?output.status.code(),
                "systemctl show exited non-zero, unit states unknown"
            );
            units
                .iter()
                .map(|u| ((*u).to_string(), UnitState::Unknown))
                .collect()
        }
        Err(e) => {
            warn!(error = %e, "systemctl unavailable, unit states unknown");
            units
                .iter()
                .map(|u| ((*u).to_string(), UnitState::Unknown))
                .collect()
        }
    }
}

/// Parse `systemctl show` output: one property block per unit, blocks
/// separated by blank lines, in the order the units were requested.
fn parse_unit_blocks(output: &str, requested: &[&str]) -> BTreeMap<String, UnitState> {
    let mut states: BTreeMap<String, UnitState> = requested
        .iter()
        .map(|u| ((*u).to_string(), UnitState::Unknown))
        .collect();

    for (index, block) in output.split("\n\n").enumerate() {
        let mut id = None;
        let mut load_state = "";
        let mut active_state = "";
        for line in block.lines() {
            if let Some((key, value)) = line.split_once('=') {
                match key {
                    "Id" if !value.is_empty() => id = Some(value.to_string()),
                    "LoadState" => load_state = value,
                    "ActiveState" => active_state = value,
                    _ => {}
                }
            }
        }

        // Old systemd versions leave Id empty for unknown units; fall back
        // to positional matching against the request list.
        let unit = match id {
            Some(id) => id,
            None => match requested.get(index) {
                Some(unit) => (*unit).to_string(),
                None => continue,
            },
        };

        let state = if load_state == "not-found" {
            UnitState::NotFound
        } else {
            match active_state {
                "active" => UnitState::Active,
                "failed" => UnitState::Failed,
                "" => UnitState::Unknown,
                _ => UnitState::Inactive,
            }
        };

        states.insert(unit, state);
    }

    debug!(count = states.len(), "queried unit states");
    states
}

/// Pull a recent journal excerpt for one unit.
///
/// Returns `None` when journalctl is unavailable or produced nothing. The
/// caller is responsible for sanitizing before the text leaves the machine.
pub fn journal_excerpt(unit: &str, lines: u32) -> Option<String> {
    let output = Command::new("journalctl")
        .args(["--user", "-u", unit, "-n"])
        .arg(lines.to_string())
        .args(["--no-pager", "--since", "-10m"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if text.is_empty() || text.starts_with("-- No entries --") {
        None
    } else {
        Some(text)
    }
}

/// Restart a systemd user unit
pub fn restart_unit(unit: &str) -> Result<(), ServiceError> {
    let output = Command::new("systemctl")
        .args(["--user", "restart", unit])
        .output()
        .map_err(|source| ServiceError::SystemctlUnavailable { source })?;

    if output.status.success() {
        debug!(unit, "restarted unit");
        Ok(())
    } else {
        Err(ServiceError::RestartFailed {
            unit: unit.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}
