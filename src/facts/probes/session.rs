//! Session environment probe
//!
//! Determines session type (Wayland vs X11), desktop environment family,
//! and best-effort compositor identity from environment variables and
//! running processes.

use std::process::Command;

use tracing::debug;

use super::is_process_running;
use crate::facts::state::{CompositorFact, DesktopKind, SessionType};

/// Everything the session probe observes
#[derive(Debug, Clone)]
pub struct SessionFacts {
    /// wayland / x11 / unknown
    pub session_type: SessionType,
    /// Desktop environment family
    pub desktop: DesktopKind,
    /// Raw `XDG_CURRENT_DESKTOP` (or `DESKTOP_SESSION` fallback), empty when unset
    pub desktop_raw: String,
    /// Best-effort compositor identification
    pub compositor: CompositorFact,
}

/// Probe the session environment.
///
/// Detection order:
/// 1. `XDG_SESSION_TYPE` for the session type, falling back to display sockets
/// 2. `XDG_CURRENT_DESKTOP` / `DESKTOP_SESSION` for the desktop family
/// 3. Compositor-specific env vars and running processes for the compositor
pub fn detect_session() -> SessionFacts {
    let session_type = detect_session_type();

    let desktop_raw = std::env::var("XDG_CURRENT_DESKTOP")
        .or_else(|_| std::env::var("DESKTOP_SESSION"))
        .unwrap_or_default();
    let desktop = classify_desktop(&desktop_raw);
    debug!(%session_type, %desktop, raw = %desktop_raw, "session environment");

    SessionFacts {
        session_type,
        desktop,
        desktop_raw,
        compositor: identify_compositor(desktop),
    }
}

fn detect_session_type() -> SessionType {
    if let Ok(session) = std::env::var("XDG_SESSION_TYPE") {
        match session.to_lowercase().as_str() {
            "wayland" => return SessionType::Wayland,
            "x11" => return SessionType::X11,
            other => debug!(session = other, "unrecognized XDG_SESSION_TYPE"),
        }
    }

    // XDG_SESSION_TYPE unset or unhelpful: fall back to display sockets.
    // WAYLAND_DISPLAY wins since Xwayland sets DISPLAY too.
    if std::env::var("WAYLAND_DISPLAY").is_ok() {
        return SessionType::Wayland;
    }
    if std::env::var("DISPLAY").is_ok() {
        return SessionType::X11;
    }

    SessionType::Unknown
}

/// Classify a raw desktop string into a backend-expectation family.
///
/// `XDG_CURRENT_DESKTOP` may be a colon-separated list (e.g. `"ubuntu:GNOME"`);
/// any matching segment wins.
pub fn classify_desktop(raw: &str) -> DesktopKind {
    if raw.trim().is_empty() {
        return DesktopKind::Unknown;
    }

    let lower = raw.to_lowercase();
    if lower.contains("kde") || lower.contains("plasma") {
        return DesktopKind::Kde;
    }
    if lower.contains("gnome") || lower.contains("ubuntu") {
        return DesktopKind::Gnome;
    }

    const WLROOTS_DESKTOPS: &[&str] = &[
        "sway", "hyprland", "river", "wayfire", "labwc", "dwl", "niri",
    ];
    if WLROOTS_DESKTOPS.iter().any(|name| lower.contains(name)) {
        return DesktopKind::WlrootsGeneric;
    }

    DesktopKind::Other
}

/// Identify the running compositor
///
/// Detection order:
/// 1. Compositor-specific env vars (SWAYSOCK, HYPRLAND_INSTANCE_SIGNATURE)
/// 2. Desktop family from the environment
/// 3. Running processes
fn identify_compositor(desktop: DesktopKind) -> CompositorFact {
    if std::env::var("SWAYSOCK").is_ok() {
        return CompositorFact {
            name: Some("sway".into()),
            version: detect_version("sway", &["--version"]),
        };
    }
    if std::env::var("HYPRLAND_INSTANCE_SIGNATURE").is_ok() {
        return CompositorFact {
            name: Some("Hyprland".into()),
            version: detect_hyprland_version(),
        };
    }

    match desktop {
        DesktopKind::Gnome => {
            return CompositorFact {
                name: Some("gnome-shell".into()),
                version: detect_version("gnome-shell", &["--version"]),
            };
        }
        DesktopKind::Kde => {
            return CompositorFact {
                name: Some("kwin_wayland".into()),
                version: detect_version("plasmashell", &["--version"]),
            };
        }
        _ => {}
    }

    // Environment was inconclusive: look for known compositor processes
    const COMPOSITOR_PROCESSES: &[&str] = &[
        "gnome-shell",
        "kwin_wayland",
        "sway",
        "Hyprland",
        "weston",
        "cosmic-comp",
        "labwc",
        "wayfire",
        "river",
        "niri",
    ];
    for process in COMPOSITOR_PROCESSES {
        if is_process_running(process) {
            debug!(compositor = process, "identified compositor from process list");
            return CompositorFact {
                name: Some((*process).to_string()),
                version: None,
            };
        }
    }

    CompositorFact::default()
}

/// Run `cmd args...` and take the last whitespace token as the version.
///
/// Covers the common `"GNOME Shell 46.0"` / `"plasmashell 6.0.0"` /
/// `"sway version 1.9"` output shapes.
fn detect_version(cmd: &str, args: &[&str]) -> Option<String> {
    Command::new(cmd).args(args).output().ok().and_then(|output| {
        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            stdout
                .split_whitespace()
                .last()
                .map(std::string::ToString::to_string)
        } else {
            None
        }
    })
}

/// Hyprland prints a multi-line banner; the version is the first
/// digit-leading token on the tag line.
fn detect_hyprland_version() -> Option<String> {
    Command::new("hyprctl")
        .arg("version")
        .output()
        .ok()
        .and_then(|output| {
            if output.status.success() {
                let stdout = String::from_utf8_lossy(&output.stdout);
                for line in stdout.lines() {
                    if line.starts_with("Hyprland") || line.contains("version") {
                        return line
                            .split_whitespace()
                            .find(|s| s.chars().next().is_some_and(|c| c.is_ascii_digit()))
                            .map(std::string::ToString::to_string);
                    }
                }
                None
            } else {
                None
            }
        })
}
