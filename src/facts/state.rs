//! Fact snapshot value types
//!
//! Everything the collector observes about the screen-sharing stack is
//! captured in one immutable [`FactSnapshot`]. Re-collection always builds a
//! new snapshot, so callers can diff before/after states (for example to
//! confirm that a fix took effect).

use std::{collections::BTreeMap, fmt, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The portal implementation interface the doctor ultimately cares about.
pub const SCREENCAST_INTERFACE: &str = "org.freedesktop.impl.portal.ScreenCast";

/// Well-known name of the portal frontend on the session bus.
pub const PORTAL_FRONTEND_NAME: &str = "org.freedesktop.portal.Desktop";

/// Prefix shared by all portal backend implementation names.
pub const BACKEND_NAME_PREFIX: &str = "org.freedesktop.impl.portal.desktop.";

/// systemd user unit of the portal frontend.
pub const PORTAL_FRONTEND_UNIT: &str = "xdg-desktop-portal.service";

/// systemd user unit conventionally backing a portal backend short name
pub fn backend_unit_name(short_name: &str) -> String {
    format!("xdg-desktop-portal-{short_name}.service")
}

/// Session type reported by the login session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    /// Wayland session (portals are the supported capture path)
    Wayland,
    /// X11 session (portals are frequently bypassed or limited)
    X11,
    /// Could not be determined
    Unknown,
}

impl SessionType {
    /// Stable lowercase name for logs and JSON output
    pub fn name(&self) -> &'static str {
        match self {
            Self::Wayland => "wayland",
            Self::X11 => "x11",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Desktop environment family, as far as backend expectations go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DesktopKind {
    /// KDE Plasma
    Kde,
    /// GNOME Shell
    Gnome,
    /// Sway, Hyprland, river, and other wlroots-style compositors
    WlrootsGeneric,
    /// Identified, but not one the doctor has backend expectations for
    Other,
    /// Could not be determined
    Unknown,
}

impl DesktopKind {
    /// Stable lowercase name for logs and JSON output
    pub fn name(&self) -> &'static str {
        match self {
            Self::Kde => "kde",
            Self::Gnome => "gnome",
            Self::WlrootsGeneric => "wlroots",
            Self::Other => "other",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DesktopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Best-effort compositor identification
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositorFact {
    /// Process or product name (e.g. "gnome-shell", "kwin_wayland", "sway")
    pub name: Option<String>,
    /// Version string if the compositor reports one
    pub version: Option<String>,
}

impl CompositorFact {
    /// Display label that never panics on missing data
    pub fn label(&self) -> String {
        match (&self.name, &self.version) {
            (Some(name), Some(version)) => format!("{name} {version}"),
            (Some(name), None) => name.clone(),
            _ => "unknown".to_string(),
        }
    }
}

/// Install/run state of a user-space component (PipeWire, WirePlumber)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentStatus {
    /// A process for the component is alive
    Running,
    /// Installed but no process found
    Stopped,
    /// Binary not present on PATH
    NotInstalled,
    /// The probe for this component timed out or errored
    Unknown,
}

impl ComponentStatus {
    /// Stable kebab-case name for logs and JSON output
    pub fn name(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::NotInstalled => "not-installed",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One component observation: status plus version when available
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentFact {
    /// Install/run state
    pub status: ComponentStatus,
    /// Version string when the component reports one
    pub version: Option<String>,
}

impl ComponentFact {
    /// The value a timed-out or failed probe leaves behind
    pub fn unknown() -> Self {
        Self {
            status: ComponentStatus::Unknown,
            version: None,
        }
    }

    /// One-line status with version, e.g. "running (1.2.7)"
    pub fn summary(&self) -> String {
        match &self.version {
            Some(v) => format!("{} ({v})", self.status),
            None => self.status.to_string(),
        }
    }
}

/// systemd unit state as reported by the user manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnitState {
    /// Unit is running
    Active,
    /// Unit exists but is not running
    Inactive,
    /// Unit entered the failed state
    Failed,
    /// No such unit on this system
    NotFound,
    /// systemctl was unavailable or the query timed out
    Unknown,
}

impl UnitState {
    /// Stable kebab-case name for logs and JSON output
    pub fn name(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Failed => "failed",
            Self::NotFound => "not-found",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the unit is currently running
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One discovered portal backend implementation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalBackend {
    /// Short name derived from the D-Bus name (e.g. "kde", "gnome", "wlr")
    pub name: String,
    /// Well-known implementation name the backend registers
    pub dbus_name: String,
    /// The `.portal` file this backend was discovered from
    pub portal_file: Option<PathBuf>,
    /// Interfaces the `.portal` file declares
    pub interfaces: Vec<String>,
    /// Desktops the backend declares itself for (`UseIn=`)
    pub use_in: Vec<String>,
    /// Whether the backend is currently servicing requests (bus name owned
    /// or its systemd unit active)
    pub running: bool,
    /// Portal-related well-known names this backend currently owns
    pub owned_names: Vec<String>,
}

impl PortalBackend {
    /// Whether the backend declares the ScreenCast implementation interface
    pub fn supports_screencast(&self) -> bool {
        // An empty interface list means the .portal file was unreadable;
        // assume support rather than hiding the backend from rules.
        self.interfaces.is_empty()
            || self.interfaces.iter().any(|i| i == SCREENCAST_INTERFACE)
    }
}

/// Parsed `portals.conf` state after precedence merging
///
/// Keys in `preferred` are either the literal string `"default"` or a full
/// implementation interface name such as
/// `org.freedesktop.impl.portal.ScreenCast`. Values are the backend short
/// names in declared order (`kde`, `gtk`, `*`, `none`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalsConfig {
    /// Merged interface -> preferred-backend-list mapping
    pub preferred: BTreeMap<String, Vec<String>>,
    /// Files that contributed at least one key, highest precedence first
    pub sources: Vec<PathBuf>,
}

impl PortalsConfig {
    /// Preferred backends for an interface, falling back to `default`
    pub fn preferred_for(&self, interface: &str) -> Option<&[String]> {
        self.preferred
            .get(interface)
            .or_else(|| self.preferred.get("default"))
            .map(Vec::as_slice)
    }

    /// First concrete backend name preferred for an interface.
    ///
    /// `*` (any backend) and `none` (interface disabled) are not concrete
    /// choices and are skipped.
    pub fn first_concrete_for(&self, interface: &str) -> Option<&str> {
        self.preferred_for(interface)?
            .iter()
            .map(String::as_str)
            .find(|name| *name != "*" && *name != "none")
    }

    /// Whether no file contributed any preference
    pub fn is_empty(&self) -> bool {
        self.preferred.is_empty()
    }
}

/// Record of a sub-probe that exceeded its time budget.
///
/// Timeouts degrade the snapshot (the affected fields stay unknown) but
/// never abort collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionTimeout {
    /// Probe name (e.g. "backends", "services")
    pub probe: String,
    /// The budget the probe blew through
    pub budget_ms: u64,
}

/// Point-in-time observation of the screen-sharing stack.
///
/// Immutable by convention: nothing mutates a snapshot after
/// [`crate::facts::collect`] returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactSnapshot {
    /// When collection finished
    pub collected_at: DateTime<Utc>,
    /// wayland / x11 / unknown
    pub session_type: SessionType,
    /// Desktop environment family
    pub desktop: DesktopKind,
    /// Raw `XDG_CURRENT_DESKTOP` value (empty when unset)
    pub desktop_raw: String,
    /// Best-effort compositor identification
    pub compositor: CompositorFact,
    /// Discovered portal backends, in discovery order
    pub backends: Vec<PortalBackend>,
    /// Merged portals.conf view
    pub portals_conf: PortalsConfig,
    /// Whether org.freedesktop.portal.Desktop currently has an owner
    pub portal_frontend_owned: bool,
    /// PipeWire daemon observation
    pub pipewire: ComponentFact,
    /// WirePlumber session manager observation
    pub wireplumber: ComponentFact,
    /// Relevant systemd user units and their states
    pub units: BTreeMap<String, UnitState>,
    /// Sub-probes that exceeded their time budget during collection
    pub timeouts: Vec<CollectionTimeout>,
}

impl FactSnapshot {
    /// State of a unit, `Unknown` when it was not collected
    pub fn unit_state(&self, unit: &str) -> UnitState {
        self.units.get(unit).copied().unwrap_or(UnitState::Unknown)
    }

    /// Short names of backends currently running
    pub fn running_backend_names(&self) -> Vec<&str> {
        self.backends
            .iter()
            .filter(|b| b.running)
            .map(|b| b.name.as_str())
            .collect()
    }

    /// Short names of all installed backends
    pub fn installed_backend_names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name.as_str()).collect()
    }

    /// Units currently in the `failed` state
    pub fn failed_units(&self) -> Vec<&str> {
        self.units
            .iter()
            .filter(|(_, state)| **state == UnitState::Failed)
            .map(|(unit, _)| unit.as_str())
            .collect()
    }
}
