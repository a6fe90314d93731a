//! The individual diagnostic rules
//!
//! Every predicate takes the snapshot and returns at most one finding whose
//! explanation names the concrete fact values that triggered it. Predicates
//! never look at each other's output.

use crate::facts::{
    backend_unit_name, ComponentStatus, DesktopKind, FactSnapshot, SessionType, UnitState,
    PORTAL_FRONTEND_NAME, PORTAL_FRONTEND_UNIT, SCREENCAST_INTERFACE,
};

use super::{Finding, FixRef, Severity};

/// Backend short names a desktop family is expected to run, best first
fn expected_backends(facts: &FactSnapshot) -> Vec<&'static str> {
    match facts.desktop {
        DesktopKind::Kde => vec!["kde"],
        DesktopKind::Gnome => vec!["gnome", "gtk"],
        DesktopKind::WlrootsGeneric => {
            let hyprland = facts.desktop_raw.to_lowercase().contains("hyprland")
                || facts.compositor.name.as_deref() == Some("Hyprland");
            if hyprland {
                vec!["hyprland", "wlr"]
            } else {
                vec!["wlr", "hyprland"]
            }
        }
        // No strong expectation; the reference backend is the safest bet
        DesktopKind::Other | DesktopKind::Unknown => vec!["gtk"],
    }
}

fn format_list(items: &[&str]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}

pub(super) fn x11_session_detected(facts: &FactSnapshot) -> Option<Finding> {
    if facts.session_type != SessionType::X11 {
        return None;
    }

    Some(Finding {
        id: "x11-session-detected",
        severity: Severity::Warning,
        title: "X11 session detected".to_string(),
        explanation: format!(
            "The login session type is 'x11' (desktop: {}). Portal-based screen \
             casting is the Wayland path; under X11 most applications capture \
             directly and a working portal here says little about a Wayland login.",
            if facts.desktop_raw.is_empty() {
                "unknown"
            } else {
                &facts.desktop_raw
            }
        ),
        affected_facts: vec!["session_type".to_string()],
        fix: None,
    })
}

pub(super) fn portal_not_running(facts: &FactSnapshot) -> Option<Finding> {
    if facts.portal_frontend_owned {
        return None;
    }
    let state = facts.unit_state(PORTAL_FRONTEND_UNIT);
    if !matches!(state, UnitState::Inactive | UnitState::NotFound) {
        return None;
    }

    // A missing unit cannot be restarted; the package is simply absent
    let fix = (state == UnitState::Inactive).then(|| FixRef::RestartUnits {
        units: vec![PORTAL_FRONTEND_UNIT.to_string()],
    });

    Some(Finding {
        id: "portal-not-running",
        severity: Severity::Critical,
        title: "xdg-desktop-portal is not running".to_string(),
        explanation: format!(
            "{PORTAL_FRONTEND_NAME} has no owner on the session bus and \
             {PORTAL_FRONTEND_UNIT} is {state}. Applications cannot reach the \
             portal at all, so every screen-share attempt fails immediately."
        ),
        affected_facts: vec![
            format!("units.{PORTAL_FRONTEND_UNIT}"),
            "portal_frontend_owned".to_string(),
        ],
        fix,
    })
}

pub(super) fn portal_backend_mismatch(facts: &FactSnapshot) -> Option<Finding> {
    let running = facts.running_backend_names();
    let installed = facts.installed_backend_names();
    let expected = expected_backends(facts);
    let pinned = facts.portals_conf.first_concrete_for(SCREENCAST_INTERFACE);

    // First expected backend that is actually installed, for fix suggestions
    let suggestion = expected
        .iter()
        .copied()
        .find(|e| installed.contains(e))
        .map(str::to_string);
    let suggested_fix = |suggestion: Option<String>| {
        suggestion.map(|backend| {
            if pinned == Some(backend.as_str()) {
                // Config already points at the right backend; it is just dead
                FixRef::RestartUnits {
                    units: vec![backend_unit_name(&backend)],
                }
            } else {
                FixRef::SetPreferredBackend { backend }
            }
        })
    };

    // Screen casting explicitly disabled in portals.conf
    if facts
        .portals_conf
        .preferred_for(SCREENCAST_INTERFACE)
        .is_some_and(|list| list.iter().any(|b| b == "none"))
    {
        let sources = facts
            .portals_conf
            .sources
            .first()
            .map(|p| format!(" (configured in {})", p.display()))
            .unwrap_or_default();
        return Some(Finding {
            id: "portal-backend-mismatch",
            severity: Severity::Critical,
            title: "Screen casting disabled by portals.conf".to_string(),
            explanation: format!(
                "portals.conf resolves the ScreenCast interface to 'none'{sources}, \
                 which disables screen capture for every application."
            ),
            affected_facts: vec!["portals_conf".to_string()],
            fix: suggested_fix(suggestion),
        });
    }

    let mut problems = Vec::new();

    // The configured preference is not servicing requests
    if let Some(pinned) = pinned {
        if !running.contains(&pinned) {
            problems.push(format!(
                "portals.conf prefers '{pinned}' for screen casting but that \
                 backend is not running"
            ));
        }
    }

    // The desktop's expected backend is absent from the running set
    if matches!(
        facts.desktop,
        DesktopKind::Kde | DesktopKind::Gnome | DesktopKind::WlrootsGeneric
    ) && !expected.iter().any(|e| running.contains(e))
    {
        problems.push(format!(
            "desktop '{}' expects one of [{}] to service screen casting",
            facts.desktop,
            expected.join(", ")
        ));
    }

    if problems.is_empty() {
        return None;
    }

    Some(Finding {
        id: "portal-backend-mismatch",
        severity: Severity::Critical,
        title: "Wrong portal backend for this desktop".to_string(),
        explanation: format!(
            "{}. Running backends: [{}]; installed: [{}].",
            problems.join("; "),
            format_list(&running),
            format_list(&installed)
        ),
        affected_facts: vec!["portals_conf".to_string(), "backends".to_string()],
        fix: suggested_fix(suggestion),
    })
}

pub(super) fn backend_not_running(facts: &FactSnapshot) -> Option<Finding> {
    if facts.backends.is_empty() || !facts.running_backend_names().is_empty() {
        return None;
    }

    let installed = facts.installed_backend_names();
    let target = expected_backends(facts)
        .into_iter()
        .find(|e| installed.contains(e))
        .map(str::to_string)
        .or_else(|| installed.first().map(|s| (*s).to_string()));

    // Restart the backend, then the frontend so it rebinds
    let fix = target.map(|backend| FixRef::RestartUnits {
        units: vec![
            backend_unit_name(&backend),
            PORTAL_FRONTEND_UNIT.to_string(),
        ],
    });

    Some(Finding {
        id: "backend-not-running",
        severity: Severity::Critical,
        title: "No portal backend is running".to_string(),
        explanation: format!(
            "{} portal backend(s) are installed ([{}]) but none is running, so \
             the portal frontend has no implementation to forward ScreenCast \
             requests to.",
            facts.backends.len(),
            format_list(&installed)
        ),
        affected_facts: vec!["backends".to_string()],
        fix,
    })
}

pub(super) fn service_broken(facts: &FactSnapshot) -> Option<Finding> {
    let failed = facts.failed_units();
    if failed.is_empty() {
        return None;
    }

    let title = if failed.len() == 1 {
        format!("{} has failed", failed[0])
    } else {
        format!("{} systemd user units have failed", failed.len())
    };

    Some(Finding {
        id: "service-broken",
        severity: Severity::Critical,
        title,
        explanation: format!(
            "The following units are in the 'failed' state: {}. A failed unit \
             stays down until restarted and takes its part of the screen-sharing \
             stack with it.",
            failed.join(", ")
        ),
        affected_facts: failed.iter().map(|u| format!("units.{u}")).collect(),
        fix: Some(FixRef::RestartUnits {
            units: failed.iter().map(|u| (*u).to_string()).collect(),
        }),
    })
}

pub(super) fn component_missing(facts: &FactSnapshot) -> Option<Finding> {
    let mut missing = Vec::new();
    let mut affected = Vec::new();

    if facts.pipewire.status == ComponentStatus::NotInstalled {
        missing.push("PipeWire (no 'pipewire' binary found)");
        affected.push("pipewire.status".to_string());
    }
    if facts.wireplumber.status == ComponentStatus::NotInstalled
        && !facts
            .unit_state("pipewire-media-session.service")
            .is_active()
    {
        // pipewire-media-session is an acceptable legacy substitute
        missing.push("WirePlumber (no 'wireplumber' binary found)");
        affected.push("wireplumber.status".to_string());
    }

    if missing.is_empty() {
        return None;
    }

    Some(Finding {
        id: "component-missing",
        severity: Severity::Critical,
        title: "Required component not installed".to_string(),
        explanation: format!(
            "Missing: {}. Portal screen capture delivers frames over PipeWire \
             streams; without these components no backend can produce a stream. \
             Install them with the system package manager.",
            missing.join("; ")
        ),
        affected_facts: affected,
        // Not fixable by a config edit or restart
        fix: None,
    })
}

pub(super) fn pipewire_not_running(facts: &FactSnapshot) -> Option<Finding> {
    if facts.pipewire.status != ComponentStatus::Stopped {
        return None;
    }

    Some(Finding {
        id: "pipewire-not-running",
        severity: Severity::Critical,
        title: "PipeWire is installed but not running".to_string(),
        explanation: format!(
            "PipeWire {} is installed but no daemon is active (pipewire.service \
             is {}). Without the daemon, granted capture sessions produce no \
             frames.",
            facts.pipewire.version.as_deref().unwrap_or("(version unknown)"),
            facts.unit_state("pipewire.service")
        ),
        affected_facts: vec![
            "pipewire.status".to_string(),
            "units.pipewire.service".to_string(),
        ],
        fix: Some(FixRef::RestartUnits {
            units: vec!["pipewire.service".to_string()],
        }),
    })
}

pub(super) fn multiple_backend_conflict(facts: &FactSnapshot) -> Option<Finding> {
    let owners: Vec<&str> = facts
        .backends
        .iter()
        .filter(|b| !b.owned_names.is_empty())
        .map(|b| b.name.as_str())
        .collect();
    if owners.len() <= 1 {
        return None;
    }

    Some(Finding {
        id: "multiple-backend-conflict",
        severity: Severity::Warning,
        title: "Multiple portal backends active at once".to_string(),
        explanation: format!(
            "Backends [{}] own portal implementation names simultaneously. \
             Exactly one implementation should service the ScreenCast interface \
             per session; with several alive, request routing depends on startup \
             order and can change between logins.",
            owners.join(", ")
        ),
        affected_facts: owners.iter().map(|n| format!("backends.{n}")).collect(),
        fix: None,
    })
}

pub(super) fn wireplumber_not_running(facts: &FactSnapshot) -> Option<Finding> {
    if facts.wireplumber.status != ComponentStatus::Stopped {
        return None;
    }
    if facts
        .unit_state("pipewire-media-session.service")
        .is_active()
    {
        return None;
    }

    Some(Finding {
        id: "wireplumber-not-running",
        severity: Severity::Warning,
        title: "WirePlumber is installed but not running".to_string(),
        explanation: format!(
            "WirePlumber {} is installed but not running (wireplumber.service is \
             {}) and no alternative session manager is active. PipeWire needs a \
             session manager to link capture streams.",
            facts
                .wireplumber
                .version
                .as_deref()
                .unwrap_or("(version unknown)"),
            facts.unit_state("wireplumber.service")
        ),
        affected_facts: vec![
            "wireplumber.status".to_string(),
            "units.wireplumber.service".to_string(),
        ],
        fix: Some(FixRef::RestartUnits {
            units: vec!["wireplumber.service".to_string()],
        }),
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use crate::facts::{
        ComponentFact, ComponentStatus, CompositorFact, DesktopKind, FactSnapshot, PortalBackend,
        PortalsConfig, SessionType, UnitState, BACKEND_NAME_PREFIX, PORTAL_FRONTEND_UNIT,
        SCREENCAST_INTERFACE,
    };

    /// Installed backend; `running` also gives it its implementation name
    pub(crate) fn backend(name: &str, running: bool) -> PortalBackend {
        let dbus_name = format!("{BACKEND_NAME_PREFIX}{name}");
        PortalBackend {
            name: name.to_string(),
            dbus_name: dbus_name.clone(),
            portal_file: None,
            interfaces: vec![SCREENCAST_INTERFACE.to_string()],
            use_in: vec![name.to_string()],
            running,
            owned_names: if running { vec![dbus_name] } else { vec![] },
        }
    }

    /// A KDE Wayland system with nothing wrong
    pub(crate) fn healthy_snapshot() -> FactSnapshot {
        let mut units = BTreeMap::new();
        units.insert(PORTAL_FRONTEND_UNIT.to_string(), UnitState::Active);
        units.insert(
            "xdg-desktop-portal-kde.service".to_string(),
            UnitState::Active,
        );
        units.insert(
            "xdg-desktop-portal-gtk.service".to_string(),
            UnitState::Inactive,
        );
        units.insert("pipewire.service".to_string(), UnitState::Active);
        units.insert("pipewire.socket".to_string(), UnitState::Active);
        units.insert("wireplumber.service".to_string(), UnitState::Active);
        units.insert(
            "pipewire-media-session.service".to_string(),
            UnitState::NotFound,
        );

        FactSnapshot {
            collected_at: Utc::now(),
            session_type: SessionType::Wayland,
            desktop: DesktopKind::Kde,
            desktop_raw: "KDE".to_string(),
            compositor: CompositorFact {
                name: Some("kwin_wayland".to_string()),
                version: Some("6.0.4".to_string()),
            },
            backends: vec![backend("kde", true), backend("gtk", false)],
            portals_conf: PortalsConfig::default(),
            portal_frontend_owned: true,
            pipewire: ComponentFact {
                status: ComponentStatus::Running,
                version: Some("1.0.5".to_string()),
            },
            wireplumber: ComponentFact {
                status: ComponentStatus::Running,
                version: Some("0.5.2".to_string()),
            },
            units,
            timeouts: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{backend, healthy_snapshot};
    use super::*;

    #[test]
    fn test_x11_session_fires_only_on_x11() {
        let mut snapshot = healthy_snapshot();
        assert!(x11_session_detected(&snapshot).is_none());

        snapshot.session_type = SessionType::X11;
        let finding = x11_session_detected(&snapshot).unwrap();
        assert_eq!(finding.severity, Severity::Warning);
        assert!(finding.explanation.contains("x11"));
        assert!(finding.fix.is_none());
    }

    #[test]
    fn test_portal_not_running_inactive_unit() {
        let mut snapshot = healthy_snapshot();
        snapshot.portal_frontend_owned = false;
        snapshot
            .units
            .insert(PORTAL_FRONTEND_UNIT.to_string(), UnitState::Inactive);

        let finding = portal_not_running(&snapshot).unwrap();
        assert_eq!(finding.severity, Severity::Critical);
        assert!(finding.explanation.contains("inactive"));
        assert_eq!(
            finding.fix,
            Some(FixRef::RestartUnits {
                units: vec![PORTAL_FRONTEND_UNIT.to_string()]
            })
        );
    }

    #[test]
    fn test_portal_not_running_missing_unit_has_no_fix() {
        let mut snapshot = healthy_snapshot();
        snapshot.portal_frontend_owned = false;
        snapshot
            .units
            .insert(PORTAL_FRONTEND_UNIT.to_string(), UnitState::NotFound);

        let finding = portal_not_running(&snapshot).unwrap();
        assert!(finding.fix.is_none());
    }

    #[test]
    fn test_portal_not_running_quiet_when_owned() {
        // Bus ownership wins over a stale unit state
        let mut snapshot = healthy_snapshot();
        snapshot
            .units
            .insert(PORTAL_FRONTEND_UNIT.to_string(), UnitState::Inactive);
        assert!(portal_not_running(&snapshot).is_none());
    }

    #[test]
    fn test_mismatch_quiet_on_matching_setup() {
        assert!(portal_backend_mismatch(&healthy_snapshot()).is_none());
    }

    #[test]
    fn test_mismatch_pinned_backend_not_running() {
        // Desktop has no expectation, but the pinned backend is dead
        let mut snapshot = healthy_snapshot();
        snapshot.desktop = DesktopKind::Other;
        snapshot.desktop_raw = "XFCE".to_string();
        snapshot.backends = vec![backend("kde", false), backend("gtk", true)];
        snapshot
            .portals_conf
            .preferred
            .insert(SCREENCAST_INTERFACE.to_string(), vec!["kde".to_string()]);

        let finding = portal_backend_mismatch(&snapshot).unwrap();
        assert!(finding.explanation.contains("'kde'"));
        assert!(finding.explanation.contains("not running"));
    }

    #[test]
    fn test_mismatch_desktop_expectation_independent_of_pin() {
        // The pinned backend runs, but it is the wrong one for this desktop
        let mut snapshot = healthy_snapshot();
        snapshot.desktop = DesktopKind::Gnome;
        snapshot.desktop_raw = "GNOME".to_string();
        snapshot.backends = vec![backend("kde", true)];
        snapshot
            .portals_conf
            .preferred
            .insert("default".to_string(), vec!["kde".to_string()]);

        let finding = portal_backend_mismatch(&snapshot).unwrap();
        assert_eq!(finding.severity, Severity::Critical);
        assert!(finding.explanation.contains("gnome"));
        assert!(finding.explanation.contains("kde"));
        // gnome/gtk not installed, nothing sensible to suggest
        assert!(finding.fix.is_none());
    }

    #[test]
    fn test_mismatch_suggests_config_fix_when_expected_installed() {
        let mut snapshot = healthy_snapshot();
        snapshot.desktop = DesktopKind::Gnome;
        snapshot.desktop_raw = "GNOME".to_string();
        snapshot.backends = vec![backend("gnome", false), backend("kde", true)];

        let finding = portal_backend_mismatch(&snapshot).unwrap();
        assert_eq!(
            finding.fix,
            Some(FixRef::SetPreferredBackend {
                backend: "gnome".to_string()
            })
        );
    }

    #[test]
    fn test_mismatch_suggests_restart_when_pin_already_correct() {
        let mut snapshot = healthy_snapshot();
        snapshot.backends = vec![backend("kde", false), backend("gtk", true)];
        snapshot
            .portals_conf
            .preferred
            .insert(SCREENCAST_INTERFACE.to_string(), vec!["kde".to_string()]);

        let finding = portal_backend_mismatch(&snapshot).unwrap();
        assert_eq!(
            finding.fix,
            Some(FixRef::RestartUnits {
                units: vec!["xdg-desktop-portal-kde.service".to_string()]
            })
        );
    }

    #[test]
    fn test_mismatch_reports_disabled_interface() {
        let mut snapshot = healthy_snapshot();
        snapshot
            .portals_conf
            .preferred
            .insert(SCREENCAST_INTERFACE.to_string(), vec!["none".to_string()]);

        let finding = portal_backend_mismatch(&snapshot).unwrap();
        assert!(finding.explanation.contains("'none'"));
        assert_eq!(
            finding.fix,
            Some(FixRef::SetPreferredBackend {
                backend: "kde".to_string()
            })
        );
    }

    #[test]
    fn test_mismatch_ignores_wildcard_pin() {
        let mut snapshot = healthy_snapshot();
        snapshot
            .portals_conf
            .preferred
            .insert("default".to_string(), vec!["*".to_string()]);
        assert!(portal_backend_mismatch(&snapshot).is_none());
    }

    #[test]
    fn test_backend_not_running() {
        let mut snapshot = healthy_snapshot();
        snapshot.backends = vec![backend("kde", false), backend("gtk", false)];

        let finding = backend_not_running(&snapshot).unwrap();
        assert_eq!(finding.severity, Severity::Critical);
        assert!(finding.explanation.contains("kde"));
        assert_eq!(
            finding.fix,
            Some(FixRef::RestartUnits {
                units: vec![
                    "xdg-desktop-portal-kde.service".to_string(),
                    PORTAL_FRONTEND_UNIT.to_string(),
                ]
            })
        );
    }

    #[test]
    fn test_backend_not_running_quiet_cases() {
        // Something runs
        assert!(backend_not_running(&healthy_snapshot()).is_none());

        // Nothing installed at all: not this rule's story
        let mut snapshot = healthy_snapshot();
        snapshot.backends.clear();
        assert!(backend_not_running(&snapshot).is_none());
    }

    #[test]
    fn test_service_broken_lists_failed_units() {
        let mut snapshot = healthy_snapshot();
        snapshot
            .units
            .insert("pipewire.service".to_string(), UnitState::Failed);
        snapshot
            .units
            .insert("wireplumber.service".to_string(), UnitState::Failed);

        let finding = service_broken(&snapshot).unwrap();
        assert!(finding.explanation.contains("pipewire.service"));
        assert!(finding.explanation.contains("wireplumber.service"));
        assert_eq!(
            finding.fix,
            Some(FixRef::RestartUnits {
                units: vec![
                    "pipewire.service".to_string(),
                    "wireplumber.service".to_string()
                ]
            })
        );
    }

    #[test]
    fn test_component_missing_pipewire() {
        let mut snapshot = healthy_snapshot();
        snapshot.pipewire.status = ComponentStatus::NotInstalled;

        let finding = component_missing(&snapshot).unwrap();
        assert_eq!(finding.severity, Severity::Critical);
        assert!(finding.explanation.contains("PipeWire"));
        // Not fixable by a config edit
        assert!(finding.fix.is_none());
    }

    #[test]
    fn test_component_missing_wireplumber_media_session_substitute() {
        let mut snapshot = healthy_snapshot();
        snapshot.wireplumber.status = ComponentStatus::NotInstalled;
        snapshot.units.insert(
            "pipewire-media-session.service".to_string(),
            UnitState::Active,
        );
        assert!(component_missing(&snapshot).is_none());

        snapshot.units.insert(
            "pipewire-media-session.service".to_string(),
            UnitState::NotFound,
        );
        let finding = component_missing(&snapshot).unwrap();
        assert!(finding.explanation.contains("WirePlumber"));
    }

    #[test]
    fn test_pipewire_not_running() {
        let mut snapshot = healthy_snapshot();
        snapshot.pipewire.status = ComponentStatus::Stopped;
        snapshot
            .units
            .insert("pipewire.service".to_string(), UnitState::Inactive);

        let finding = pipewire_not_running(&snapshot).unwrap();
        assert_eq!(finding.severity, Severity::Critical);
        assert!(finding.explanation.contains("1.0.5"));
        assert!(finding.explanation.contains("inactive"));

        snapshot.pipewire.status = ComponentStatus::NotInstalled;
        assert!(pipewire_not_running(&snapshot).is_none());
    }

    #[test]
    fn test_multiple_backend_conflict() {
        let mut snapshot = healthy_snapshot();
        snapshot.backends = vec![backend("kde", true), backend("gnome", true)];

        let finding = multiple_backend_conflict(&snapshot).unwrap();
        assert_eq!(finding.severity, Severity::Warning);
        assert!(finding.explanation.contains("kde"));
        assert!(finding.explanation.contains("gnome"));
        assert!(finding.fix.is_none());

        snapshot.backends = vec![backend("kde", true), backend("gnome", false)];
        assert!(multiple_backend_conflict(&snapshot).is_none());
    }

    #[test]
    fn test_wireplumber_not_running() {
        let mut snapshot = healthy_snapshot();
        snapshot.wireplumber.status = ComponentStatus::Stopped;
        snapshot
            .units
            .insert("wireplumber.service".to_string(), UnitState::Inactive);

        let finding = wireplumber_not_running(&snapshot).unwrap();
        assert_eq!(finding.severity, Severity::Warning);
        assert_eq!(
            finding.fix,
            Some(FixRef::RestartUnits {
                units: vec!["wireplumber.service".to_string()]
            })
        );

        // Legacy session manager covers for it
        snapshot.units.insert(
            "pipewire-media-session.service".to_string(),
            UnitState::Active,
        );
        assert!(wireplumber_not_running(&snapshot).is_none());
    }
}
