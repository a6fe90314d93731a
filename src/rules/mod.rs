//! Diagnostic rule engine
//!
//! A fixed, declaratively ordered table of independent predicates over a
//! [`FactSnapshot`]. Each rule sees only the snapshot, never another rule's
//! output, so rules can be tested one by one. [`evaluate`] is pure: equal
//! snapshots produce identical finding sequences.
//!
//! Output ordering is a total order: severity first (critical, warning,
//! info), rule declaration order second. Reports and UI diffs depend on
//! this being stable.

use std::{fmt, panic::AssertUnwindSafe};

use serde::Serialize;
use tracing::{debug, error};

use crate::facts::FactSnapshot;

mod checks;

#[cfg(test)]
pub(crate) use checks::test_support;

/// Finding severity, worst first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Screen sharing cannot work until this is resolved
    Critical,
    /// Screen sharing may work but is fragile or degraded
    Warning,
    /// Worth knowing, no action required
    Info,
}

impl Severity {
    /// Stable lowercase name for logs and JSON output
    pub fn name(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }

    /// Marker used in CLI output and reports
    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Critical => "❌",
            Self::Warning => "⚠️",
            Self::Info => "ℹ️",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Reference to a repair the fix engine knows how to perform.
///
/// Findings carry these instead of concrete fix implementations so the rule
/// layer stays pure and the dependency points one way (fixes consume rules,
/// never the reverse).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FixRef {
    /// Write a user-level portals.conf preferring the given backend
    SetPreferredBackend { backend: String },
    /// Restart systemd user units, in order
    RestartUnits { units: Vec<String> },
}

impl FixRef {
    /// One-line human description used in findings and previews
    pub fn describe(&self) -> String {
        match self {
            Self::SetPreferredBackend { backend } => {
                format!("Write a user portals.conf preferring the '{backend}' backend")
            }
            Self::RestartUnits { units } => {
                format!("Restart {}", units.join(", "))
            }
        }
    }
}

/// One diagnosed problem
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    /// Stable rule identifier (e.g. "portal-backend-mismatch")
    pub id: &'static str,
    /// How badly this breaks screen sharing
    pub severity: Severity,
    /// Short headline for lists
    pub title: String,
    /// Names the concrete fact values that triggered the rule
    pub explanation: String,
    /// Snapshot fields this finding is based on (e.g. "session_type",
    /// "units.pipewire.service")
    pub affected_facts: Vec<String>,
    /// Proposed repair, when one exists
    pub fix: Option<FixRef>,
}

/// A single diagnostic rule: identifier plus predicate
struct Rule {
    id: &'static str,
    check: fn(&FactSnapshot) -> Option<Finding>,
}

/// All rules, in declaration order. The order is part of the output
/// contract; append new rules rather than reordering.
const RULES: &[Rule] = &[
    Rule {
        id: "x11-session-detected",
        check: checks::x11_session_detected,
    },
    Rule {
        id: "portal-not-running",
        check: checks::portal_not_running,
    },
    Rule {
        id: "portal-backend-mismatch",
        check: checks::portal_backend_mismatch,
    },
    Rule {
        id: "backend-not-running",
        check: checks::backend_not_running,
    },
    Rule {
        id: "service-broken",
        check: checks::service_broken,
    },
    Rule {
        id: "component-missing",
        check: checks::component_missing,
    },
    Rule {
        id: "pipewire-not-running",
        check: checks::pipewire_not_running,
    },
    Rule {
        id: "multiple-backend-conflict",
        check: checks::multiple_backend_conflict,
    },
    Rule {
        id: "wireplumber-not-running",
        check: checks::wireplumber_not_running,
    },
];

/// Evaluate every rule against a snapshot.
///
/// Pure and deterministic. A rule that panics is logged and skipped; it can
/// never take the other rules down with it.
pub fn evaluate(snapshot: &FactSnapshot) -> Vec<Finding> {
    let mut findings: Vec<(usize, Finding)> = Vec::new();

    for (index, rule) in RULES.iter().enumerate() {
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| (rule.check)(snapshot)));
        match result {
            Ok(Some(finding)) => {
                debug_assert_eq!(finding.id, rule.id);
                debug!(rule = rule.id, severity = %finding.severity, "rule fired");
                findings.push((index, finding));
            }
            Ok(None) => {}
            Err(_) => {
                error!(rule = rule.id, "rule panicked during evaluation, skipped");
            }
        }
    }

    findings.sort_by_key(|(index, finding)| (finding.severity, *index));
    findings.into_iter().map(|(_, finding)| finding).collect()
}

/// Overall stack health derived from a finding sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    /// At least one critical finding
    Broken,
    /// Warnings only
    Degraded,
    /// No findings at all
    Healthy,
}

impl OverallStatus {
    /// Worst severity present, mapped to a status
    pub fn from_findings(findings: &[Finding]) -> Self {
        match findings.iter().map(|f| f.severity).min() {
            Some(Severity::Critical) => Self::Broken,
            Some(Severity::Warning) => Self::Degraded,
            Some(Severity::Info) | None => Self::Healthy,
        }
    }

    /// Stable lowercase name for logs and JSON output
    pub fn name(&self) -> &'static str {
        match self {
            Self::Broken => "broken",
            Self::Degraded => "degraded",
            Self::Healthy => "healthy",
        }
    }

    /// Marker used in CLI output and the report header
    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Broken => "❌",
            Self::Degraded => "⚠️",
            Self::Healthy => "✅",
        }
    }
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{backend, healthy_snapshot};
    use super::*;
    use crate::facts::{ComponentStatus, DesktopKind, SessionType, UnitState};

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical < Severity::Warning);
        assert!(Severity::Warning < Severity::Info);
    }

    #[test]
    fn test_healthy_snapshot_yields_no_findings() {
        let snapshot = healthy_snapshot();
        let findings = evaluate(&snapshot);
        assert!(findings.is_empty(), "unexpected findings: {findings:?}");
        assert_eq!(OverallStatus::from_findings(&findings), OverallStatus::Healthy);
    }

    #[test]
    fn test_evaluate_is_deterministic() {
        let mut snapshot = healthy_snapshot();
        snapshot.session_type = SessionType::X11;
        snapshot.pipewire.status = ComponentStatus::NotInstalled;

        let first = evaluate(&snapshot);
        let second = evaluate(&snapshot);
        let ids: Vec<&str> = first.iter().map(|f| f.id).collect();
        let ids_again: Vec<&str> = second.iter().map(|f| f.id).collect();
        assert_eq!(ids, ids_again);
    }

    #[test]
    fn test_ordering_severity_then_declaration() {
        let mut snapshot = healthy_snapshot();
        // warning (declared first) + two criticals (declared later)
        snapshot.session_type = SessionType::X11;
        snapshot.pipewire.status = ComponentStatus::NotInstalled;
        snapshot
            .units
            .insert("xdg-desktop-portal-kde.service".to_string(), UnitState::Failed);

        let findings = evaluate(&snapshot);
        let ids: Vec<&str> = findings.iter().map(|f| f.id).collect();
        // criticals first in declaration order, then the warning
        assert_eq!(
            ids,
            vec!["service-broken", "component-missing", "x11-session-detected"]
        );

        let severities: Vec<Severity> = findings.iter().map(|f| f.severity).collect();
        let mut sorted = severities.clone();
        sorted.sort();
        assert_eq!(severities, sorted, "severity must be non-increasing");
    }

    #[test]
    fn test_gnome_desktop_with_kde_backend_is_a_mismatch() {
        // Configured backend runs fine, but it is the wrong one for GNOME
        let mut snapshot = healthy_snapshot();
        snapshot.desktop = DesktopKind::Gnome;
        snapshot.desktop_raw = "GNOME".into();
        snapshot.backends = vec![backend("kde", true)];
        snapshot
            .portals_conf
            .preferred
            .insert("default".into(), vec!["kde".into()]);

        let findings = evaluate(&snapshot);
        let mismatch = findings
            .iter()
            .find(|f| f.id == "portal-backend-mismatch")
            .expect("mismatch finding");
        assert_eq!(mismatch.severity, Severity::Critical);
        assert!(mismatch.explanation.contains("gnome"));
        assert!(mismatch.explanation.contains("kde"));
    }

    #[test]
    fn test_overall_status() {
        let critical = Finding {
            id: "portal-backend-mismatch",
            severity: Severity::Critical,
            title: String::new(),
            explanation: String::new(),
            affected_facts: vec![],
            fix: None,
        };
        let warning = Finding {
            severity: Severity::Warning,
            ..critical.clone()
        };

        assert_eq!(
            OverallStatus::from_findings(&[critical.clone(), warning.clone()]),
            OverallStatus::Broken
        );
        assert_eq!(
            OverallStatus::from_findings(&[warning]),
            OverallStatus::Degraded
        );
        assert_eq!(OverallStatus::from_findings(&[]), OverallStatus::Healthy);
    }

    #[test]
    fn test_fix_ref_describe() {
        let fix = FixRef::SetPreferredBackend {
            backend: "gnome".into(),
        };
        assert!(fix.describe().contains("gnome"));

        let fix = FixRef::RestartUnits {
            units: vec!["pipewire.service".into(), "wireplumber.service".into()],
        };
        assert!(fix.describe().contains("pipewire.service, wireplumber.service"));
    }
}
