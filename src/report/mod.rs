//! Diagnostic report assembly
//!
//! Renders one self-contained markdown document from a fact snapshot, the
//! rule findings, an optional screencast probe outcome, and journal
//! excerpts. The document is scrubbed by [`Sanitizer`] as a whole, so
//! nothing that reaches the output can leak paths, names, or tokens the
//! individual sections forgot about.
//!
//! Assembly is pure: same inputs, same report.

use std::fmt::Write as _;

use crate::{
    facts::{backend_unit_name, FactSnapshot, PORTAL_FRONTEND_NAME, PORTAL_FRONTEND_UNIT, SCREENCAST_INTERFACE},
    probe::ProbeOutcome,
    rules::{Finding, OverallStatus, Severity},
};

mod sanitize;

pub use sanitize::Sanitizer;

/// Journal excerpt for one unit, gathered by the caller
#[derive(Debug, Clone)]
pub struct UnitLog {
    /// systemd unit the excerpt is from
    pub unit: String,
    /// Raw journal text (sanitized at assembly time, not here)
    pub excerpt: String,
}

/// Assemble a report scrubbed with identity taken from the environment
pub fn assemble(
    snapshot: &FactSnapshot,
    findings: &[Finding],
    probe: Option<&ProbeOutcome>,
    logs: &[UnitLog],
) -> String {
    assemble_with(&Sanitizer::from_env(), snapshot, findings, probe, logs)
}

/// Assemble a report with an explicit sanitizer
pub fn assemble_with(
    sanitizer: &Sanitizer,
    snapshot: &FactSnapshot,
    findings: &[Finding],
    probe: Option<&ProbeOutcome>,
    logs: &[UnitLog],
) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# Screen Sharing Diagnostic Report");
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "Collected: {}",
        snapshot.collected_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let _ = writeln!(out, "Doctor version: {}", env!("CARGO_PKG_VERSION"));
    let status = OverallStatus::from_findings(findings);
    let _ = writeln!(
        out,
        "Overall: {} {} ({})",
        status.emoji(),
        status,
        severity_tally(findings)
    );

    write_environment(&mut out, snapshot);
    write_portal_status(&mut out, snapshot);
    write_portal_config(&mut out, snapshot);
    write_media_stack(&mut out, snapshot);
    write_units(&mut out, snapshot);
    write_findings(&mut out, findings);
    write_probe(&mut out, probe);
    write_logs(&mut out, logs);
    write_collection_warnings(&mut out, snapshot);

    sanitizer.scrub(&out)
}

fn severity_tally(findings: &[Finding]) -> String {
    if findings.is_empty() {
        return "no findings".to_string();
    }
    let count = |severity: Severity| findings.iter().filter(|f| f.severity == severity).count();
    let mut parts = Vec::new();
    for severity in [Severity::Critical, Severity::Warning, Severity::Info] {
        let n = count(severity);
        if n > 0 {
            parts.push(format!("{n} {severity}"));
        }
    }
    parts.join(", ")
}

fn write_environment(out: &mut String, snapshot: &FactSnapshot) {
    let _ = writeln!(out, "\n## Environment\n");
    let _ = writeln!(out, "- Session type: {}", snapshot.session_type);
    if snapshot.desktop_raw.is_empty() {
        let _ = writeln!(
            out,
            "- Desktop: {} (XDG_CURRENT_DESKTOP unset)",
            snapshot.desktop
        );
    } else {
        let _ = writeln!(
            out,
            "- Desktop: {} (XDG_CURRENT_DESKTOP={})",
            snapshot.desktop, snapshot.desktop_raw
        );
    }
    let _ = writeln!(out, "- Compositor: {}", snapshot.compositor.label());
}

fn write_portal_status(out: &mut String, snapshot: &FactSnapshot) {
    let _ = writeln!(out, "\n## Portal status\n");
    let owned = if snapshot.portal_frontend_owned {
        "owned"
    } else {
        "not owned"
    };
    let _ = writeln!(out, "- Frontend {PORTAL_FRONTEND_NAME}: {owned} on the session bus");
    let _ = writeln!(
        out,
        "- Frontend unit {PORTAL_FRONTEND_UNIT}: {}",
        snapshot.unit_state(PORTAL_FRONTEND_UNIT)
    );

    if snapshot.backends.is_empty() {
        let _ = writeln!(out, "- No backend .portal files found");
        return;
    }
    let _ = writeln!(out, "- Backends:");
    for backend in &snapshot.backends {
        let running = if backend.running { "running" } else { "not running" };
        let _ = writeln!(out, "  - {} ({}): {running}", backend.name, backend.dbus_name);
        if let Some(path) = &backend.portal_file {
            let _ = writeln!(out, "    - Portal file: {}", path.display());
        }
        if backend.interfaces.is_empty() {
            let _ = writeln!(out, "    - Interfaces: (not declared)");
        } else {
            let _ = writeln!(out, "    - Interfaces: {}", backend.interfaces.join(", "));
        }
        if !backend.use_in.is_empty() {
            let _ = writeln!(out, "    - UseIn: {}", backend.use_in.join(";"));
        }
        if !backend.owned_names.is_empty() {
            let _ = writeln!(out, "    - Owns: {}", backend.owned_names.join(", "));
        }
        let unit = backend_unit_name(&backend.name);
        let _ = writeln!(out, "    - Unit {unit}: {}", snapshot.unit_state(&unit));
    }
}

fn write_portal_config(out: &mut String, snapshot: &FactSnapshot) {
    let _ = writeln!(out, "\n## Portal configuration\n");
    let conf = &snapshot.portals_conf;
    if conf.is_empty() {
        let _ = writeln!(
            out,
            "- No portals.conf found; the frontend falls back to UseIn= declarations and build defaults"
        );
        return;
    }
    for (key, backends) in &conf.preferred {
        let _ = writeln!(out, "- {key} = {}", backends.join(";"));
    }
    match conf.preferred_for(SCREENCAST_INTERFACE) {
        Some(prefs) => {
            let _ = writeln!(out, "- Effective ScreenCast preference: {}", prefs.join(";"));
        }
        None => {
            let _ = writeln!(out, "- Effective ScreenCast preference: (none configured)");
        }
    }
    if !conf.sources.is_empty() {
        let _ = writeln!(out, "- Sources (highest precedence first):");
        for source in &conf.sources {
            let _ = writeln!(out, "  - {}", source.display());
        }
    }
}

fn write_media_stack(out: &mut String, snapshot: &FactSnapshot) {
    let _ = writeln!(out, "\n## Media stack\n");
    let _ = writeln!(out, "- PipeWire: {}", snapshot.pipewire.summary());
    let _ = writeln!(out, "- WirePlumber: {}", snapshot.wireplumber.summary());
}

fn write_units(out: &mut String, snapshot: &FactSnapshot) {
    let _ = writeln!(out, "\n## Service units\n");
    if snapshot.units.is_empty() {
        let _ = writeln!(out, "- No unit states collected (systemctl unavailable?)");
        return;
    }
    for (unit, state) in &snapshot.units {
        let _ = writeln!(out, "- {unit}: {state}");
    }
}

fn write_findings(out: &mut String, findings: &[Finding]) {
    let _ = writeln!(out, "\n## Findings ({})\n", findings.len());
    if findings.is_empty() {
        let _ = writeln!(out, "No problems found. ✅");
        return;
    }
    for (index, finding) in findings.iter().enumerate() {
        let _ = writeln!(
            out,
            "{}. {} **{}** (`{}`, {})",
            index + 1,
            finding.severity.emoji(),
            finding.title,
            finding.id,
            finding.severity
        );
        let _ = writeln!(out);
        let _ = writeln!(out, "   {}", finding.explanation);
        if !finding.affected_facts.is_empty() {
            let _ = writeln!(out, "   - Facts: {}", finding.affected_facts.join(", "));
        }
        if let Some(fix) = &finding.fix {
            let _ = writeln!(
                out,
                "   - Fix: {} (apply with `--fix {}`)",
                fix.describe(),
                finding.id
            );
        }
        let _ = writeln!(out);
    }
}

fn write_probe(out: &mut String, probe: Option<&ProbeOutcome>) {
    let _ = writeln!(out, "\n## Screencast probe\n");
    match probe {
        Some(outcome) => {
            let _ = writeln!(out, "- {}", outcome.summary());
        }
        None => {
            let _ = writeln!(
                out,
                "- Not run. Pass --test-screencast to exercise the portal end to end."
            );
        }
    }
}

fn write_logs(out: &mut String, logs: &[UnitLog]) {
    if logs.is_empty() {
        return;
    }
    let _ = writeln!(out, "\n## Recent logs");
    for log in logs {
        let _ = writeln!(out, "\n### {}\n", log.unit);
        let _ = writeln!(out, "```text");
        let _ = writeln!(out, "{}", log.excerpt.trim_end());
        let _ = writeln!(out, "```");
    }
}

fn write_collection_warnings(out: &mut String, snapshot: &FactSnapshot) {
    if snapshot.timeouts.is_empty() {
        return;
    }
    let _ = writeln!(out, "\n## Collection warnings\n");
    for timeout in &snapshot.timeouts {
        let _ = writeln!(
            out,
            "- The \"{}\" probe exceeded its {} ms budget; the related facts are reported as unknown",
            timeout.probe, timeout.budget_ms
        );
    }
}
