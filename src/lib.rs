//! # lamco-portal-doctor
//!
//! Diagnostic tool for Wayland screen sharing - checks, explains, and
//! repairs the XDG Desktop Portal / PipeWire stack.
//!
//! Screen sharing on Wayland involves a chain of cooperating services:
//! the compositor, the portal frontend (`xdg-desktop-portal`), a
//! desktop-specific portal backend, and PipeWire with its session
//! manager. When any link is missing or misconfigured, applications
//! just show a black screen or an empty picker with no explanation.
//! This crate observes the whole chain, diagnoses it against a set of
//! rules, and can apply targeted fixes.
//!
//! # Architecture
//!
//! ```text
//! lamco-portal-doctor
//!   ├─> Fact Collection (session env, backends, portals.conf, units, PipeWire)
//!   ├─> Diagnostic Rules (findings with severity + explanation over a snapshot)
//!   ├─> Fix Engine (preview, transactional apply, backup, undo)
//!   ├─> Screencast Probe (live portal negotiation, like a real app)
//!   └─> Report Assembly (sanitized markdown for bug trackers)
//! ```
//!
//! # Data Flow
//!
//! **Check Path:** Probes → FactSnapshot → Rules → Findings → stdout
//!
//! **Fix Path:** Finding → FixPlan preview → confirm → apply + backup → re-check
//!
//! **Probe Path:** CreateSession → SelectSources → Start → PipeWire node ids

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Doctor configuration (logging, probe budgets, backup location)
pub mod config;

/// System observation: session environment, portal backends, portals.conf,
/// systemd user units, PipeWire
pub mod facts;

/// Fix engine: previews, transactional apply with backups, undo
pub mod fixes;

/// Live ScreenCast portal probe
///
/// Drives a real CreateSession → SelectSources → Start negotiation over
/// the session bus, exactly as a screen-sharing application would.
pub mod probe;

/// Sanitized diagnostic report assembly
pub mod report;

/// Diagnostic rules evaluated over fact snapshots
pub mod rules;
