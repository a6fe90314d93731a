//! Fact collection
//!
//! Gathers everything the rule engine reasons about into one immutable
//! [`FactSnapshot`]: session environment, installed and running portal
//! backends, merged portals.conf preferences, PipeWire state, and systemd
//! unit states.
//!
//! # Architecture
//!
//! ```text
//! collect()
//!   ├── session probe      (env vars, compositor processes)
//!   ├── backend discovery  (.portal files)
//!   ├── portals.conf merge (user > /etc > /usr/share)
//!   ├── bus name scan      (org.freedesktop.portal.* owners)
//!   ├── unit states        (one systemctl show round trip)
//!   └── component probes   (pipewire, wireplumber)
//! ```
//!
//! Probes run concurrently under a per-probe time budget. A probe that
//! blows its budget is recorded as a [`CollectionTimeout`] and its snapshot
//! fields stay in their unknown state; collection itself never fails.

use std::time::Duration;

use tokio::time::timeout;
use tracing::{error, info, warn};

pub mod probes;
mod state;

pub use state::{
    backend_unit_name, CollectionTimeout, ComponentFact, ComponentStatus, CompositorFact,
    DesktopKind, FactSnapshot, PortalBackend, PortalsConfig, SessionType, UnitState,
    BACKEND_NAME_PREFIX, PORTAL_FRONTEND_NAME, PORTAL_FRONTEND_UNIT, SCREENCAST_INTERFACE,
};

use probes::SessionFacts;

/// Time budget for each individual probe
const SUB_PROBE_BUDGET: Duration = Duration::from_secs(2);

/// All systemd user units the collector watches
fn watched_units() -> Vec<&'static str> {
    let mut units = probes::PORTAL_UNITS.to_vec();
    units.extend_from_slice(probes::PIPEWIRE_UNITS);
    units
}

/// Collect a fresh snapshot of the screen-sharing stack.
///
/// Never fails: probes that error, panic, or time out leave their fields
/// in the unknown state and collection continues.
pub async fn collect() -> FactSnapshot {
    let collected_at = chrono::Utc::now();

    // Session facts first: portals.conf path resolution depends on the
    // desktop reported by the environment.
    let (session, t_session) = run_probe("session", probes::detect_session).await;
    let session = session.unwrap_or_else(unknown_session);
    let desktop_raw = session.desktop_raw.clone();

    let backends_fut = run_probe("backends", || {
        probes::discover_backends(&probes::portal_file_dirs())
    });
    let portals_fut = run_probe("portals-conf", move || {
        let paths = probes::config_paths(&desktop_raw);
        probes::read_portals_config(&paths)
    });
    let units_fut = run_probe("services", || probes::unit_states(&watched_units()));
    let pipewire_fut = run_probe("pipewire", probes::probe_pipewire);
    let wireplumber_fut = run_probe("wireplumber", probes::probe_wireplumber);
    let owned_fut = probe_owned_names();

    let (
        (backends, t_backends),
        (portals_conf, t_portals),
        (units, t_units),
        (pipewire, t_pipewire),
        (wireplumber, t_wireplumber),
        (owned, t_owned),
    ) = tokio::join!(
        backends_fut,
        portals_fut,
        units_fut,
        pipewire_fut,
        wireplumber_fut,
        owned_fut
    );

    let timeouts: Vec<CollectionTimeout> = [
        t_session,
        t_backends,
        t_portals,
        t_units,
        t_pipewire,
        t_wireplumber,
        t_owned,
    ]
    .into_iter()
    .flatten()
    .collect();
    if !timeouts.is_empty() {
        warn!(count = timeouts.len(), "some probes exceeded their budget");
    }

    let units = units.unwrap_or_else(|| {
        watched_units()
            .iter()
            .map(|u| ((*u).to_string(), UnitState::Unknown))
            .collect()
    });

    // Stitch live bus state into the discovered backends
    let owned_names = owned.unwrap_or_default();
    let mut backends = backends.unwrap_or_default();
    for backend in &mut backends {
        backend.owned_names = probes::backend_owned_names(&backend.dbus_name, &owned_names);
        let unit = backend_unit_name(&backend.name);
        backend.running = !backend.owned_names.is_empty()
            || units.get(&unit).copied() == Some(UnitState::Active);
    }
    let portal_frontend_owned = owned_names.iter().any(|n| n == PORTAL_FRONTEND_NAME);

    let pipewire = reconcile_component(
        pipewire.unwrap_or_else(ComponentFact::unknown),
        units.get("pipewire.service").copied() == Some(UnitState::Active)
            || units.get("pipewire.socket").copied() == Some(UnitState::Active),
    );
    let wireplumber = reconcile_component(
        wireplumber.unwrap_or_else(ComponentFact::unknown),
        units.get("wireplumber.service").copied() == Some(UnitState::Active),
    );

    let snapshot = FactSnapshot {
        collected_at,
        session_type: session.session_type,
        desktop: session.desktop,
        desktop_raw: session.desktop_raw,
        compositor: session.compositor,
        backends,
        portals_conf: portals_conf.unwrap_or_default(),
        portal_frontend_owned,
        pipewire,
        wireplumber,
        units,
        timeouts,
    };

    info!(
        session = %snapshot.session_type,
        desktop = %snapshot.desktop,
        backends = snapshot.backends.len(),
        frontend_owned = snapshot.portal_frontend_owned,
        "fact collection complete"
    );
    snapshot
}

fn unknown_session() -> SessionFacts {
    SessionFacts {
        session_type: SessionType::Unknown,
        desktop: DesktopKind::Unknown,
        desktop_raw: String::new(),
        compositor: CompositorFact::default(),
    }
}

/// Daemons may be socket-activated and idle; an active unit counts as running
fn reconcile_component(mut fact: ComponentFact, unit_active: bool) -> ComponentFact {
    if fact.status == ComponentStatus::Stopped && unit_active {
        fact.status = ComponentStatus::Running;
    }
    fact
}

/// Run a blocking probe on the blocking pool under the standard budget
async fn run_probe<T, F>(name: &'static str, probe: F) -> (Option<T>, Option<CollectionTimeout>)
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    run_probe_with(SUB_PROBE_BUDGET, name, probe).await
}

async fn run_probe_with<T, F>(
    budget: Duration,
    name: &'static str,
    probe: F,
) -> (Option<T>, Option<CollectionTimeout>)
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match timeout(budget, tokio::task::spawn_blocking(probe)).await {
        Ok(Ok(value)) => (Some(value), None),
        Ok(Err(e)) => {
            error!(probe = name, error = %e, "probe task panicked");
            (None, None)
        }
        Err(_) => {
            let record = CollectionTimeout {
                probe: name.to_string(),
                budget_ms: budget.as_millis() as u64,
            };
            warn!(probe = name, budget_ms = record.budget_ms, "probe exceeded time budget");
            (None, Some(record))
        }
    }
}

/// Scan the session bus for portal name owners (async, same budget)
async fn probe_owned_names() -> (Option<Vec<String>>, Option<CollectionTimeout>) {
    let scan = async {
        let connection = zbus::Connection::session().await.ok()?;
        probes::owned_portal_names(&connection).await.ok()
    };
    match timeout(SUB_PROBE_BUDGET, scan).await {
        Ok(names) => (names, None),
        Err(_) => {
            let record = CollectionTimeout {
                probe: "bus-names".to_string(),
                budget_ms: SUB_PROBE_BUDGET.as_millis() as u64,
            };
            warn!(probe = "bus-names", budget_ms = record.budget_ms, "probe exceeded time budget");
            (None, Some(record))
        }
    }
}
