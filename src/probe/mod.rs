//! Live ScreenCast portal probe
//!
//! Drives the XDG Desktop Portal ScreenCast interface end to end, exactly
//! like a screen-sharing application would:
//!
//! ```text
//! Idle → SessionCreating → SessionCreated → SourcesSelecting
//!      → SourcesSelected → Starting → Started → Completed
//! ```
//!
//! with `Failed`, `TimedOut`, and `Cancelled` reachable from every
//! non-terminal state. The probe proves the whole stack (frontend, backend,
//! compositor, PipeWire) actually grants a capturable stream; it never keeps
//! the capture open.
//!
//! The D-Bus transport sits behind [`ScreenCastPort`] so the state machine
//! is testable against scripted responses.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::watch,
    time::{timeout, Instant},
};
use tracing::{debug, info, warn};

mod transport;

pub use transport::PortalScreenCast;

/// Budget for the cleanup call after the probe is already terminal
const CLOSE_BUDGET: Duration = Duration::from_secs(2);

/// The three portal round trips the probe performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProbeStage {
    /// Opening the portal session
    CreateSession,
    /// Declaring what should be captured (monitors only)
    SelectSources,
    /// Requesting the PipeWire streams
    Start,
}

impl ProbeStage {
    /// Method name as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateSession => "CreateSession",
            Self::SelectSources => "SelectSources",
            Self::Start => "Start",
        }
    }
}

impl std::fmt::Display for ProbeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Probe state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeState {
    /// Nothing issued yet
    Idle,
    /// CreateSession in flight
    SessionCreating,
    /// Session handle obtained
    SessionCreated,
    /// SelectSources in flight
    SourcesSelecting,
    /// Source selection acknowledged
    SourcesSelected,
    /// Start in flight (permission dialog may be showing)
    Starting,
    /// Streams granted, node ids extracted
    Started,
    /// Negotiation succeeded and the session was closed again
    Completed,
    /// The portal answered with an error or a malformed result
    Failed,
    /// A step (or the whole run) got no answer in time
    TimedOut,
    /// Cancelled from outside or by the user
    Cancelled,
}

impl ProbeState {
    /// Whether the probe can make no further transitions from this state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    /// The stage in flight while in this state, if any
    fn stage(&self) -> Option<ProbeStage> {
        match self {
            Self::SessionCreating => Some(ProbeStage::CreateSession),
            Self::SessionCreated | Self::SourcesSelecting => Some(ProbeStage::SelectSources),
            Self::SourcesSelected | Self::Starting | Self::Started => Some(ProbeStage::Start),
            _ => None,
        }
    }

    /// Stable kebab-case name for logs and JSON output
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::SessionCreating => "session-creating",
            Self::SessionCreated => "session-created",
            Self::SourcesSelecting => "sources-selecting",
            Self::SourcesSelected => "sources-selected",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed-out",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ProbeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Human meaning of a portal response code
pub fn response_code_meaning(code: u32) -> &'static str {
    match code {
        0 => "success",
        1 => "cancelled by the user",
        2 => "backend error",
        _ => "unknown response code",
    }
}

/// Failure the transport reports for one round trip; the driver attaches
/// the stage.
#[derive(Debug, Error)]
pub enum PortFault {
    /// D-Bus plumbing failed (connection, proxy, call, signal stream)
    #[error(transparent)]
    Transport(#[from] anyhow::Error),

    /// The portal answered with a payload the probe cannot use
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Terminal probe errors
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The portal answered with a non-success response code
    #[error("portal answered {stage} with response code {code} ({})", response_code_meaning(*code))]
    ProtocolFailure { stage: ProbeStage, code: u32 },

    /// The portal answered, but the payload was unusable
    #[error("malformed portal response during {stage}: {detail}")]
    MalformedResponse { stage: ProbeStage, detail: String },

    /// No answer within the step or overall budget
    #[error("no portal response during {stage} within {timeout:?}")]
    ProtocolTimeout { stage: ProbeStage, timeout: Duration },

    /// Cancelled from outside the probe
    #[error("probe cancelled during {stage}")]
    Cancelled { stage: ProbeStage },

    /// D-Bus plumbing failed before any response arrived
    #[error("transport failure during {stage}: {source}")]
    Transport {
        stage: ProbeStage,
        #[source]
        source: anyhow::Error,
    },
}

/// One portal round trip as the probe sees it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortalResponse {
    /// 0 success, 1 user-cancelled, 2 error
    pub code: u32,
    /// Session handle (CreateSession only)
    pub session_handle: Option<String>,
    /// PipeWire stream node ids (Start only)
    pub streams: Vec<u32>,
}

/// Seam between the state machine and the D-Bus transport
#[async_trait]
pub trait ScreenCastPort: Send + Sync {
    /// Issue CreateSession and await its Response signal
    async fn create_session(&self) -> Result<PortalResponse, PortFault>;
    /// Issue SelectSources for the session and await its Response signal
    async fn select_sources(&self, session_handle: &str) -> Result<PortalResponse, PortFault>;
    /// Issue Start for the session and await its Response signal
    async fn start(&self, session_handle: &str) -> Result<PortalResponse, PortFault>;
    /// Best-effort cleanup; never fails the probe
    async fn close_session(&self, session_handle: &str);
}

/// Per-step and overall wall-clock budgets
#[derive(Debug, Clone, Copy)]
pub struct ProbeTimeouts {
    /// Budget for one Response signal wait
    pub per_step: Duration,
    /// Budget for the whole negotiation
    pub overall: Duration,
}

impl Default for ProbeTimeouts {
    fn default() -> Self {
        Self {
            per_step: Duration::from_secs(10),
            overall: Duration::from_secs(30),
        }
    }
}

/// Terminal result of one probe run
#[derive(Debug)]
pub struct ProbeOutcome {
    /// Terminal state the run ended in
    pub state: ProbeState,
    /// PipeWire node ids the compositor granted (success only)
    pub node_ids: Vec<u32>,
    /// What went wrong, for every state except Completed
    pub error: Option<ProbeError>,
    /// Wall-clock duration of the run including cleanup
    pub elapsed: Duration,
}

impl ProbeOutcome {
    /// Whether the negotiation reached Completed
    pub fn succeeded(&self) -> bool {
        self.state == ProbeState::Completed
    }

    /// One-line result for logs and reports
    pub fn summary(&self) -> String {
        match (&self.state, &self.error) {
            (ProbeState::Completed, _) => format!(
                "completed in {:.1}s, PipeWire node(s) {:?} granted",
                self.elapsed.as_secs_f64(),
                self.node_ids
            ),
            (state, Some(error)) => format!("{state}: {error}"),
            (state, None) => state.to_string(),
        }
    }
}

/// The probe driver. Create one per run; `run` consumes it.
pub struct ScreencastProbe<P> {
    port: P,
    timeouts: ProbeTimeouts,
    state: ProbeState,
    session_handle: Option<String>,
}

impl<P: ScreenCastPort> ScreencastProbe<P> {
    /// Probe with the default 10s/30s budgets
    pub fn new(port: P) -> Self {
        Self::with_timeouts(port, ProbeTimeouts::default())
    }

    /// Probe with explicit budgets
    pub fn with_timeouts(port: P, timeouts: ProbeTimeouts) -> Self {
        Self {
            port,
            timeouts,
            state: ProbeState::Idle,
            session_handle: None,
        }
    }

    /// Drive the negotiation to a terminal state.
    ///
    /// `cancel` may flip to `true` at any point; the probe then stops at the
    /// next suspension point. Whatever the terminal state, a session close
    /// is issued if and only if a session was created.
    pub async fn run(mut self, mut cancel: watch::Receiver<bool>) -> ProbeOutcome {
        let started = Instant::now();

        let result = timeout(self.timeouts.overall, self.negotiate(&mut cancel)).await;
        let (state, node_ids, error) = match result {
            Ok(Ok(node_ids)) => (ProbeState::Completed, node_ids, None),
            Ok(Err(error)) => (terminal_state(&error), vec![], Some(error)),
            Err(_) => {
                // Overall budget exhausted mid-step
                let stage = self.state.stage().unwrap_or(ProbeStage::CreateSession);
                (
                    ProbeState::TimedOut,
                    vec![],
                    Some(ProbeError::ProtocolTimeout {
                        stage,
                        timeout: self.timeouts.overall,
                    }),
                )
            }
        };
        self.state = state;

        // Sole cleanup site: close exactly once, iff a session exists
        if let Some(handle) = self.session_handle.take() {
            if timeout(CLOSE_BUDGET, self.port.close_session(&handle))
                .await
                .is_err()
            {
                warn!(session = %handle, "portal session close did not finish in time");
            }
        }

        let outcome = ProbeOutcome {
            state,
            node_ids,
            error,
            elapsed: started.elapsed(),
        };
        match outcome.state {
            ProbeState::Completed => info!(summary = %outcome.summary(), "screencast probe succeeded"),
            _ => warn!(summary = %outcome.summary(), "screencast probe did not complete"),
        }
        outcome
    }

    async fn negotiate(
        &mut self,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Vec<u32>, ProbeError> {
        let per_step = self.timeouts.per_step;

        self.state = ProbeState::SessionCreating;
        debug!("probe: CreateSession");
        let response = step(
            ProbeStage::CreateSession,
            per_step,
            cancel,
            self.port.create_session(),
        )
        .await?;
        let handle = response
            .session_handle
            .ok_or_else(|| ProbeError::MalformedResponse {
                stage: ProbeStage::CreateSession,
                detail: "success response carried no session handle".to_string(),
            })?;
        self.session_handle = Some(handle.clone());
        self.state = ProbeState::SessionCreated;

        self.state = ProbeState::SourcesSelecting;
        debug!(session = %handle, "probe: SelectSources");
        step(
            ProbeStage::SelectSources,
            per_step,
            cancel,
            self.port.select_sources(&handle),
        )
        .await?;
        self.state = ProbeState::SourcesSelected;

        self.state = ProbeState::Starting;
        debug!(session = %handle, "probe: Start");
        let response = step(ProbeStage::Start, per_step, cancel, self.port.start(&handle)).await?;
        self.state = ProbeState::Started;

        if response.streams.is_empty() {
            return Err(ProbeError::MalformedResponse {
                stage: ProbeStage::Start,
                detail: "success response carried no stream node ids".to_string(),
            });
        }
        Ok(response.streams)
    }
}

/// Await one portal round trip under the step budget, honoring cancellation
async fn step<F>(
    stage: ProbeStage,
    per_step: Duration,
    cancel: &mut watch::Receiver<bool>,
    call: F,
) -> Result<PortalResponse, ProbeError>
where
    F: std::future::Future<Output = Result<PortalResponse, PortFault>>,
{
    if *cancel.borrow() {
        return Err(ProbeError::Cancelled { stage });
    }

    tokio::pin!(call);
    let deadline = tokio::time::sleep(per_step);
    tokio::pin!(deadline);
    let mut cancel_open = true;

    loop {
        tokio::select! {
            () = &mut deadline => {
                return Err(ProbeError::ProtocolTimeout { stage, timeout: per_step });
            }
            changed = cancel.changed(), if cancel_open => {
                match changed {
                    Ok(()) if *cancel.borrow_and_update() => {
                        return Err(ProbeError::Cancelled { stage });
                    }
                    Ok(()) => {}
                    // Sender gone: external cancellation can no longer happen
                    Err(_) => cancel_open = false,
                }
            }
            result = &mut call => {
                return match result {
                    Ok(response) if response.code == 0 => Ok(response),
                    Ok(response) => Err(ProbeError::ProtocolFailure {
                        stage,
                        code: response.code,
                    }),
                    Err(PortFault::Malformed(detail)) => {
                        Err(ProbeError::MalformedResponse { stage, detail })
                    }
                    Err(PortFault::Transport(source)) => {
                        Err(ProbeError::Transport { stage, source })
                    }
                };
            }
        }
    }
}

fn terminal_state(error: &ProbeError) -> ProbeState {
    match error {
        ProbeError::Cancelled { .. } => ProbeState::Cancelled,
        ProbeError::ProtocolTimeout { .. } => ProbeState::TimedOut,
        ProbeError::ProtocolFailure { .. }
        | ProbeError::MalformedResponse { .. }
        | ProbeError::Transport { .. } => ProbeState::Failed,
    }
}

/// Run one probe against the real portal on the session bus
pub async fn run_live(
    timeouts: ProbeTimeouts,
    cancel: watch::Receiver<bool>,
) -> anyhow::Result<ProbeOutcome> {
    use anyhow::Context;

    let connection = zbus::Connection::session()
        .await
        .context("Failed to connect to the session bus")?;
    let port = PortalScreenCast::new(&connection).await?;
    Ok(ScreencastProbe::with_timeouts(port, timeouts).run(cancel).await)
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use super::*;

    enum Scripted {
        Reply(Result<PortalResponse, PortFault>),
        /// Never answer; the step budget has to fire
        Hang,
    }

    struct ScriptedPort {
        script: Mutex<VecDeque<Scripted>>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedPort {
        fn new(script: Vec<Scripted>) -> (Self, Arc<Mutex<Vec<String>>>) {
            let calls = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    script: Mutex::new(script.into()),
                    calls: calls.clone(),
                },
                calls,
            )
        }

        async fn next(&self, call: &str) -> Result<PortalResponse, PortFault> {
            self.calls.lock().unwrap().push(call.to_string());
            let scripted = self.script.lock().unwrap().pop_front();
            match scripted {
                Some(Scripted::Reply(reply)) => reply,
                Some(Scripted::Hang) | None => {
                    std::future::pending::<Result<PortalResponse, PortFault>>().await
                }
            }
        }
    }

    #[async_trait]
    impl ScreenCastPort for ScriptedPort {
        async fn create_session(&self) -> Result<PortalResponse, PortFault> {
            self.next("CreateSession").await
        }

        async fn select_sources(&self, _session: &str) -> Result<PortalResponse, PortFault> {
            self.next("SelectSources").await
        }

        async fn start(&self, _session: &str) -> Result<PortalResponse, PortFault> {
            self.next("Start").await
        }

        async fn close_session(&self, _session: &str) {
            self.calls.lock().unwrap().push("Close".to_string());
        }
    }

    fn ok_create() -> Scripted {
        Scripted::Reply(Ok(PortalResponse {
            code: 0,
            session_handle: Some("/org/freedesktop/portal/desktop/session/1_0/doctor1".into()),
            streams: vec![],
        }))
    }

    fn ok_empty() -> Scripted {
        Scripted::Reply(Ok(PortalResponse {
            code: 0,
            session_handle: None,
            streams: vec![],
        }))
    }

    fn ok_streams(nodes: Vec<u32>) -> Scripted {
        Scripted::Reply(Ok(PortalResponse {
            code: 0,
            session_handle: None,
            streams: nodes,
        }))
    }

    fn failure(code: u32) -> Scripted {
        Scripted::Reply(Ok(PortalResponse {
            code,
            session_handle: None,
            streams: vec![],
        }))
    }

    fn quick() -> ProbeTimeouts {
        ProbeTimeouts {
            per_step: Duration::from_millis(100),
            overall: Duration::from_secs(5),
        }
    }

    fn no_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // keep the sender alive for the whole test
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn test_successful_negotiation() {
        let (port, calls) =
            ScriptedPort::new(vec![ok_create(), ok_empty(), ok_streams(vec![42, 43])]);
        let outcome = ScreencastProbe::with_timeouts(port, quick())
            .run(no_cancel())
            .await;

        assert_eq!(outcome.state, ProbeState::Completed);
        assert!(outcome.succeeded());
        assert_eq!(outcome.node_ids, vec![42, 43]);
        assert!(outcome.error.is_none());
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["CreateSession", "SelectSources", "Start", "Close"]
        );
    }

    #[tokio::test]
    async fn test_create_session_failure_stops_immediately() {
        let (port, calls) = ScriptedPort::new(vec![failure(2)]);
        let outcome = ScreencastProbe::with_timeouts(port, quick())
            .run(no_cancel())
            .await;

        assert_eq!(outcome.state, ProbeState::Failed);
        match outcome.error {
            Some(ProbeError::ProtocolFailure { stage, code }) => {
                assert_eq!(stage, ProbeStage::CreateSession);
                assert_eq!(code, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // no SelectSources, and no Close since no session was created
        assert_eq!(*calls.lock().unwrap(), vec!["CreateSession"]);
    }

    #[tokio::test]
    async fn test_select_sources_failure_still_closes_session() {
        let (port, calls) = ScriptedPort::new(vec![ok_create(), failure(2)]);
        let outcome = ScreencastProbe::with_timeouts(port, quick())
            .run(no_cancel())
            .await;

        assert_eq!(outcome.state, ProbeState::Failed);
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["CreateSession", "SelectSources", "Close"]
        );
    }

    #[tokio::test]
    async fn test_missing_session_handle_is_malformed() {
        let (port, calls) = ScriptedPort::new(vec![ok_empty()]);
        let outcome = ScreencastProbe::with_timeouts(port, quick())
            .run(no_cancel())
            .await;

        assert_eq!(outcome.state, ProbeState::Failed);
        assert!(matches!(
            outcome.error,
            Some(ProbeError::MalformedResponse {
                stage: ProbeStage::CreateSession,
                ..
            })
        ));
        assert_eq!(*calls.lock().unwrap(), vec!["CreateSession"]);
    }

    #[tokio::test]
    async fn test_started_without_streams_is_malformed() {
        let (port, calls) = ScriptedPort::new(vec![ok_create(), ok_empty(), ok_streams(vec![])]);
        let outcome = ScreencastProbe::with_timeouts(port, quick())
            .run(no_cancel())
            .await;

        assert_eq!(outcome.state, ProbeState::Failed);
        assert!(matches!(
            outcome.error,
            Some(ProbeError::MalformedResponse {
                stage: ProbeStage::Start,
                ..
            })
        ));
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["CreateSession", "SelectSources", "Start", "Close"]
        );
    }

    #[tokio::test]
    async fn test_step_timeout_before_session() {
        let (port, calls) = ScriptedPort::new(vec![Scripted::Hang]);
        let outcome = ScreencastProbe::with_timeouts(port, quick())
            .run(no_cancel())
            .await;

        assert_eq!(outcome.state, ProbeState::TimedOut);
        assert!(matches!(
            outcome.error,
            Some(ProbeError::ProtocolTimeout {
                stage: ProbeStage::CreateSession,
                ..
            })
        ));
        assert_eq!(*calls.lock().unwrap(), vec!["CreateSession"]);
    }

    #[tokio::test]
    async fn test_step_timeout_after_session_closes_it() {
        let (port, calls) = ScriptedPort::new(vec![ok_create(), ok_empty(), Scripted::Hang]);
        let outcome = ScreencastProbe::with_timeouts(port, quick())
            .run(no_cancel())
            .await;

        assert_eq!(outcome.state, ProbeState::TimedOut);
        assert!(matches!(
            outcome.error,
            Some(ProbeError::ProtocolTimeout {
                stage: ProbeStage::Start,
                ..
            })
        ));
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["CreateSession", "SelectSources", "Start", "Close"]
        );
    }

    #[tokio::test]
    async fn test_overall_timeout_wins_over_step_budget() {
        let (port, _calls) = ScriptedPort::new(vec![Scripted::Hang]);
        let timeouts = ProbeTimeouts {
            per_step: Duration::from_secs(60),
            overall: Duration::from_millis(80),
        };
        let outcome = ScreencastProbe::with_timeouts(port, timeouts)
            .run(no_cancel())
            .await;

        assert_eq!(outcome.state, ProbeState::TimedOut);
        assert!(matches!(
            outcome.error,
            Some(ProbeError::ProtocolTimeout {
                stage: ProbeStage::CreateSession,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_external_cancellation_closes_session() {
        let (port, calls) = ScriptedPort::new(vec![ok_create(), Scripted::Hang]);
        let timeouts = ProbeTimeouts {
            per_step: Duration::from_secs(60),
            overall: Duration::from_secs(60),
        };
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let _ = tx.send(true);
        });

        let outcome = ScreencastProbe::with_timeouts(port, timeouts).run(rx).await;

        assert_eq!(outcome.state, ProbeState::Cancelled);
        assert!(matches!(
            outcome.error,
            Some(ProbeError::Cancelled {
                stage: ProbeStage::SelectSources
            })
        ));
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["CreateSession", "SelectSources", "Close"]
        );
    }

    #[tokio::test]
    async fn test_cancellation_before_start_never_calls_portal() {
        let (port, calls) = ScriptedPort::new(vec![ok_create()]);
        let (tx, rx) = watch::channel(true);
        drop(tx);

        let outcome = ScreencastProbe::with_timeouts(port, quick()).run(rx).await;

        assert_eq!(outcome.state, ProbeState::Cancelled);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_terminal_states() {
        assert!(ProbeState::Completed.is_terminal());
        assert!(ProbeState::Failed.is_terminal());
        assert!(ProbeState::TimedOut.is_terminal());
        assert!(ProbeState::Cancelled.is_terminal());
        assert!(!ProbeState::Idle.is_terminal());
        assert!(!ProbeState::Starting.is_terminal());
    }

    #[test]
    fn test_outcome_summary() {
        let outcome = ProbeOutcome {
            state: ProbeState::Completed,
            node_ids: vec![71],
            error: None,
            elapsed: Duration::from_millis(1500),
        };
        assert!(outcome.summary().contains("71"));

        let outcome = ProbeOutcome {
            state: ProbeState::Failed,
            node_ids: vec![],
            error: Some(ProbeError::ProtocolFailure {
                stage: ProbeStage::Start,
                code: 2,
            }),
            elapsed: Duration::from_millis(10),
        };
        assert!(outcome.summary().contains("response code 2"));
    }

    #[tokio::test]
    #[ignore = "Requires a live portal on the session bus"]
    async fn test_live_probe() {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        match run_live(ProbeTimeouts::default(), rx).await {
            Ok(outcome) => println!("live probe: {}", outcome.summary()),
            Err(e) => println!("no portal available: {e}"),
        }
    }
}
