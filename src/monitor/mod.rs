//! Per-session monitor loops and the shared state they update.
//!
//! Every tracked session gets one task that polls its screen, runs the
//! detector and decides whether a completion episode just ended. All
//! cross-task maps live behind a single mutex that is never held across a
//! tmux call or an emit.

mod scheduler;

pub use scheduler::{Scheduler, SyncReport};

use futures::FutureExt;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::detect::{is_waiting_for_input, SessionState, WorkingStateDetector};
use crate::events::{CompletionEvent, CompletionEventBus, CompletionKind};
use crate::tmux::{ScreenAccessor, TmuxError};
use crate::tracker::SessionStateStore;

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub tick_interval: Duration,
    /// Per tmux call, separate from the tick
    pub command_timeout: Duration,
    pub rediscovery_interval: Duration,
    /// How long shutdown waits for a loop before aborting it
    pub join_timeout: Duration,
    /// Working with an unchanged screen this long ends the episode
    pub stall_timeout: Option<Duration>,
    /// Only sessions whose name starts with this are tracked
    pub session_prefix: String,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(3),
            command_timeout: Duration::from_secs(5),
            rediscovery_interval: Duration::from_secs(30),
            join_timeout: Duration::from_secs(5),
            stall_timeout: Some(Duration::from_secs(300)),
            session_prefix: "claude".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorPhase {
    Discovered,
    Monitoring,
    Stopped,
}

/// Content-addressed change marker for a screen
pub fn content_hash(snapshot: &str) -> String {
    let mut hasher = Sha256::new();
    for line in snapshot.lines() {
        hasher.update(line.trim_end().as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Notification suppression state for one session. Not persisted.
#[derive(Debug, Clone)]
struct SessionTracking {
    hash: Option<String>,
    last_change: Instant,
    last_activity: Option<Instant>,
    was_working: bool,
    notified: bool,
    last_state: SessionState,
}

impl SessionTracking {
    fn new(now: Instant) -> Self {
        Self {
            hash: None,
            last_change: now,
            last_activity: None,
            was_working: false,
            notified: false,
            last_state: SessionState::Unknown,
        }
    }
}

/// What one tick saw
#[derive(Debug, Clone)]
pub struct Observation {
    pub hash: String,
    pub is_working: bool,
    pub waiting_for_input: bool,
}

impl Observation {
    pub fn state(&self) -> SessionState {
        SessionState::classify(self.is_working, self.waiting_for_input)
    }
}

struct MonitorTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RegistryInner {
    tracking: HashMap<String, SessionTracking>,
    tasks: HashMap<String, MonitorTask>,
    phases: HashMap<String, MonitorPhase>,
}

/// Shared maps for every monitor loop and the scheduler
#[derive(Default)]
pub struct MonitorRegistry {
    inner: Mutex<RegistryInner>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Folds one observation into the session's tracking state and returns
    /// the completion to emit, if this tick ends an episode.
    pub fn apply(
        &self,
        session: &str,
        obs: &Observation,
        now: Instant,
        stall_timeout: Option<Duration>,
    ) -> Option<CompletionKind> {
        let mut inner = self.lock();
        let t = inner
            .tracking
            .entry(session.to_string())
            .or_insert_with(|| SessionTracking::new(now));

        if t.hash.as_deref() != Some(obs.hash.as_str()) {
            t.hash = Some(obs.hash.clone());
            t.last_change = now;
        }
        let previous = t.last_state;
        let state = obs.state();
        t.last_state = state;

        if obs.is_working {
            let unchanged = now.duration_since(t.last_change);
            let stalled = stall_timeout.is_some_and(|limit| unchanged >= limit);
            if !stalled {
                // a fresh episode needs its own notification
                t.notified = false;
                t.was_working = true;
                t.last_activity = Some(now);
                return None;
            }
            if t.notified {
                return None;
            }
            t.notified = true;
            t.was_working = false;
            return Some(CompletionKind::Timeout {
                unchanged_secs: unchanged.as_secs(),
            });
        }

        let from = if t.was_working {
            SessionState::Working
        } else {
            previous
        };
        let ends_episode = (t.was_working || obs.waiting_for_input) && !t.notified;
        t.was_working = false;
        if !ends_episode {
            return None;
        }
        t.notified = true;
        Some(CompletionKind::StateTransition { from, to: state })
    }

    pub fn forget(&self, session: &str) {
        self.lock().tracking.remove(session);
    }

    pub fn last_activity(&self, session: &str) -> Option<Instant> {
        self.lock()
            .tracking
            .get(session)
            .and_then(|t| t.last_activity)
    }

    pub fn is_tracked(&self, session: &str) -> bool {
        self.lock().tracking.contains_key(session)
    }

    fn set_phase(&self, session: &str, phase: MonitorPhase) {
        self.lock().phases.insert(session.to_string(), phase);
    }

    fn set_phase_if_absent(&self, session: &str, phase: MonitorPhase) {
        self.lock()
            .phases
            .entry(session.to_string())
            .or_insert(phase);
    }

    pub fn phase(&self, session: &str) -> Option<MonitorPhase> {
        self.lock().phases.get(session).copied()
    }
}

/// Dependencies shared by the scheduler and every loop it spawns
pub struct MonitorContext {
    pub accessor: Arc<dyn ScreenAccessor>,
    pub detector: Arc<WorkingStateDetector>,
    pub bus: Arc<CompletionEventBus>,
    pub states: Option<Arc<SessionStateStore>>,
    pub registry: Arc<MonitorRegistry>,
    pub settings: MonitorSettings,
}

impl MonitorContext {
    pub fn new(
        accessor: Arc<dyn ScreenAccessor>,
        detector: Arc<WorkingStateDetector>,
        bus: Arc<CompletionEventBus>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            accessor,
            detector,
            bus,
            states: None,
            registry: Arc::new(MonitorRegistry::new()),
            settings,
        }
    }

    pub fn with_state_store(mut self, states: Arc<SessionStateStore>) -> Self {
        self.states = Some(states);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickOutcome {
    Continue,
    /// Session no longer exists
    Gone,
    /// Loop was cancelled
    Stop,
}

/// The loop for one session
pub struct SessionMonitor {
    ctx: Arc<MonitorContext>,
    session: String,
    cancel: CancellationToken,
}

impl SessionMonitor {
    pub fn new(ctx: Arc<MonitorContext>, session: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            session: session.into(),
            cancel,
        }
    }

    pub async fn run(self) {
        let session = self.session.as_str();
        info!(session, "monitoring started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match AssertUnwindSafe(self.tick()).catch_unwind().await {
                Ok(TickOutcome::Continue) => {}
                Ok(TickOutcome::Gone) => {
                    self.forget_state();
                    break;
                }
                Ok(TickOutcome::Stop) => break,
                Err(_) => error!(session, "monitor tick panicked, continuing"),
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.ctx.settings.tick_interval) => {}
            }
        }

        self.ctx.registry.forget(session);
        self.ctx.registry.set_phase(session, MonitorPhase::Stopped);
        info!(session, "monitoring stopped");
    }

    /// Persisted state of a vanished session is dropped; cancellation keeps it
    fn forget_state(&self) {
        if let Some(states) = &self.ctx.states {
            if let Err(e) = states.forget(&self.session) {
                warn!(session = %self.session, error = %e, "failed to drop session state");
            }
        }
    }

    pub(crate) async fn tick(&self) -> TickOutcome {
        let session = self.session.as_str();
        let timeout = self.ctx.settings.command_timeout;

        if self.cancel.is_cancelled() {
            return TickOutcome::Stop;
        }

        match tokio::time::timeout(timeout, self.ctx.accessor.exists(session)).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                info!(session, "session no longer exists");
                return TickOutcome::Gone;
            }
            Ok(Err(e)) => {
                debug!(session, error = %e, "existence check failed, skipping tick");
                return TickOutcome::Continue;
            }
            Err(_) => {
                debug!(session, "existence check timed out, skipping tick");
                return TickOutcome::Continue;
            }
        }

        let snapshot = match tokio::time::timeout(timeout, self.ctx.accessor.capture(session)).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(TmuxError::NotFound(_))) => {
                info!(session, "session vanished during capture");
                return TickOutcome::Gone;
            }
            Ok(Err(e)) if e.is_transient() => {
                debug!(session, error = %e, "capture failed, skipping tick");
                return TickOutcome::Continue;
            }
            Ok(Err(e)) => {
                warn!(session, error = %e, "capture failed, skipping tick");
                return TickOutcome::Continue;
            }
            Err(_) => {
                debug!(session, secs = timeout.as_secs(), "capture timed out, skipping tick");
                return TickOutcome::Continue;
            }
        };

        let detection = self.ctx.detector.detect(session, &snapshot);
        let obs = Observation {
            hash: content_hash(&snapshot),
            is_working: detection.is_working,
            waiting_for_input: !detection.is_working && is_waiting_for_input(&snapshot),
        };

        let completion = self.ctx.registry.apply(
            session,
            &obs,
            Instant::now(),
            self.ctx.settings.stall_timeout,
        );

        if let Some(states) = &self.ctx.states {
            if let Err(e) = states.record(session, obs.state()) {
                warn!(session, error = %e, "failed to persist session state");
            }
        }

        if let Some(kind) = completion {
            info!(
                session,
                kind = ?kind,
                confidence = detection.confidence,
                "completion detected"
            );
            let event = CompletionEvent::new(session, kind)
                .with_metadata("reasoning", detection.reasoning)
                .with_metadata("confidence", format!("{:.2}", detection.confidence));
            self.ctx.bus.emit(event).await;
        }

        TickOutcome::Continue
    }
}
