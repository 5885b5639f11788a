use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{MonitorContext, MonitorPhase, MonitorTask, SessionMonitor};

/// Result of one discovery pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub started: Vec<String>,
    pub reaped: Vec<String>,
}

/// Keeps exactly one monitor loop per live tracked session
pub struct Scheduler {
    ctx: Arc<MonitorContext>,
    cancel: CancellationToken,
    housekeeping: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(ctx: MonitorContext) -> Self {
        Self::with_cancel(ctx, CancellationToken::new())
    }

    /// Loops are cancelled together with `cancel`
    pub fn with_cancel(ctx: MonitorContext, cancel: CancellationToken) -> Self {
        Self {
            ctx: Arc::new(ctx),
            cancel,
            housekeeping: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &Arc<MonitorContext> {
        &self.ctx
    }

    /// Initial discovery, then rediscovery every `rediscovery_interval`
    pub async fn start(self: &Arc<Self>) -> SyncReport {
        let report = self.discover_and_sync().await;

        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let interval = scheduler.ctx.settings.rediscovery_interval;
            loop {
                tokio::select! {
                    _ = scheduler.cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        scheduler.discover_and_sync().await;
                    }
                }
            }
            debug!("housekeeping stopped");
        });
        *self.housekeeping.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        report
    }

    /// Lists sessions, reaps dead loops and starts loops for new sessions
    pub async fn discover_and_sync(&self) -> SyncReport {
        let mut report = SyncReport::default();
        let settings = &self.ctx.settings;

        let sessions = match tokio::time::timeout(
            settings.command_timeout,
            self.ctx.accessor.list_sessions(),
        )
        .await
        {
            Ok(Ok(sessions)) => sessions,
            Ok(Err(e)) => {
                debug!(error = %e, "session discovery failed");
                return report;
            }
            Err(_) => {
                debug!("session discovery timed out");
                return report;
            }
        };

        let live: HashSet<String> = sessions
            .into_iter()
            .map(|s| s.name)
            .filter(|name| name.starts_with(&settings.session_prefix))
            .collect();

        // finished tasks, plus tasks whose session is missing from the listing
        let (finished, unlisted): (Vec<String>, Vec<String>) = {
            let inner = self.ctx.registry.lock();
            let finished = inner
                .tasks
                .iter()
                .filter(|(_, task)| task.handle.is_finished())
                .map(|(name, _)| name.clone())
                .collect();
            let unlisted = inner
                .tasks
                .iter()
                .filter(|(name, task)| !task.handle.is_finished() && !live.contains(*name))
                .map(|(name, _)| name.clone())
                .collect();
            (finished, unlisted)
        };

        let mut gone = Vec::new();
        for name in unlisted {
            match tokio::time::timeout(settings.command_timeout, self.ctx.accessor.exists(&name)).await
            {
                Ok(Ok(false)) => gone.push(name),
                Ok(Ok(true)) => {}
                Ok(Err(e)) => debug!(session = %name, error = %e, "existence check failed"),
                Err(_) => debug!(session = %name, "existence check timed out"),
            }
        }

        if let Some(states) = &self.ctx.states {
            for name in &gone {
                if let Err(e) = states.forget(name) {
                    warn!(session = %name, error = %e, "failed to drop session state");
                }
            }
        }

        let mut dead = finished;
        dead.extend(gone);
        if !dead.is_empty() {
            let mut inner = self.ctx.registry.lock();
            for name in dead {
                if let Some(task) = inner.tasks.remove(&name) {
                    task.cancel.cancel();
                }
                inner.tracking.remove(&name);
                inner.phases.remove(&name);
                info!(session = %name, "monitor reaped");
                report.reaped.push(name);
            }
        }

        let mut names: Vec<&String> = live.iter().collect();
        names.sort();
        for name in names {
            self.ctx.registry.set_phase_if_absent(name, MonitorPhase::Discovered);
            if self.ensure_monitoring(name) {
                report.started.push(name.clone());
            }
        }

        if !report.started.is_empty() || !report.reaped.is_empty() {
            info!(
                started = report.started.len(),
                reaped = report.reaped.len(),
                monitored = self.monitored_sessions().len(),
                "sessions synced"
            );
        }
        report
    }

    /// Starts a loop for `session` unless one is already running.
    /// Returns whether a loop was started.
    pub fn ensure_monitoring(&self, session: &str) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }

        let mut inner = self.ctx.registry.lock();
        if inner
            .tasks
            .get(session)
            .is_some_and(|task| !task.handle.is_finished())
        {
            return false;
        }

        let cancel = self.cancel.child_token();
        let monitor = SessionMonitor::new(Arc::clone(&self.ctx), session, cancel.clone());
        let handle = tokio::spawn(monitor.run());
        inner
            .tasks
            .insert(session.to_string(), MonitorTask { handle, cancel });
        inner
            .phases
            .insert(session.to_string(), MonitorPhase::Monitoring);
        true
    }

    /// Sessions with a running loop, sorted
    pub fn monitored_sessions(&self) -> Vec<String> {
        let inner = self.ctx.registry.lock();
        let mut names: Vec<String> = inner
            .tasks
            .iter()
            .filter(|(_, task)| !task.handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn status(&self) -> Vec<(String, MonitorPhase)> {
        let inner = self.ctx.registry.lock();
        let mut phases: Vec<(String, MonitorPhase)> = inner
            .phases
            .iter()
            .map(|(name, phase)| (name.clone(), *phase))
            .collect();
        phases.sort_by(|a, b| a.0.cmp(&b.0));
        phases
    }

    /// Cancels every loop and waits for each, aborting any that overrun the
    /// join timeout, before clearing shared state.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let join_timeout = self.ctx.settings.join_timeout;

        let housekeeping = self
            .housekeeping
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = housekeeping {
            let abort = handle.abort_handle();
            if tokio::time::timeout(join_timeout, handle).await.is_err() {
                abort.abort();
            }
        }

        let tasks: Vec<(String, MonitorTask)> = self.ctx.registry.lock().tasks.drain().collect();
        let count = tasks.len();
        for (name, task) in tasks {
            task.cancel.cancel();
            let abort = task.handle.abort_handle();
            match tokio::time::timeout(join_timeout, task.handle).await {
                Ok(Ok(())) => debug!(session = %name, "monitor joined"),
                Ok(Err(e)) => warn!(session = %name, error = %e, "monitor task failed"),
                Err(_) => {
                    warn!(session = %name, "monitor did not stop in time, aborting");
                    abort.abort();
                }
            }
        }

        let mut inner = self.ctx.registry.lock();
        inner.tracking.clear();
        inner.phases.clear();
        info!(monitors = count, "scheduler stopped");
    }
}
