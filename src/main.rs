use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use agent_relay::bot::{run_bot, ChatController};
use agent_relay::config::{Config, ConfigError};
use agent_relay::detect::WorkingStateDetector;
use agent_relay::events::{CompletionEventBus, NotificationListener, TimeRecordingListener};
use agent_relay::log_length::LogLengthStore;
use agent_relay::monitor::{MonitorContext, Scheduler};
use agent_relay::notify::TelegramClient;
use agent_relay::tmux::{ScreenAccessor, TmuxClient};
use agent_relay::tracker::{SessionStateStore, WaitTimeTracker};

/// getUpdates long-poll window
const BOT_POLL_TIMEOUT: Duration = Duration::from_secs(30);

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<()> {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(ConfigError::Missing(keys)) => {
            eprintln!("Error: missing required configuration:");
            for key in keys {
                eprintln!("    {key}");
            }
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    init_logging(&config.log_level);
    run(config).await
}

/// RUST_LOG wins over RELAY_LOG_LEVEL when both are set
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

async fn run(config: Config) -> Result<()> {
    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("creating state directory {}", config.state_dir.display()))?;

    let settings = config.monitor_settings();
    let tmux: Arc<dyn ScreenAccessor> =
        Arc::new(TmuxClient::new().with_timeout(settings.command_timeout));

    let tracker = Arc::new(
        WaitTimeTracker::open(config.times_path(), config.tracker.clone())
            .with_session_source(tmux.clone()),
    );
    let removed = tracker.cleanup_old_sessions(config.stale_hours);
    if removed > 0 {
        info!(removed, "dropped stale completion records");
    }

    let states = Arc::new(SessionStateStore::open(config.session_states_path()));
    let log_length = Arc::new(LogLengthStore::new(config.log_length_path()));
    let telegram = Arc::new(
        TelegramClient::new(config.api_base.as_str(), config.bot_token.as_str())
            .context("building chat client")?,
    );

    let bus = Arc::new(CompletionEventBus::new());
    bus.subscribe(Arc::new(TimeRecordingListener::new(
        tracker.clone(),
        config.listeners.dedup_window,
    )));
    bus.subscribe(Arc::new(
        NotificationListener::new(
            telegram.clone(),
            config.chat_id,
            config.listeners.notify_cooldown,
        )
        .with_screen_tail(tmux.clone(), log_length.clone(), settings.command_timeout),
    ));

    let cancel = CancellationToken::new();
    let ctx = MonitorContext::new(
        tmux,
        Arc::new(WorkingStateDetector::new()),
        bus,
        settings,
    )
    .with_state_store(states);
    let scheduler = Arc::new(Scheduler::with_cancel(ctx, cancel.child_token()));

    let report = scheduler.start().await;
    info!(
        sessions = report.started.len(),
        prefix = %config.session_prefix,
        "agent relay running"
    );

    let controller = Arc::new(ChatController::new(
        scheduler.clone(),
        tracker.clone(),
        log_length,
        config.allowed_users.iter().copied(),
    ));
    let bot = tokio::spawn(run_bot(telegram, controller, BOT_POLL_TIMEOUT, cancel.clone()));
    let maintenance = tokio::spawn(maintain(tracker, config.stale_hours, cancel.clone()));

    wait_for_shutdown().await;
    info!("shutting down");

    cancel.cancel();
    scheduler.shutdown().await;
    for (name, task) in [("bot", bot), ("maintenance", maintenance)] {
        if let Err(e) = task.await {
            warn!(task = name, error = %e, "task ended abnormally");
        }
    }
    Ok(())
}

/// Hourly sweep of stale completion records
async fn maintain(tracker: Arc<WaitTimeTracker>, stale_hours: u64, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(MAINTENANCE_INTERVAL) => {
                let removed = tracker.cleanup_old_sessions(stale_hours);
                if removed > 0 {
                    info!(removed, "dropped stale completion records");
                }
            }
        }
    }
}

/// Waits for Ctrl-C, or SIGTERM on unix
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
