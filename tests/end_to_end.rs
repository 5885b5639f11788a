use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_relay::detect::{SessionState, WorkingStateDetector};
use agent_relay::events::{
    CompletionEventBus, CompletionKind, ListenerPolicy, NotificationListener,
    TimeRecordingListener,
};
use agent_relay::log_length::LogLengthStore;
use agent_relay::monitor::{MonitorContext, MonitorSettings, Scheduler};
use agent_relay::notify::{MessageFormat, NotificationDispatcher};
use agent_relay::tmux::ScriptedAccessor;
use agent_relay::tracker::{SessionStateStore, TrackerPolicy, WaitTimeTracker};

const WORKING: &str = "● Editing src/lib.rs\n\n✻ Cogitating… (8s · ↑ 1.2k tokens · esc to interrupt)\n";
const IDLE: &str = "● Done, all tests pass.\n\n>\n";

#[derive(Default)]
struct CountingDispatcher {
    sent: AtomicUsize,
}

#[async_trait]
impl NotificationDispatcher for CountingDispatcher {
    async fn send(&self, _chat_id: i64, _text: &str, _format: MessageFormat) -> bool {
        self.sent.fetch_add(1, Ordering::SeqCst);
        true
    }
}

struct Relay {
    screens: Arc<ScriptedAccessor>,
    tracker: Arc<WaitTimeTracker>,
    states: Arc<SessionStateStore>,
    dispatcher: Arc<CountingDispatcher>,
    bus: Arc<CompletionEventBus>,
    scheduler: Arc<Scheduler>,
    _dir: tempfile::TempDir,
}

fn relay(settings: MonitorSettings) -> Relay {
    let dir = tempfile::tempdir().unwrap();
    let screens = Arc::new(ScriptedAccessor::new());
    let tracker = Arc::new(WaitTimeTracker::open(
        dir.path().join("times.json"),
        TrackerPolicy::default(),
    ));
    let states = Arc::new(SessionStateStore::open(dir.path().join("session_states.json")));
    let dispatcher = Arc::new(CountingDispatcher::default());
    let policy = ListenerPolicy::default();

    let bus = Arc::new(CompletionEventBus::new());
    bus.subscribe(Arc::new(TimeRecordingListener::new(
        tracker.clone(),
        policy.dedup_window,
    )));
    bus.subscribe(Arc::new(
        NotificationListener::new(dispatcher.clone(), 1, policy.notify_cooldown).with_screen_tail(
            screens.clone(),
            Arc::new(LogLengthStore::new(dir.path().join("log_length.json"))),
            Duration::from_secs(1),
        ),
    ));

    let ctx = MonitorContext::new(
        screens.clone(),
        Arc::new(WorkingStateDetector::new()),
        bus.clone(),
        settings,
    )
    .with_state_store(states.clone());

    Relay {
        screens,
        tracker,
        states,
        dispatcher,
        bus,
        scheduler: Arc::new(Scheduler::new(ctx)),
        _dir: dir,
    }
}

#[tokio::test(start_paused = true)]
async fn working_to_idle_notifies_once() {
    let r = relay(MonitorSettings::default());
    r.screens.add_session("claude_demo-8", WORKING);
    r.screens.queue_screens("claude_demo-8", &[WORKING, IDLE]);

    r.scheduler.start().await;
    // ticks at 0s (working), 3s (idle), then idle again at 6s and 9s
    tokio::time::sleep(Duration::from_secs(10)).await;

    let events = r.bus.get_recent_events(Some("claude_demo-8"), 10);
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].kind,
        CompletionKind::StateTransition {
            from: SessionState::Working,
            to: SessionState::Idle,
        }
    );

    let records = r.tracker.records();
    assert_eq!(records.len(), 1);
    assert!(records.contains_key("claude_demo-8"));
    assert!(r.tracker.has_completion_record("claude_demo"));

    assert_eq!(r.dispatcher.sent.load(Ordering::SeqCst), 1);
    assert_eq!(
        r.states.get("claude_demo-8").map(|s| s.state),
        Some(SessionState::Idle)
    );

    r.scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn renamed_session_replaces_record() {
    let r = relay(MonitorSettings {
        rediscovery_interval: Duration::from_secs(40),
        ..MonitorSettings::default()
    });
    r.screens.add_session("claude_demo-8", WORKING);
    r.screens.queue_screens("claude_demo-8", &[WORKING, IDLE]);
    r.scheduler.start().await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    r.screens.remove_session("claude_demo-8");
    r.screens.add_session("claude_demo-9", WORKING);
    r.screens.queue_screens("claude_demo-9", &[WORKING, IDLE]);
    // rediscovery at 40s picks up the new name; its loop completes by 43s
    tokio::time::sleep(Duration::from_secs(40)).await;

    assert_eq!(r.scheduler.monitored_sessions(), vec!["claude_demo-9"]);
    let records = r.tracker.records();
    assert_eq!(records.len(), 1);
    assert!(records.contains_key("claude_demo-9"));
    assert_eq!(r.dispatcher.sent.load(Ordering::SeqCst), 2);

    r.scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn question_on_screen_notifies_without_prior_work() {
    let r = relay(MonitorSettings::default());
    r.screens.add_session(
        "claude_api",
        "Bash command\n  rm -rf target\n\nDo you want to proceed?\n❯ 1. Yes\n  2. No\n",
    );
    r.scheduler.start().await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    let events = r.bus.get_recent_events(None, 10);
    assert_eq!(events.len(), 1);
    assert!(events[0].kind.needs_input());
    assert_eq!(r.dispatcher.sent.load(Ordering::SeqCst), 1);

    r.scheduler.shutdown().await;
}
