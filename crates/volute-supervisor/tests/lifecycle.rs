//! End-to-end supervisor tests against real child processes.
//!
//! Minds are simulated with `sh` scripts; a "healthy" mind prints the
//! readiness line and sleeps, a "crashing" one prints it and exits.

use std::sync::Arc;
use std::time::Duration;

use volute_core::config::DaemonConfig;
use volute_core::home::VoluteHome;
use volute_core::types::Stage;
use volute_events::{ActivityTracker, EventBus};
use volute_registry::Registry;
use volute_store::StateStore;
use volute_supervisor::{MindSupervisor, SupervisorError, Tuning};

struct Fixture {
    _dir: tempfile::TempDir,
    home: VoluteHome,
    registry: Arc<Registry>,
    store: Arc<StateStore>,
    supervisor: Arc<MindSupervisor>,
}

fn fixture(script: &str, port: u16) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let home = VoluteHome::new(dir.path());

    let registry = Arc::new(Registry::open(
        home.registry_file(),
        home.variants_file(),
        4100,
    ));
    registry.add("alice", port, Stage::Sprouted, None).unwrap();

    let store = Arc::new(
        StateStore::from_connection(rusqlite::Connection::open_in_memory().unwrap()).unwrap(),
    );
    let bus = Arc::new(EventBus::new());
    let activity = Arc::new(ActivityTracker::new(store.clone(), bus));

    let mut config = DaemonConfig::default();
    config.mind.command = "sh".to_string();
    config.mind.args = vec!["-c".to_string(), script.to_string()];

    let supervisor = Arc::new(MindSupervisor::with_tuning(
        home.clone(),
        config,
        registry.clone(),
        activity,
        Tuning {
            startup_timeout: Duration::from_secs(5),
            backoff_base_ms: 20,
            backoff_cap_ms: 100,
            stop_grace: Duration::from_secs(2),
        },
    ));

    Fixture {
        _dir: dir,
        home,
        registry,
        store,
        supervisor,
    }
}

fn activity_kinds(store: &StateStore) -> Vec<String> {
    let mut rows = store.recent_activity(100).unwrap();
    rows.reverse();
    rows.into_iter().map(|r| r.kind).collect()
}

#[tokio::test]
async fn start_then_stop_lifecycle() {
    let f = fixture(r#"echo "listening on :$VOLUTE_MIND_PORT"; exec sleep 30"#, 4431);

    f.supervisor.start_mind("alice").await.unwrap();
    assert!(f.supervisor.is_running("alice"));
    assert!(f.home.mind_pid("alice").exists());
    assert!(f.registry.find("alice").unwrap().running);

    f.supervisor.stop_mind("alice").await.unwrap();
    assert!(!f.supervisor.is_running("alice"));
    assert!(!f.home.mind_pid("alice").exists());
    assert!(!f.registry.find("alice").unwrap().running);

    assert_eq!(
        activity_kinds(&f.store),
        vec!["mind_started", "mind_stopped"]
    );
}

#[tokio::test]
async fn double_start_is_a_conflict() {
    let f = fixture(r#"echo "listening on :$VOLUTE_MIND_PORT"; exec sleep 30"#, 4432);

    f.supervisor.start_mind("alice").await.unwrap();
    assert!(matches!(
        f.supervisor.start_mind("alice").await,
        Err(SupervisorError::AlreadyRunning(_))
    ));
    f.supervisor.stop_mind("alice").await.unwrap();
}

#[tokio::test]
async fn unknown_mind_is_rejected() {
    let f = fixture("exit 0", 4433);
    assert!(matches!(
        f.supervisor.start_mind("nobody").await,
        Err(SupervisorError::UnknownMind(_))
    ));
    assert!(matches!(
        f.supervisor.stop_mind("alice").await,
        Err(SupervisorError::NotRunning(_))
    ));
}

#[tokio::test]
async fn exit_before_listening_fails_startup() {
    let f = fixture("exit 7", 4434);

    let err = f.supervisor.start_mind("alice").await.unwrap_err();
    match err {
        SupervisorError::StartupFailed { code, .. } => assert_eq!(code, Some(7)),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!f.supervisor.is_running("alice"));
    assert!(!f.home.mind_pid("alice").exists());
}

#[tokio::test]
async fn crash_backoff_gives_up_after_five_attempts() {
    // Reports listening, lingers briefly, then dies.
    let f = fixture(
        r#"echo "listening on :$VOLUTE_MIND_PORT"; sleep 0.2; exit 1"#,
        4435,
    );

    f.supervisor.start_mind("alice").await.unwrap();

    // 5 recovery attempts at 20..100ms backoff plus five 200ms lifetimes.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let gave_up = f
            .store
            .recent_activity(100)
            .unwrap()
            .iter()
            .any(|row| row.summary.as_deref() == Some("gave up after repeated crashes"));
        if gave_up {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "supervisor never gave up"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert!(!f.registry.find("alice").unwrap().running);
    assert_eq!(f.supervisor.crash_attempt_count("alice"), 5);

    // A manual start clears the counter again.
    f.supervisor.start_mind("alice").await.unwrap();
    assert_eq!(f.supervisor.crash_attempt_count("alice"), 0);
    f.supervisor.stop_all().await;
}

#[tokio::test]
async fn stop_all_is_shutdown_aware() {
    let f = fixture(r#"echo "listening on :$VOLUTE_MIND_PORT"; exec sleep 30"#, 4436);
    f.supervisor.start_mind("alice").await.unwrap();

    f.supervisor.stop_all().await;
    assert!(!f.supervisor.is_running("alice"));
    // After shutdown, stopping an already-gone mind is not an error.
    f.supervisor.stop_mind("alice").await.unwrap();
    // New starts are refused.
    assert!(matches!(
        f.supervisor.start_mind("alice").await,
        Err(SupervisorError::ShuttingDown)
    ));
}

#[tokio::test]
async fn pending_context_failure_does_not_block_start() {
    // The sh mind has no HTTP server, so context delivery must fail softly.
    let f = fixture(r#"echo "listening on :$VOLUTE_MIND_PORT"; exec sleep 30"#, 4437);
    f.supervisor
        .set_pending_context("alice", serde_json::json!("variant exp merged"));

    f.supervisor.start_mind("alice").await.unwrap();
    assert!(f.supervisor.is_running("alice"));
    f.supervisor.stop_mind("alice").await.unwrap();
}

#[tokio::test]
async fn mind_log_captures_child_output() {
    let f = fixture(
        r#"echo "listening on :$VOLUTE_MIND_PORT"; echo "hello from mind"; exec sleep 30"#,
        4438,
    );
    f.supervisor.start_mind("alice").await.unwrap();

    // Give the forwarder a moment to flush both lines.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let log = std::fs::read_to_string(f.home.log_file("alice")).unwrap();
    assert!(log.contains("listening on :4438"));
    assert!(log.contains("hello from mind"));

    f.supervisor.stop_mind("alice").await.unwrap();
}
