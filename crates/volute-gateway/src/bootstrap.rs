//! Daemon assembly: build the shared state and the background tick loops.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};
use volute_budget::TokenBudget;
use volute_core::config::DaemonConfig;
use volute_core::home::VoluteHome;
use volute_events::{ActivityTracker, EventBus, TypingMap};
use volute_registry::Registry;
use volute_scheduler::{MindScheduleSource, Scheduler};
use volute_store::StateStore;
use volute_supervisor::MindSupervisor;

use crate::app::AppState;
use crate::pipeline;

const SCHEDULER_TICK: Duration = Duration::from_secs(60);
const BUDGET_TICK: Duration = Duration::from_secs(60);
const TYPING_SWEEP: Duration = Duration::from_secs(5);

/// Construct every component against the given home directory.
pub fn build_state(home: VoluteHome, mut config: DaemonConfig) -> anyhow::Result<Arc<AppState>> {
    std::fs::create_dir_all(home.root())?;
    let token = config.ensure_token(&home.daemon_config())?;

    let store = Arc::new(StateStore::open(&home.database())?);
    let registry = Arc::new(Registry::open(
        home.registry_file(),
        home.variants_file(),
        config.base_port,
    ));
    let bus = Arc::new(EventBus::new());
    let activity = Arc::new(ActivityTracker::new(store.clone(), bus.clone()));
    let typing = Arc::new(TypingMap::new());
    let budget = Arc::new(TokenBudget::load(home.clone()));
    let scheduler = Arc::new(Scheduler::load(home.scheduler_state()));
    let supervisor = Arc::new(MindSupervisor::new(
        home.clone(),
        config.clone(),
        registry.clone(),
        activity.clone(),
    ));

    Ok(Arc::new(AppState {
        config,
        token,
        home,
        registry,
        store,
        bus,
        activity,
        typing,
        budget,
        scheduler,
        supervisor,
        http: reqwest::Client::new(),
    }))
}

/// Restart every mind the registry believes should be running. Failures are
/// logged; boot continues either way.
pub fn reconcile_running_minds(state: &Arc<AppState>) {
    for entry in state.registry.list() {
        if !entry.running {
            continue;
        }
        let state = state.clone();
        let name = entry.name.clone();
        tokio::spawn(async move {
            info!(mind = %name, "restarting mind from previous run");
            if let Err(e) = state.supervisor.start_mind(&name).await {
                warn!(mind = %name, error = %e, "failed to restart mind at boot");
            }
        });
    }
}

/// Start the scheduler, budget, and typing-sweep loops. All three stop when
/// `shutdown` flips to true.
pub fn spawn_background_loops(state: Arc<AppState>, shutdown: watch::Receiver<bool>) {
    {
        let state = state.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SCHEDULER_TICK);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => scheduler_tick(&state).await,
                    _ = shutdown.changed() => if *shutdown.borrow() { break },
                }
            }
        });
    }

    {
        let state = state.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(BUDGET_TICK);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => budget_tick(&state).await,
                    _ = shutdown.changed() => if *shutdown.borrow() { break },
                }
            }
        });
    }

    {
        let mut shutdown = shutdown;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TYPING_SWEEP);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        for channel in state.typing.sweep() {
                            publish_typing(&state, &channel);
                        }
                    }
                    _ = shutdown.changed() => if *shutdown.borrow() { break },
                }
            }
        });
    }
}

pub fn publish_typing(state: &Arc<AppState>, channel: &str) {
    state.bus.publish(
        "typing",
        serde_json::json!({ "channel": channel, "senders": state.typing.get(channel) }),
    );
}

/// One scheduler pass over every running, sprouted base mind.
async fn scheduler_tick(state: &Arc<AppState>) {
    let sources: Vec<MindScheduleSource> = state
        .registry
        .list()
        .into_iter()
        .filter(|entry| {
            entry.stage == volute_core::types::Stage::Sprouted
                && state.supervisor.is_running(&entry.name)
        })
        .map(|entry| MindScheduleSource {
            dir: state.home.mind_dir(&entry.name),
            mind: entry.name,
        })
        .collect();

    for fired in state.scheduler.tick(&sources).await {
        let content = vec![volute_core::types::ContentBlock::text(fired.text.clone())];
        let outcome = pipeline::deliver_internal(
            state,
            &fired.mind,
            &content,
            "system:scheduler",
            Some(&fired.schedule_id),
        )
        .await;
        if let Err(e) = outcome {
            warn!(mind = %fired.mind, schedule = %fired.schedule_id, error = %e.message, "scheduled delivery failed, queueing");
            let payload = serde_json::json!({ "content": content });
            if let Err(e) = state.store.queue_delivery(
                &fired.mind,
                None,
                Some("system:scheduler"),
                Some(&fired.schedule_id),
                &payload,
            ) {
                warn!(mind = %fired.mind, error = %e, "failed to queue scheduled delivery");
            }
        }
    }
}

/// Roll over elapsed budget periods and re-deliver what they queued.
async fn budget_tick(state: &Arc<AppState>) {
    for (mind, messages) in state.budget.tick() {
        for message in messages {
            let outcome = pipeline::deliver_internal(
                state,
                &mind,
                &message.content,
                &message.channel,
                message.sender.as_deref(),
            )
            .await;
            if let Err(e) = outcome {
                warn!(mind = %mind, error = %e.message, "deferred message delivery failed");
            }
        }
    }
}

/// Flush and close everything the daemon owns. Called once, after the HTTP
/// server has drained.
pub async fn shutdown(state: &Arc<AppState>) {
    info!("shutting down");
    state.supervisor.stop_all().await;
    state.activity.stop_all();
    if let Err(e) = state.budget.flush() {
        warn!(error = %e, "failed to flush token budgets");
    }
    let _ = std::fs::remove_file(state.home.daemon_pid());
}
