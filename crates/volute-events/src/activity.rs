use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;
use volute_core::types::ActivityKind;
use volute_store::StateStore;

use crate::sequencer::EventBus;

/// How long a mind stays `active` after its last `done` before the tracker
/// declares it idle.
const IDLE_AFTER: Duration = Duration::from_secs(120);

/// Signal kinds that never count as activity.
fn is_ignored(kind: &str) -> bool {
    matches!(kind, "log" | "usage")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MindState {
    Idle,
    Active,
}

struct MindActivity {
    state: MindState,
    /// Pending idle transition, armed by a `done` signal.
    idle_timer: Option<JoinHandle<()>>,
}

/// Per-mind active/idle state machine.
///
/// Transitions are persisted as activity rows and broadcast through the
/// sequencer. All transitions for one mind are serialized under the map
/// mutex, so consecutive `mind_active` publishes always have a `mind_idle`
/// between them.
pub struct ActivityTracker {
    minds: Mutex<HashMap<String, MindActivity>>,
    store: Arc<StateStore>,
    bus: Arc<EventBus>,
    idle_after: Duration,
}

impl ActivityTracker {
    pub fn new(store: Arc<StateStore>, bus: Arc<EventBus>) -> Self {
        Self::with_idle_after(store, bus, IDLE_AFTER)
    }

    pub fn with_idle_after(
        store: Arc<StateStore>,
        bus: Arc<EventBus>,
        idle_after: Duration,
    ) -> Self {
        Self {
            minds: Mutex::new(HashMap::new()),
            store,
            bus,
            idle_after,
        }
    }

    /// Feed one inbound signal from a mind's stream. `log` and `usage` are
    /// ignored; `done` arms the idle timer; anything else cancels a pending
    /// timer and, from idle, transitions to active.
    pub fn signal(self: &Arc<Self>, mind: &str, kind: &str) {
        if is_ignored(kind) {
            return;
        }

        let became_active = {
            let mut minds = self.minds.lock().unwrap();
            let entry = minds.entry(mind.to_string()).or_insert(MindActivity {
                state: MindState::Idle,
                idle_timer: None,
            });

            if let Some(timer) = entry.idle_timer.take() {
                timer.abort();
            }

            let became_active = entry.state == MindState::Idle;
            entry.state = MindState::Active;

            if kind == "done" {
                let tracker = Arc::clone(self);
                let mind = mind.to_string();
                let idle_after = self.idle_after;
                entry.idle_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(idle_after).await;
                    tracker.mark_idle(&mind);
                }));
            }

            became_active
        };

        if became_active {
            self.publish(ActivityKind::MindActive, mind, None, None);
        }
        if kind == "done" {
            self.publish(ActivityKind::MindDone, mind, None, None);
        }
    }

    /// Immediate transition to idle. A no-op when the mind is already idle.
    pub fn mark_idle(&self, mind: &str) {
        let was_active = {
            let mut minds = self.minds.lock().unwrap();
            match minds.get_mut(mind) {
                Some(entry) if entry.state == MindState::Active => {
                    if let Some(timer) = entry.idle_timer.take() {
                        timer.abort();
                    }
                    entry.state = MindState::Idle;
                    true
                }
                _ => false,
            }
        };
        if was_active {
            self.publish(ActivityKind::MindIdle, mind, None, None);
        }
    }

    /// Forget a retired mind entirely.
    pub fn retire(&self, mind: &str) {
        let mut minds = self.minds.lock().unwrap();
        if let Some(entry) = minds.remove(mind) {
            if let Some(timer) = entry.idle_timer {
                timer.abort();
            }
        }
    }

    /// Cancel every pending idle timer. Called on daemon shutdown.
    pub fn stop_all(&self) {
        let mut minds = self.minds.lock().unwrap();
        for entry in minds.values_mut() {
            if let Some(timer) = entry.idle_timer.take() {
                timer.abort();
            }
        }
    }

    pub fn is_active(&self, mind: &str) -> bool {
        self.minds
            .lock()
            .unwrap()
            .get(mind)
            .map(|e| e.state == MindState::Active)
            .unwrap_or(false)
    }

    /// Persist an activity row and broadcast it. Used for every tracker
    /// transition and by the supervisor for start/stop events. Storage
    /// failures are logged, never propagated into the message path.
    pub fn publish(
        &self,
        kind: ActivityKind,
        mind: &str,
        summary: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) {
        match self
            .store
            .record_activity(&kind.to_string(), mind, summary, metadata)
        {
            Ok(row) => {
                if let Ok(data) = serde_json::to_value(&row) {
                    self.bus.publish("activity", data);
                }
            }
            Err(e) => {
                warn!(mind, kind = %kind, error = %e, "failed to persist activity event");
            }
        }
    }
}
