//! Per-mind token accounting with a three-state gate and a bounded queue of
//! deferred messages.
//!
//! Budgets roll over on a period boundary: the 60 second tick resets usage,
//! clears the warning latch, and hands any queued messages back to the
//! caller for re-delivery through the message pipeline. State is written
//! through to `<home>/state/<mind>/token-budget.json` on every mutation so a
//! daemon restart never forgets spent tokens.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use volute_core::home::VoluteHome;
use volute_core::types::ContentBlock;

/// Deferred messages kept per mind; the oldest is dropped on overflow.
const QUEUE_CAPACITY: usize = 100;
/// Fraction of the limit at which the one-shot warning fires.
const WARNING_RATIO: f64 = 0.8;

#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("token limit must be positive")]
    InvalidLimit,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BudgetError>;

/// Outcome of the gate check for one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStatus {
    Ok,
    /// Forward the message, but also inject a conserve prompt and then
    /// acknowledge the warning.
    Warning,
    /// Do not forward; enqueue instead.
    Exceeded,
}

/// A message deferred while a mind's budget is exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub content: Vec<ContentBlock>,
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BudgetState {
    token_limit: u64,
    period_minutes: u64,
    tokens_used: u64,
    period_start: DateTime<Utc>,
    warning_injected: bool,
    #[serde(default)]
    queue: VecDeque<QueuedMessage>,
}

/// All mind budgets behind one mutex, with write-through persistence.
pub struct TokenBudget {
    home: VoluteHome,
    minds: Mutex<HashMap<String, BudgetState>>,
}

impl TokenBudget {
    pub fn new(home: VoluteHome) -> Self {
        Self {
            home,
            minds: Mutex::new(HashMap::new()),
        }
    }

    /// Load every persisted budget from `<home>/state/*/token-budget.json`.
    pub fn load(home: VoluteHome) -> Self {
        let mut minds = HashMap::new();
        let state_root = home.root().join("state");
        if let Ok(entries) = std::fs::read_dir(&state_root) {
            for entry in entries.flatten() {
                let Ok(name) = entry.file_name().into_string() else {
                    continue;
                };
                let path = home.budget_file(&name);
                match std::fs::read_to_string(&path) {
                    Ok(raw) => match serde_json::from_str::<BudgetState>(&raw) {
                        Ok(state) => {
                            minds.insert(name, state);
                        }
                        Err(e) => {
                            warn!(mind = %name, error = %e, "unparseable budget file, ignoring")
                        }
                    },
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(mind = %name, error = %e, "unreadable budget file, ignoring"),
                }
            }
        }
        Self {
            home,
            minds: Mutex::new(minds),
        }
    }

    /// Create or update a mind's budget. Updating preserves the tokens
    /// already spent, the deferral queue, and the warning latch.
    pub fn set_budget(&self, mind: &str, token_limit: u64, period_minutes: u64) -> Result<()> {
        if token_limit == 0 {
            return Err(BudgetError::InvalidLimit);
        }
        let mut minds = self.minds.lock().unwrap();
        match minds.get_mut(mind) {
            Some(state) => {
                state.token_limit = token_limit;
                state.period_minutes = period_minutes;
            }
            None => {
                minds.insert(
                    mind.to_string(),
                    BudgetState {
                        token_limit,
                        period_minutes,
                        tokens_used: 0,
                        period_start: Utc::now(),
                        warning_injected: false,
                        queue: VecDeque::new(),
                    },
                );
            }
        }
        self.persist(mind, &minds)
    }

    pub fn remove_budget(&self, mind: &str) -> Result<()> {
        let mut minds = self.minds.lock().unwrap();
        if minds.remove(mind).is_some() {
            let path = self.home.budget_file(mind);
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Accumulate a completed turn's usage. A mind without a budget is not
    /// tracked.
    pub fn record_usage(&self, mind: &str, input_tokens: u64, output_tokens: u64) {
        let mut minds = self.minds.lock().unwrap();
        let Some(state) = minds.get_mut(mind) else {
            return;
        };
        state.tokens_used += input_tokens + output_tokens;
        if let Err(e) = self.persist(mind, &minds) {
            warn!(mind, error = %e, "failed to persist budget usage");
        }
    }

    /// Gate an inbound message.
    pub fn check_budget(&self, mind: &str) -> BudgetStatus {
        let minds = self.minds.lock().unwrap();
        let Some(state) = minds.get(mind) else {
            return BudgetStatus::Ok;
        };
        let ratio = state.tokens_used as f64 / state.token_limit as f64;
        if ratio >= 1.0 {
            BudgetStatus::Exceeded
        } else if ratio >= WARNING_RATIO && !state.warning_injected {
            BudgetStatus::Warning
        } else {
            BudgetStatus::Ok
        }
    }

    /// Latch the warning so it is injected at most once per period.
    pub fn acknowledge_warning(&self, mind: &str) {
        let mut minds = self.minds.lock().unwrap();
        if let Some(state) = minds.get_mut(mind) {
            state.warning_injected = true;
            if let Err(e) = self.persist(mind, &minds) {
                warn!(mind, error = %e, "failed to persist warning latch");
            }
        }
    }

    /// Defer a message until the next rollover. Ring discipline: beyond
    /// capacity the oldest entry is dropped first.
    pub fn enqueue(&self, mind: &str, message: QueuedMessage) {
        let mut minds = self.minds.lock().unwrap();
        let Some(state) = minds.get_mut(mind) else {
            warn!(mind, "enqueue without a budget, dropping message");
            return;
        };
        if state.queue.len() == QUEUE_CAPACITY {
            state.queue.pop_front();
        }
        state.queue.push_back(message);
        if let Err(e) = self.persist(mind, &minds) {
            warn!(mind, error = %e, "failed to persist deferral queue");
        }
    }

    /// Remove and return every queued message for the mind.
    pub fn drain(&self, mind: &str) -> Vec<QueuedMessage> {
        let mut minds = self.minds.lock().unwrap();
        let Some(state) = minds.get_mut(mind) else {
            return Vec::new();
        };
        let drained: Vec<QueuedMessage> = state.queue.drain(..).collect();
        if !drained.is_empty() {
            if let Err(e) = self.persist(mind, &minds) {
                warn!(mind, error = %e, "failed to persist drained queue");
            }
        }
        drained
    }

    pub fn queue_len(&self, mind: &str) -> usize {
        self.minds
            .lock()
            .unwrap()
            .get(mind)
            .map(|s| s.queue.len())
            .unwrap_or(0)
    }

    pub fn tokens_used(&self, mind: &str) -> Option<u64> {
        self.minds.lock().unwrap().get(mind).map(|s| s.tokens_used)
    }

    /// Roll periods over. For every mind whose period has elapsed: reset
    /// usage and the warning latch, advance `period_start` by whole periods,
    /// and hand back the deferred messages for re-delivery.
    pub fn tick(&self) -> Vec<(String, Vec<QueuedMessage>)> {
        let now = Utc::now();
        let mut released = Vec::new();
        let mut minds = self.minds.lock().unwrap();
        let names: Vec<String> = minds.keys().cloned().collect();
        for name in names {
            let state = minds.get_mut(&name).unwrap();
            if state.period_minutes == 0 {
                continue;
            }
            let period = Duration::minutes(state.period_minutes as i64);
            if now - state.period_start < period {
                continue;
            }
            while now - state.period_start >= period {
                state.period_start += period;
            }
            state.tokens_used = 0;
            state.warning_injected = false;
            let drained: Vec<QueuedMessage> = state.queue.drain(..).collect();
            info!(mind = %name, released = drained.len(), "token budget period rolled over");
            if let Err(e) = self.persist(&name, &minds) {
                warn!(mind = %name, error = %e, "failed to persist budget rollover");
            }
            if !drained.is_empty() {
                released.push((name, drained));
            }
        }
        released
    }

    /// Write every tracked budget to disk. Called on daemon shutdown; all
    /// mutating operations already write through.
    pub fn flush(&self) -> Result<()> {
        let minds = self.minds.lock().unwrap();
        for name in minds.keys() {
            self.persist(name, &minds)?;
        }
        Ok(())
    }

    fn persist(&self, mind: &str, minds: &HashMap<String, BudgetState>) -> Result<()> {
        let Some(state) = minds.get(mind) else {
            return Ok(());
        };
        let path = self.home.budget_file(mind);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(state)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
