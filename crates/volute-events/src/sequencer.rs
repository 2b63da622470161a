use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

/// Ring capacity for SSE replay.
const RING_CAPACITY: usize = 1000;
/// Events older than this are not replayed to reconnecting clients.
const REPLAY_WINDOW: Duration = Duration::from_secs(5 * 60);
const BROADCAST_CAPACITY: usize = 256;

/// One sequenced event: an SSE event name plus its JSON payload.
#[derive(Debug, Clone)]
pub struct SequencedEvent {
    /// Monotonically increasing, process-wide.
    pub id: u64,
    /// SSE event type: `activity`, `message`, or `typing`.
    pub event: String,
    pub data: serde_json::Value,
    at: Instant,
}

struct Ring {
    next_id: u64,
    buffer: VecDeque<SequencedEvent>,
}

/// Process-wide event sequencer.
///
/// Assigns IDs under a mutex so subscriber delivery order equals ID order,
/// keeps the last [`RING_CAPACITY`] events for replay after an SSE
/// reconnect, and fans live events out over a broadcast channel.
pub struct EventBus {
    ring: Mutex<Ring>,
    tx: broadcast::Sender<SequencedEvent>,
    window: Duration,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_window(REPLAY_WINDOW)
    }

    /// Custom replay window, for tests that age events artificially.
    pub fn with_window(window: Duration) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            ring: Mutex::new(Ring {
                next_id: 1,
                buffer: VecDeque::with_capacity(RING_CAPACITY),
            }),
            tx,
            window,
        }
    }

    /// Assign the next ID, buffer the event, and push it to live
    /// subscribers. Dropped silently when nobody is listening.
    pub fn publish(&self, event: &str, data: serde_json::Value) -> SequencedEvent {
        let sequenced = {
            let mut ring = self.ring.lock().unwrap();
            let sequenced = SequencedEvent {
                id: ring.next_id,
                event: event.to_string(),
                data,
                at: Instant::now(),
            };
            ring.next_id += 1;
            if ring.buffer.len() == RING_CAPACITY {
                ring.buffer.pop_front();
            }
            ring.buffer.push_back(sequenced.clone());
            // Send while holding the lock so broadcast order matches IDs.
            let _ = self.tx.send(sequenced.clone());
            sequenced
        };
        sequenced
    }

    /// Buffered events strictly after `last_id`, oldest first, excluding
    /// anything past the replay window.
    pub fn events_since(&self, last_id: u64) -> Vec<SequencedEvent> {
        let ring = self.ring.lock().unwrap();
        ring.buffer
            .iter()
            .filter(|e| e.id > last_id && e.at.elapsed() <= self.window)
            .cloned()
            .collect()
    }

    /// Live subscription; pair with [`events_since`](Self::events_since) for
    /// gapless replay.
    pub fn subscribe(&self) -> broadcast::Receiver<SequencedEvent> {
        self.tx.subscribe()
    }

    pub fn last_id(&self) -> u64 {
        self.ring.lock().unwrap().next_id - 1
    }

    /// Test support: drop all buffered events and restart IDs at 1.
    pub fn reset(&self) {
        let mut ring = self.ring.lock().unwrap();
        ring.next_id = 1;
        ring.buffer.clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
