use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How long a typing signal stays live without a refresh.
const TYPING_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
struct TypingEntry {
    /// None means the entry never expires (connector-managed presence).
    expires_at: Option<Instant>,
}

/// Two-level map of "X is typing" signals: channel -> sender -> expiry.
///
/// Entries decay after ten seconds unless refreshed; a sweeper drops expired
/// entries and prunes empty channels. The caller publishes typing-updated
/// events for whatever channels a call reports as changed.
pub struct TypingMap {
    channels: Mutex<HashMap<String, HashMap<String, TypingEntry>>>,
    ttl: Duration,
}

impl TypingMap {
    pub fn new() -> Self {
        Self::with_ttl(TYPING_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Record (or refresh) a typing signal.
    pub fn set(&self, channel: &str, sender: &str, persistent: bool) {
        let expires_at = if persistent {
            None
        } else {
            Some(Instant::now() + self.ttl)
        };
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(channel.to_string())
            .or_default()
            .insert(sender.to_string(), TypingEntry { expires_at });
    }

    /// Drop one sender's signal from one channel.
    pub fn clear(&self, channel: &str, sender: &str) -> bool {
        let mut channels = self.channels.lock().unwrap();
        let Some(senders) = channels.get_mut(channel) else {
            return false;
        };
        let removed = senders.remove(sender).is_some();
        if senders.is_empty() {
            channels.remove(channel);
        }
        removed
    }

    /// The currently live senders for a channel, sorted for stable output.
    pub fn get(&self, channel: &str) -> Vec<String> {
        let now = Instant::now();
        let channels = self.channels.lock().unwrap();
        let mut live: Vec<String> = channels
            .get(channel)
            .map(|senders| {
                senders
                    .iter()
                    .filter(|(_, e)| e.expires_at.map(|t| t > now).unwrap_or(true))
                    .map(|(s, _)| s.clone())
                    .collect()
            })
            .unwrap_or_default();
        live.sort();
        live
    }

    /// Remove the sender from every channel. Returns the channels that
    /// changed so the caller can notify their subscribers.
    pub fn delete_sender(&self, sender: &str) -> Vec<String> {
        let mut channels = self.channels.lock().unwrap();
        let mut affected = Vec::new();
        channels.retain(|channel, senders| {
            if senders.remove(sender).is_some() {
                affected.push(channel.clone());
            }
            !senders.is_empty()
        });
        affected.sort();
        affected
    }

    /// Drop expired entries and prune empty channels. Returns the channels
    /// that changed. Runs every five seconds from the daemon's sweep loop.
    pub fn sweep(&self) -> Vec<String> {
        let now = Instant::now();
        let mut channels = self.channels.lock().unwrap();
        let mut affected = Vec::new();
        channels.retain(|channel, senders| {
            let before = senders.len();
            senders.retain(|_, e| e.expires_at.map(|t| t > now).unwrap_or(true));
            if senders.len() != before {
                affected.push(channel.clone());
            }
            !senders.is_empty()
        });
        affected.sort();
        affected
    }
}

impl Default for TypingMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get() {
        let map = TypingMap::new();
        map.set("volute:c1", "alice", false);
        map.set("volute:c1", "bob", false);
        assert_eq!(map.get("volute:c1"), vec!["alice", "bob"]);
        assert!(map.get("volute:c2").is_empty());
    }

    #[test]
    fn expired_entries_are_invisible_and_swept() {
        let map = TypingMap::with_ttl(Duration::from_millis(0));
        map.set("volute:c1", "alice", false);
        std::thread::sleep(Duration::from_millis(5));

        assert!(map.get("volute:c1").is_empty());
        assert_eq!(map.sweep(), vec!["volute:c1"]);
        // Channel was pruned; a second sweep reports nothing.
        assert!(map.sweep().is_empty());
    }

    #[test]
    fn persistent_entries_survive_sweeps() {
        let map = TypingMap::with_ttl(Duration::from_millis(0));
        map.set("volute:c1", "bridge", true);
        std::thread::sleep(Duration::from_millis(5));

        assert!(map.sweep().is_empty());
        assert_eq!(map.get("volute:c1"), vec!["bridge"]);
    }

    #[test]
    fn delete_sender_reports_affected_channels() {
        let map = TypingMap::new();
        map.set("volute:c1", "alice", false);
        map.set("volute:c2", "alice", false);
        map.set("volute:c2", "bob", false);

        let affected = map.delete_sender("alice");
        assert_eq!(affected, vec!["volute:c1", "volute:c2"]);
        assert!(map.get("volute:c1").is_empty());
        assert_eq!(map.get("volute:c2"), vec!["bob"]);
    }
}
