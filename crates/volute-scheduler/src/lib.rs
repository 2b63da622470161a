//! Cron-driven triggers that inject messages into minds.
//!
//! Every sixty seconds the daemon hands the scheduler its list of running,
//! sprouted minds. For each enabled schedule in a mind's `volute.json` the
//! scheduler fires when the cron expression matches the current wall-clock
//! minute, at most once per minute per (mind, schedule) pair even across a
//! daemon restart: the last-fired minute is written to
//! `<home>/scheduler-state.json` before anything else happens.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Timelike, Utc};
use croner::Cron;
use thiserror::Error;
use tracing::{debug, info, warn};
use volute_core::config::{MindConfig, ScheduleConfig};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ScheduleError>;

/// One running mind the tick should consider: its name and the directory
/// holding its `volute.json`.
#[derive(Debug, Clone)]
pub struct MindScheduleSource {
    pub mind: String,
    pub dir: PathBuf,
}

/// A schedule that fired this tick. The caller delivers it through the
/// message pipeline on the `system:scheduler` channel with the schedule id
/// as sender.
#[derive(Debug, Clone, PartialEq)]
pub struct FiredMessage {
    pub mind: String,
    pub schedule_id: String,
    pub text: String,
}

/// Last-fired memo: mind -> schedule id -> epoch minute.
type FiredMemo = HashMap<String, HashMap<String, i64>>;

pub struct Scheduler {
    state_file: PathBuf,
    last_fired: Mutex<FiredMemo>,
}

impl Scheduler {
    /// Load the last-fired memo from disk; unreadable state starts empty.
    pub fn load(state_file: PathBuf) -> Self {
        let memo = match std::fs::read_to_string(&state_file) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(memo) => memo,
                Err(e) => {
                    warn!(path = %state_file.display(), error = %e, "unparseable scheduler state, starting empty");
                    FiredMemo::new()
                }
            },
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %state_file.display(), error = %e, "unreadable scheduler state, starting empty");
                }
                FiredMemo::new()
            }
        };
        Self {
            state_file,
            last_fired: Mutex::new(memo),
        }
    }

    /// Run one tick against the current wall clock.
    pub async fn tick(&self, minds: &[MindScheduleSource]) -> Vec<FiredMessage> {
        self.tick_at(Utc::now(), minds).await
    }

    /// Tick at an explicit instant. Separated from [`tick`](Self::tick) so
    /// tests can pin the minute.
    pub async fn tick_at(
        &self,
        now: DateTime<Utc>,
        minds: &[MindScheduleSource],
    ) -> Vec<FiredMessage> {
        let minute = epoch_minute(now);
        let mut fired = Vec::new();

        for source in minds {
            let config_path = source.dir.join("volute.json");
            let config = match MindConfig::load(&config_path) {
                Ok(config) => config,
                Err(e) => {
                    warn!(mind = %source.mind, error = %e, "unreadable mind config, skipping schedules");
                    continue;
                }
            };

            for schedule in &config.schedules {
                if !schedule.enabled {
                    continue;
                }
                if !cron_matches_minute(&schedule.cron, now) {
                    continue;
                }
                if !self.claim(&source.mind, &schedule.id, minute) {
                    debug!(mind = %source.mind, schedule = %schedule.id, "already fired this minute");
                    continue;
                }
                info!(mind = %source.mind, schedule = %schedule.id, "schedule fired");

                if let Some(text) = resolve_text(schedule, &source.dir).await {
                    fired.push(FiredMessage {
                        mind: source.mind.clone(),
                        schedule_id: schedule.id.clone(),
                        text,
                    });
                }
            }
        }
        fired
    }

    /// Record the fire and persist before anything else happens. Returns
    /// false when this (mind, schedule) already fired in this minute.
    fn claim(&self, mind: &str, schedule_id: &str, minute: i64) -> bool {
        let mut memo = self.last_fired.lock().unwrap();
        let entry = memo
            .entry(mind.to_string())
            .or_default()
            .entry(schedule_id.to_string())
            .or_insert(i64::MIN);
        if *entry == minute {
            return false;
        }
        *entry = minute;
        if let Err(e) = self.persist(&memo) {
            warn!(mind, schedule_id, error = %e, "failed to persist scheduler state");
        }
        true
    }

    /// Drop memo entries for a retired mind.
    pub fn forget(&self, mind: &str) {
        let mut memo = self.last_fired.lock().unwrap();
        if memo.remove(mind).is_some() {
            if let Err(e) = self.persist(&memo) {
                warn!(mind, error = %e, "failed to persist scheduler state");
            }
        }
    }

    fn persist(&self, memo: &FiredMemo) -> Result<()> {
        if let Some(parent) = self.state_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(memo)?;
        let tmp = self.state_file.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.state_file)?;
        Ok(())
    }
}

pub fn epoch_minute(t: DateTime<Utc>) -> i64 {
    t.timestamp().div_euclid(60)
}

/// True when the expression's previous fire time lands in the same
/// wall-clock minute as `now`, i.e. the cron pattern matches the current
/// minute. Invalid expressions are logged and never match.
fn cron_matches_minute(expr: &str, now: DateTime<Utc>) -> bool {
    let cron = match Cron::new(expr).parse() {
        Ok(cron) => cron,
        Err(e) => {
            warn!(cron = expr, error = %e, "invalid cron expression, skipping");
            return false;
        }
    };
    // Truncate to the whole minute; the pattern carries no seconds field.
    let minute = now
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    match cron.find_next_occurrence(&minute, true) {
        Ok(next) => next == minute,
        Err(_) => false,
    }
}

/// Produce the message text for a fired schedule: run the script if there is
/// one, otherwise use the literal message.
async fn resolve_text(schedule: &ScheduleConfig, dir: &std::path::Path) -> Option<String> {
    if let Some(script) = &schedule.script {
        return Some(run_script(script, dir).await);
    }
    if let Some(message) = &schedule.message {
        return Some(message.clone());
    }
    debug!(schedule = %schedule.id, "schedule has neither script nor message");
    None
}

/// Execute the schedule's script in the mind's home directory. Success uses
/// stdout; failure uses stderr behind a `[script error]` prefix so the mind
/// still hears about it.
async fn run_script(script: &str, dir: &std::path::Path) -> String {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(script)
        .current_dir(dir)
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).trim_end().to_string()
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
            format!("[script error] {}", stderr)
        }
        Err(e) => format!("[script error] failed to run script: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn write_config(dir: &std::path::Path, json: &str) {
        std::fs::write(dir.join("volute.json"), json).unwrap();
    }

    fn source(dir: &std::path::Path) -> MindScheduleSource {
        MindScheduleSource {
            mind: "bob".to_string(),
            dir: dir.to_path_buf(),
        }
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, minute, 17).unwrap()
    }

    #[tokio::test]
    async fn fires_once_per_matching_minute() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"{"schedules":[{"id":"daily","cron":"*/5 * * * *","message":"ping"}]}"#,
        );
        let scheduler = Scheduler::load(dir.path().join("scheduler-state.json"));
        let minds = [source(dir.path())];

        let fired = scheduler.tick_at(at(5), &minds).await;
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].text, "ping");
        assert_eq!(fired[0].schedule_id, "daily");

        // Same minute: no re-fire.
        assert!(scheduler.tick_at(at(5), &minds).await.is_empty());
        // Non-matching minute: nothing.
        assert!(scheduler.tick_at(at(7), &minds).await.is_empty());
        // Next boundary fires again.
        assert_eq!(scheduler.tick_at(at(10), &minds).await.len(), 1);
    }

    #[tokio::test]
    async fn no_refire_across_restart_in_same_minute() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"{"schedules":[{"id":"daily","cron":"*/5 * * * *","message":"ping"}]}"#,
        );
        let state = dir.path().join("scheduler-state.json");
        let minds = [source(dir.path())];

        let scheduler = Scheduler::load(state.clone());
        assert_eq!(scheduler.tick_at(at(5), &minds).await.len(), 1);
        drop(scheduler);

        // A fresh instance in the same minute must not fire again.
        let scheduler = Scheduler::load(state);
        assert!(scheduler.tick_at(at(5), &minds).await.is_empty());
        assert_eq!(scheduler.tick_at(at(10), &minds).await.len(), 1);
    }

    #[tokio::test]
    async fn disabled_and_invalid_schedules_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"{"schedules":[
                {"id":"off","cron":"* * * * *","enabled":false,"message":"no"},
                {"id":"bad","cron":"not a cron","message":"no"},
                {"id":"ok","cron":"* * * * *","message":"yes"}
            ]}"#,
        );
        let scheduler = Scheduler::load(dir.path().join("scheduler-state.json"));

        let fired = scheduler.tick_at(at(3), &[source(dir.path())]).await;
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].schedule_id, "ok");
    }

    #[tokio::test]
    async fn script_stdout_becomes_the_message() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"{"schedules":[{"id":"s","cron":"* * * * *","script":"printf 'from-script'"}]}"#,
        );
        let scheduler = Scheduler::load(dir.path().join("scheduler-state.json"));

        let fired = scheduler.tick_at(at(3), &[source(dir.path())]).await;
        assert_eq!(fired[0].text, "from-script");
    }

    #[tokio::test]
    async fn failing_script_reports_stderr_with_prefix() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"{"schedules":[{"id":"s","cron":"* * * * *","script":"echo boom >&2; exit 1"}]}"#,
        );
        let scheduler = Scheduler::load(dir.path().join("scheduler-state.json"));

        let fired = scheduler.tick_at(at(3), &[source(dir.path())]).await;
        assert_eq!(fired[0].text, "[script error] boom");
    }

    #[tokio::test]
    async fn missing_config_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Scheduler::load(dir.path().join("scheduler-state.json"));
        assert!(scheduler.tick_at(at(3), &[source(dir.path())]).await.is_empty());
    }

    #[test]
    fn epoch_minutes() {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 9, 5, 59).unwrap();
        assert_eq!(epoch_minute(t), t.timestamp() / 60);
        assert_eq!(epoch_minute(t), epoch_minute(at(5)));
        assert_ne!(epoch_minute(at(5)), epoch_minute(at(6)));
    }
}
