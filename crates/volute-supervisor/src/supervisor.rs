use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Notify};
use tracing::{error, info, warn};
use volute_core::config::DaemonConfig;
use volute_core::home::VoluteHome;
use volute_core::types::{ActivityKind, MindRef};
use volute_events::ActivityTracker;
use volute_registry::Registry;

use crate::env;
use crate::error::{Result, SupervisorError};
use crate::logrot::RotatingLog;
use crate::procinfo;

/// Crashes tolerated before the supervisor gives up on a mind.
const MAX_CRASH_ATTEMPTS: u32 = 5;
const BACKOFF_BASE_MS: u64 = 3_000;
const BACKOFF_CAP_MS: u64 = 60_000;
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
/// Grace period between SIGTERM and SIGKILL on stop.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Timing knobs, separated so tests can shrink every delay.
#[derive(Debug, Clone)]
pub struct Tuning {
    pub startup_timeout: Duration,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub stop_grace: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            startup_timeout: STARTUP_TIMEOUT,
            backoff_base_ms: BACKOFF_BASE_MS,
            backoff_cap_ms: BACKOFF_CAP_MS,
            stop_grace: STOP_GRACE,
        }
    }
}

/// Where a mind (or variant) lives and which port it binds.
#[derive(Debug, Clone)]
pub struct MindTarget {
    /// Canonical name: `base` or `base@variant`.
    pub name: String,
    pub mind_ref: MindRef,
    pub dir: PathBuf,
    pub port: u16,
}

struct RunningMind {
    pid: i32,
    exited: Arc<Notify>,
    exit_seen: Arc<AtomicBool>,
}

/// Child-process lifecycle manager.
///
/// Owns every mind process the daemon spawns: startup with readiness
/// detection, PID files, rotating log capture, crash recovery with
/// exponential backoff, and shutdown-aware stop paths. Only the supervisor
/// ever signals a mind's process group.
pub struct MindSupervisor {
    home: VoluteHome,
    config: DaemonConfig,
    registry: Arc<Registry>,
    activity: Arc<ActivityTracker>,
    http: reqwest::Client,
    children: Mutex<HashMap<String, RunningMind>>,
    /// Minds currently being stopped on purpose; their exits are not crashes.
    stopping: Mutex<HashSet<String>>,
    /// Scheduled crash restarts, so a stop can cancel the backoff timer.
    pending_restarts: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
    pending_context: Mutex<HashMap<String, serde_json::Value>>,
    crash_attempts: Mutex<HashMap<String, u32>>,
    shutting_down: AtomicBool,
    tuning: Tuning,
}

impl MindSupervisor {
    pub fn new(
        home: VoluteHome,
        config: DaemonConfig,
        registry: Arc<Registry>,
        activity: Arc<ActivityTracker>,
    ) -> Self {
        Self::with_tuning(home, config, registry, activity, Tuning::default())
    }

    pub fn with_tuning(
        home: VoluteHome,
        config: DaemonConfig,
        registry: Arc<Registry>,
        activity: Arc<ActivityTracker>,
        tuning: Tuning,
    ) -> Self {
        let crash_attempts = load_crash_attempts(&home);
        Self {
            home,
            config,
            registry,
            activity,
            http: reqwest::Client::new(),
            children: Mutex::new(HashMap::new()),
            stopping: Mutex::new(HashSet::new()),
            pending_restarts: Mutex::new(HashMap::new()),
            pending_context: Mutex::new(HashMap::new()),
            crash_attempts: Mutex::new(crash_attempts),
            shutting_down: AtomicBool::new(false),
            tuning,
        }
    }

    /// Resolve a canonical name to its working directory and port, from the
    /// registry for base minds or the variant table for `base@variant`.
    pub fn resolve_target(&self, name: &str) -> Result<MindTarget> {
        let mind_ref = MindRef::parse(name)
            .map_err(|_| SupervisorError::UnknownMind(name.to_string()))?;
        match &mind_ref.variant {
            Some(variant) => {
                let entry = self
                    .registry
                    .find_variant(&mind_ref.base, variant)
                    .ok_or_else(|| SupervisorError::UnknownMind(name.to_string()))?;
                Ok(MindTarget {
                    name: entry.canonical(),
                    mind_ref,
                    dir: PathBuf::from(entry.path),
                    port: entry.port,
                })
            }
            None => {
                let entry = self
                    .registry
                    .find(&mind_ref.base)
                    .ok_or_else(|| SupervisorError::UnknownMind(name.to_string()))?;
                Ok(MindTarget {
                    name: entry.name.clone(),
                    mind_ref,
                    dir: self.home.mind_dir(&entry.name),
                    port: entry.port,
                })
            }
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.children.lock().unwrap().contains_key(name)
    }

    pub fn running_minds(&self) -> Vec<String> {
        let mut names: Vec<String> = self.children.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Stash a context object to be posted to the mind right after its next
    /// successful start.
    pub fn set_pending_context(&self, name: &str, context: serde_json::Value) {
        self.pending_context
            .lock()
            .unwrap()
            .insert(name.to_string(), context);
    }

    /// Start a mind by canonical name. A successful manual start clears the
    /// crash counter; crash-recovery restarts go through
    /// [`start_for_recovery`](Self::start_for_recovery) and leave it alone.
    pub async fn start_mind(self: &Arc<Self>, name: &str) -> Result<()> {
        self.start_internal(name, true).await
    }

    async fn start_for_recovery(self: &Arc<Self>, name: &str) -> Result<()> {
        self.start_internal(name, false).await
    }

    async fn start_internal(self: &Arc<Self>, name: &str, clear_attempts: bool) -> Result<()> {
        if self.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }
        let target = self.resolve_target(name)?;
        if self.is_running(&target.name) {
            return Err(SupervisorError::AlreadyRunning(target.name));
        }

        // A previous daemon may have left a PID file behind.
        let pid_file = self.home.mind_pid(&target.name);
        procinfo::reconcile_stale_pid(&pid_file, &self.config.mind.command).await?;

        // Something already answering /health on the target port gets killed
        // only if the OS-level owner passes the command-line check.
        if self.port_is_serving(target.port).await {
            match procinfo::find_port_owner(target.port) {
                Some(pid) if procinfo::cmdline_matches(pid, &self.config.mind.command) => {
                    warn!(mind = %target.name, port = target.port, pid, "port held by an orphaned mind, killing it");
                    procinfo::terminate_group(pid, Duration::from_secs(2)).await;
                }
                other => {
                    error!(mind = %target.name, port = target.port, pid = ?other, "port held by an unrelated process, refusing to start");
                    return Err(SupervisorError::PortConflict {
                        port: target.port,
                        pid: other,
                    });
                }
            }
        }

        let state_dir = self.home.state_dir(&target.name);
        std::fs::create_dir_all(self.home.log_dir(&target.name))?;
        std::fs::create_dir_all(&target.dir)?;
        if self.config.os_user_isolation {
            chown_to_mind_user(&target.name, &state_dir);
        }

        let merged = env::merged_env(
            &self.home.shared_env_file(),
            &self.home.mind_env_file(&target.name),
        );

        let mut cmd = tokio::process::Command::new(&self.config.mind.command);
        cmd.args(&self.config.mind.args)
            .current_dir(&target.dir)
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_remove("CLAUDECODE");
        for (key, value) in merged {
            cmd.env(key, value);
        }
        cmd.env(env::VAR_MIND, &target.name)
            .env(env::VAR_MIND_DIR, &target.dir)
            .env(env::VAR_STATE_DIR, &state_dir)
            .env(env::VAR_MIND_PORT, target.port.to_string());

        let mut child = cmd.spawn().map_err(SupervisorError::Spawn)?;
        let pid = child.id().unwrap_or_default() as i32;
        info!(mind = %target.name, pid, port = target.port, "mind process spawned");

        // Pipe both streams into the rotating log; stdout also feeds the
        // readiness watcher.
        let log = Arc::new(Mutex::new(RotatingLog::open(
            self.home.log_file(&target.name),
        )?));
        let (ready_tx, mut ready_rx) = mpsc::channel::<()>(1);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_stream(stdout, log.clone(), Some(ready_tx)));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stream(stderr, log.clone(), None));
        }

        enum StartOutcome {
            Ready,
            Exited(Option<i32>),
            Timeout,
        }

        let outcome = tokio::select! {
            Some(()) = ready_rx.recv() => StartOutcome::Ready,
            status = child.wait() => {
                StartOutcome::Exited(status.ok().and_then(|s| s.code()))
            }
            () = tokio::time::sleep(self.tuning.startup_timeout) => StartOutcome::Timeout,
        };

        match outcome {
            StartOutcome::Ready => {}
            StartOutcome::Exited(code) => {
                warn!(mind = %target.name, code = ?code, "mind exited before reporting listening");
                return Err(SupervisorError::StartupFailed {
                    name: target.name,
                    code,
                });
            }
            StartOutcome::Timeout => {
                warn!(mind = %target.name, "mind startup timed out, killing process group");
                procinfo::terminate_group(pid, Duration::from_secs(2)).await;
                return Err(SupervisorError::StartupTimeout(target.name));
            }
        }

        procinfo::write_pid_file(&pid_file, pid as u32)?;
        if clear_attempts {
            self.clear_crash_attempts(&target.name);
        }

        let exited = Arc::new(Notify::new());
        let exit_seen = Arc::new(AtomicBool::new(false));
        self.children.lock().unwrap().insert(
            target.name.clone(),
            RunningMind {
                pid,
                exited: exited.clone(),
                exit_seen: exit_seen.clone(),
            },
        );

        if target.mind_ref.variant.is_none() {
            if let Err(e) = self.registry.set_running(&target.mind_ref.base, true) {
                warn!(mind = %target.name, error = %e, "failed to mark registry running");
            }
        }
        self.activity
            .publish(ActivityKind::MindStarted, &target.name, Some("mind started"), None);

        self.deliver_pending_context(&target).await;

        // Crash watcher: the only place that reaps the child.
        let supervisor = Arc::clone(self);
        let name = target.name.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            exit_seen.store(true, Ordering::Release);
            exited.notify_one();
            supervisor.on_child_exit(&name, status.ok().and_then(|s| s.code()));
        });

        Ok(())
    }

    /// Stop a running mind: SIGTERM to the group, SIGKILL after the grace
    /// period, then clean up registry and PID state.
    pub async fn stop_mind(self: &Arc<Self>, name: &str) -> Result<()> {
        self.stopping.lock().unwrap().insert(name.to_string());
        let cancelled_restart = {
            let mut pending = self.pending_restarts.lock().unwrap();
            pending.remove(name).map(|handle| handle.abort()).is_some()
        };
        let entry = self.children.lock().unwrap().remove(name);

        let result = match entry {
            None if cancelled_restart => {
                // The mind was waiting out a crash backoff; cancelling that
                // restart is the stop.
                self.clear_crash_attempts(name);
                if let Ok(mind_ref) = MindRef::parse(name) {
                    if mind_ref.variant.is_none() {
                        let _ = self.registry.set_running(&mind_ref.base, false);
                    }
                }
                self.activity
                    .publish(ActivityKind::MindStopped, name, Some("mind stopped"), None);
                Ok(())
            }
            None => {
                // During global shutdown a racing exit is not an error.
                if self.is_shutting_down() {
                    Ok(())
                } else {
                    Err(SupervisorError::NotRunning(name.to_string()))
                }
            }
            Some(entry) => {
                procinfo::signal_group(entry.pid, Signal::SIGTERM);
                if !entry.exit_seen.load(Ordering::Acquire) {
                    let waited =
                        tokio::time::timeout(self.tuning.stop_grace, entry.exited.notified())
                            .await;
                    if waited.is_err() {
                        warn!(mind = name, pid = entry.pid, "mind ignored SIGTERM, sending SIGKILL");
                        procinfo::signal_group(entry.pid, Signal::SIGKILL);
                        let _ = tokio::time::timeout(
                            Duration::from_secs(2),
                            entry.exited.notified(),
                        )
                        .await;
                    }
                }

                let _ = std::fs::remove_file(self.home.mind_pid(name));
                self.clear_crash_attempts(name);
                if let Ok(mind_ref) = MindRef::parse(name) {
                    if mind_ref.variant.is_none() {
                        if let Err(e) = self.registry.set_running(&mind_ref.base, false) {
                            warn!(mind = name, error = %e, "failed to clear registry running flag");
                        }
                    }
                }
                self.activity
                    .publish(ActivityKind::MindStopped, name, Some("mind stopped"), None);
                info!(mind = name, "mind stopped");
                Ok(())
            }
        };

        self.stopping.lock().unwrap().remove(name);
        result
    }

    pub async fn restart_mind(self: &Arc<Self>, name: &str) -> Result<()> {
        self.stop_mind(name).await?;
        self.start_mind(name).await
    }

    /// Global shutdown: refuse new starts and stop every tracked mind in
    /// parallel.
    pub async fn stop_all(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::Release);
        for (_, handle) in self.pending_restarts.lock().unwrap().drain() {
            handle.abort();
        }
        let names = self.running_minds();
        let mut handles = Vec::with_capacity(names.len());
        for name in names {
            let supervisor = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                if let Err(e) = supervisor.stop_mind(&name).await {
                    warn!(mind = %name, error = %e, "error stopping mind during shutdown");
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    // --- crash recovery ----------------------------------------------------

    fn on_child_exit(self: &Arc<Self>, name: &str, code: Option<i32>) {
        self.children.lock().unwrap().remove(name);
        let intentional =
            self.is_shutting_down() || self.stopping.lock().unwrap().contains(name);
        if intentional {
            return;
        }
        warn!(mind = name, code = ?code, "mind exited unexpectedly");
        let _ = std::fs::remove_file(self.home.mind_pid(name));
        self.handle_crash(name);
    }

    /// Schedule (or abandon) a crash restart. Kept synchronous so the
    /// restart task and this function can call each other freely.
    fn handle_crash(self: &Arc<Self>, name: &str) {
        let attempts = self.get_crash_attempts(name);
        if attempts >= MAX_CRASH_ATTEMPTS {
            error!(mind = name, attempts, "giving up on mind after repeated crashes");
            if let Ok(mind_ref) = MindRef::parse(name) {
                if mind_ref.variant.is_none() {
                    let _ = self.registry.set_running(&mind_ref.base, false);
                }
            }
            self.activity.publish(
                ActivityKind::MindStopped,
                name,
                Some("gave up after repeated crashes"),
                None,
            );
            return;
        }

        let delay = backoff_delay(self.tuning.backoff_base_ms, self.tuning.backoff_cap_ms, attempts);
        self.set_crash_attempts(name, attempts + 1);
        info!(
            mind = name,
            attempt = attempts + 1,
            delay_ms = delay.as_millis() as u64,
            "scheduling crash restart"
        );

        let supervisor = Arc::clone(self);
        let name = name.to_string();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            supervisor
                .pending_restarts
                .lock()
                .unwrap()
                .remove(&task_name);
            if supervisor.is_shutting_down()
                || supervisor.stopping.lock().unwrap().contains(&task_name)
            {
                return;
            }
            if let Err(e) = supervisor.start_for_recovery(&task_name).await {
                warn!(mind = %task_name, error = %e, "crash restart failed");
                supervisor.handle_crash(&task_name);
            }
        });
        if let Some(old) = self
            .pending_restarts
            .lock()
            .unwrap()
            .insert(name, handle)
        {
            old.abort();
        }
    }

    pub fn crash_attempt_count(&self, name: &str) -> u32 {
        self.get_crash_attempts(name)
    }

    fn get_crash_attempts(&self, name: &str) -> u32 {
        *self.crash_attempts.lock().unwrap().get(name).unwrap_or(&0)
    }

    fn set_crash_attempts(&self, name: &str, attempts: u32) {
        let mut map = self.crash_attempts.lock().unwrap();
        map.insert(name.to_string(), attempts);
        persist_crash_attempts(&self.home, &map);
    }

    fn clear_crash_attempts(&self, name: &str) {
        let mut map = self.crash_attempts.lock().unwrap();
        if map.remove(name).is_some() {
            persist_crash_attempts(&self.home, &map);
        }
    }

    // --- helpers -----------------------------------------------------------

    async fn port_is_serving(&self, port: u16) -> bool {
        let url = format!("http://127.0.0.1:{}/health", port);
        match self
            .http
            .get(&url)
            .timeout(Duration::from_secs(1))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Post the stashed context to the freshly started mind as a single
    /// system-channel message. Failures here are logged, never propagated.
    async fn deliver_pending_context(&self, target: &MindTarget) {
        let context = self.pending_context.lock().unwrap().remove(&target.name);
        let Some(context) = context else {
            return;
        };
        let text = match &context {
            serde_json::Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_default(),
        };
        let body = serde_json::json!({
            "content": [{"type": "text", "text": text}],
            "channel": "system:context",
            "sender": "volute",
        });
        let url = format!("http://127.0.0.1:{}/message", target.port);
        match self
            .http
            .post(&url)
            .json(&body)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                info!(mind = %target.name, "pending context delivered");
            }
            Ok(response) => {
                warn!(mind = %target.name, status = %response.status(), "mind rejected pending context");
            }
            Err(e) => {
                warn!(mind = %target.name, error = %e, "failed to deliver pending context");
            }
        }
    }
}

/// `min(base * 2^attempts, cap)` milliseconds.
fn backoff_delay(base_ms: u64, cap_ms: u64, attempts: u32) -> Duration {
    let factor = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor).min(cap_ms))
}

/// Forward one child stream line-by-line into the rotating log, signalling
/// readiness the first time stdout announces its listening port.
async fn forward_stream(
    stream: impl tokio::io::AsyncRead + Unpin,
    log: Arc<Mutex<RotatingLog>>,
    ready_tx: Option<mpsc::Sender<()>>,
) {
    let mut ready_tx = ready_tx;
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        {
            let mut log = log.lock().unwrap();
            if let Err(e) = log.write_line(&line) {
                warn!(error = %e, "failed to write mind log");
            }
        }
        if ready_tx.is_some() && line_reports_listening(&line) {
            if let Some(tx) = ready_tx.take() {
                let _ = tx.try_send(());
            }
        }
    }
}

/// Matches the readiness line `listening on :<port>`.
fn line_reports_listening(line: &str) -> bool {
    match line.find("listening on :") {
        Some(idx) => line[idx + "listening on :".len()..]
            .chars()
            .next()
            .map(|c| c.is_ascii_digit())
            .unwrap_or(false),
        None => false,
    }
}

fn chown_to_mind_user(mind: &str, state_dir: &std::path::Path) {
    // Per-mind OS users are provisioned as volute-<base name> out of band.
    let user = format!("volute-{}", mind.split('@').next().unwrap_or(mind));
    let status = std::process::Command::new("chown")
        .arg("-R")
        .arg(&user)
        .arg(state_dir)
        .status();
    match status {
        Ok(status) if status.success() => {}
        Ok(status) => warn!(%user, code = ?status.code(), "chown of state dir failed"),
        Err(e) => warn!(%user, error = %e, "chown of state dir failed"),
    }
}

fn load_crash_attempts(home: &VoluteHome) -> HashMap<String, u32> {
    match std::fs::read_to_string(home.crash_attempts()) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => HashMap::new(),
    }
}

fn persist_crash_attempts(home: &VoluteHome, map: &HashMap<String, u32>) {
    let path = home.crash_attempts();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let json = serde_json::to_string_pretty(map).unwrap_or_else(|_| "{}".to_string());
    let tmp = path.with_extension("json.tmp");
    if std::fs::write(&tmp, json).is_ok() {
        if let Err(e) = std::fs::rename(&tmp, &path) {
            warn!(error = %e, "failed to persist crash attempts");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_curve_matches_the_contract() {
        let delays: Vec<u64> = (0..6)
            .map(|n| backoff_delay(3_000, 60_000, n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![3_000, 6_000, 12_000, 24_000, 48_000, 60_000]);
    }

    #[test]
    fn listening_line_detection() {
        assert!(line_reports_listening("listening on :4100"));
        assert!(line_reports_listening("[info] mind listening on :80 now"));
        assert!(!line_reports_listening("listening on port 4100"));
        assert!(!line_reports_listening("listening on :"));
        assert!(!line_reports_listening("ready"));
    }
}
