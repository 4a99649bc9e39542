use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use homehub_process::{AppId, HealthReport, LogStream, LogTail, ProcessState, ProcessStatus};
use tokio::{process::Command, sync::OnceCell};

use crate::config::{HubConfig, HubSettings, ManagedApp};
use crate::error::LifecycleError;
use crate::logs;
use crate::pid_store;
use crate::probe::{OsProbe, ProcessProbe};
use crate::support::{
    EXIT_CODE_WAIT, HEALTH_POLL_INTERVAL, KILL_WAIT, POLL_INTERVAL, PORT_PROBE_TIMEOUT,
    STDERR_TAIL_BYTES, STDERR_TAIL_LINES, exit_code, is_no_such_process, kill_group,
    signal_process,
};

#[derive(Debug, Clone)]
struct ProcessRecord {
    state: ProcessState,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    last_activity: Option<Instant>,
    last_activity_at: Option<DateTime<Utc>>,
    last_exit_code: Option<i32>,
    message: Option<String>,
    // Bumped on every launch so a late exit watcher cannot touch a newer run.
    generation: u64,
    exited: bool,
}

impl ProcessRecord {
    fn stopped() -> Self {
        Self {
            state: ProcessState::Stopped,
            pid: None,
            started_at: None,
            last_activity: None,
            last_activity_at: None,
            last_exit_code: None,
            message: None,
            generation: 0,
            exited: false,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Some(Instant::now());
        self.last_activity_at = Some(Utc::now());
    }

    fn view(&self, app_id: &AppId) -> ProcessStatus {
        ProcessStatus {
            app_id: app_id.clone(),
            state: self.state,
            pid: self.pid,
            started_at: self.started_at,
            last_activity_at: self.last_activity_at,
            last_exit_code: self.last_exit_code,
            message: self.message.clone(),
        }
    }
}

#[derive(Debug)]
struct AppSlot {
    app: ManagedApp,
    // Serializes start/stop/restart for this app across their whole sequence.
    op: tokio::sync::Mutex<()>,
    // Filled from the pid file on first query.
    record: OnceCell<Mutex<ProcessRecord>>,
}

fn lock(m: &Mutex<ProcessRecord>) -> MutexGuard<'_, ProcessRecord> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Idle bookkeeping for one app, as seen by the idle scheduler.
#[derive(Debug, Clone)]
pub struct ActivitySnapshot {
    pub status: ProcessStatus,
    pub idle_for: Option<Duration>,
    pub idle_timeout: Duration,
}

#[derive(Debug)]
struct Inner {
    settings: HubSettings,
    probe: Arc<dyn ProcessProbe>,
    apps: Vec<Arc<AppSlot>>,
    index: HashMap<AppId, usize>,
}

/// Owns one state machine per managed app.
#[derive(Debug, Clone)]
pub struct LifecycleManager {
    inner: Arc<Inner>,
}

impl LifecycleManager {
    pub fn new(config: HubConfig) -> Self {
        Self::with_probe(config, Arc::new(OsProbe::new()))
    }

    pub fn with_probe(config: HubConfig, probe: Arc<dyn ProcessProbe>) -> Self {
        let mut apps = Vec::with_capacity(config.apps.len());
        let mut index = HashMap::with_capacity(config.apps.len());
        for app in config.apps {
            index.insert(app.id.clone(), apps.len());
            apps.push(Arc::new(AppSlot {
                app,
                op: tokio::sync::Mutex::new(()),
                record: OnceCell::new(),
            }));
        }
        Self {
            inner: Arc::new(Inner {
                settings: config.hub,
                probe,
                apps,
                index,
            }),
        }
    }

    pub fn settings(&self) -> &HubSettings {
        &self.inner.settings
    }

    pub fn apps(&self) -> impl Iterator<Item = &ManagedApp> {
        self.inner.apps.iter().map(|s| &s.app)
    }

    pub fn app(&self, app_id: &str) -> Result<&ManagedApp, LifecycleError> {
        self.slot(app_id).map(|s| &s.app)
    }

    fn slot(&self, app_id: &str) -> Result<&Arc<AppSlot>, LifecycleError> {
        self.inner
            .index
            .get(&AppId::from(app_id))
            .map(|&i| &self.inner.apps[i])
            .ok_or_else(|| LifecycleError::NotFound(app_id.to_string()))
    }

    pub fn idle_timeout(&self, app: &ManagedApp) -> Duration {
        app.idle_timeout_or(self.inner.settings.default_idle_timeout)
    }

    /// Reconciled status. Never waits for an in-flight start/stop.
    pub async fn status(&self, app_id: &str) -> Result<ProcessStatus, LifecycleError> {
        let slot = self.slot(app_id)?;
        Ok(self.reconcile(slot).await.view(&slot.app.id))
    }

    pub async fn activity(&self, app_id: &str) -> Result<ActivitySnapshot, LifecycleError> {
        let slot = self.slot(app_id)?;
        let rec = self.reconcile(slot).await;
        Ok(ActivitySnapshot {
            status: rec.view(&slot.app.id),
            idle_for: rec.last_activity.map(|t| t.elapsed()),
            idle_timeout: self.idle_timeout(&slot.app),
        })
    }

    pub async fn touch_activity(&self, app_id: &str) -> Result<ProcessStatus, LifecycleError> {
        let slot = self.slot(app_id)?;
        let record = self.record(slot).await;
        let mut rec = lock(record);
        rec.touch();
        Ok(rec.view(&slot.app.id))
    }

    pub async fn start(&self, app_id: &str) -> Result<ProcessStatus, LifecycleError> {
        let slot = self.slot(app_id)?;
        let _op = slot.op.lock().await;
        self.start_locked(slot).await
    }

    /// Always ends `stopped`; the only error is an unknown app.
    pub async fn stop(&self, app_id: &str) -> Result<ProcessStatus, LifecycleError> {
        let slot = self.slot(app_id)?;
        let _op = slot.op.lock().await;
        Ok(self.stop_locked(slot).await)
    }

    /// Stops the app only if, under its operation lock, it is still running
    /// and idle past its timeout. Returns the new status when it stopped.
    pub async fn stop_if_idle(&self, app_id: &str) -> Result<Option<ProcessStatus>, LifecycleError> {
        let slot = self.slot(app_id)?;
        let _op = slot.op.lock().await;
        let current = self.reconcile(slot).await;
        if current.state != ProcessState::Running {
            return Ok(None);
        }
        let timeout = self.idle_timeout(&slot.app);
        let Some(idle) = current.last_activity.map(|t| t.elapsed()) else {
            return Ok(None);
        };
        if idle <= timeout {
            return Ok(None);
        }

        tracing::info!(
            app_id = %slot.app.id,
            idle_secs = idle.as_secs(),
            timeout_secs = timeout.as_secs(),
            "stopping idle app"
        );
        Ok(Some(self.stop_locked(slot).await))
    }

    pub async fn restart(&self, app_id: &str) -> Result<ProcessStatus, LifecycleError> {
        let slot = self.slot(app_id)?;
        let _op = slot.op.lock().await;
        tracing::info!(app_id = %slot.app.id, "restarting");
        self.stop_locked(slot).await;
        let pause = self.inner.settings.restart_pause;
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
        self.start_locked(slot).await
    }

    pub fn app_url(&self, app_id: &str) -> Result<String, LifecycleError> {
        Ok(self.slot(app_id)?.app.url())
    }

    /// On-demand health check of a running app. Uses the configured health
    /// path, or `/` when none is set.
    pub async fn health(&self, app_id: &str) -> Result<HealthReport, LifecycleError> {
        let slot = self.slot(app_id)?;
        let status = self.reconcile(slot).await;
        if status.state != ProcessState::Running {
            return Ok(HealthReport {
                app_id: slot.app.id.clone(),
                healthy: false,
                url: None,
                reason: Some("not running".to_string()),
            });
        }

        let url = slot
            .app
            .health_url()
            .unwrap_or_else(|| format!("{}/", slot.app.url()));
        let healthy = self
            .inner
            .probe
            .check_health(&url, self.inner.settings.health_timeout)
            .await;
        Ok(HealthReport {
            app_id: slot.app.id.clone(),
            healthy,
            reason: (!healthy).then(|| "health endpoint did not answer with 2xx".to_string()),
            url: Some(url),
        })
    }

    pub async fn tail_log(
        &self,
        app_id: &str,
        stream: LogStream,
        lines: usize,
    ) -> Result<LogTail, LifecycleError> {
        let slot = self.slot(app_id)?;
        let path = logs::log_path(&self.inner.settings.logs_dir, &slot.app.id, stream);
        let (lines, size_bytes) = logs::tail_default(&path, lines)
            .await
            .map_err(|source| LifecycleError::LogRead {
                path: path.clone(),
                source,
            })?;
        Ok(LogTail {
            app_id: slot.app.id.clone(),
            stream,
            path: path.display().to_string(),
            lines,
            size_bytes,
        })
    }

    async fn record<'a>(&self, slot: &'a AppSlot) -> &'a Mutex<ProcessRecord> {
        slot.record
            .get_or_init(|| async { Mutex::new(self.recover(&slot.app).await) })
            .await
    }

    // First sight of an app since hub startup: adopt a live process from the
    // pid file, or forget a stale one.
    async fn recover(&self, app: &ManagedApp) -> ProcessRecord {
        let mut rec = ProcessRecord::stopped();
        let Some(pid) = pid_store::load(app).await else {
            return rec;
        };

        if self.inner.probe.is_alive(pid) {
            tracing::info!(app_id = %app.id, pid, "adopted running process from pid file");
            rec.state = ProcessState::Running;
            rec.pid = Some(pid);
            rec.message = Some(format!("adopted process {pid} from pid file"));
            rec.touch();
        } else {
            tracing::debug!(app_id = %app.id, pid, "clearing stale pid file");
            pid_store::clear(app).await;
        }
        rec
    }

    // Demotes `running` to `crashed` when the process is gone. This is the one
    // place where a silently dead process is discovered.
    async fn reconcile(&self, slot: &AppSlot) -> ProcessRecord {
        let record = self.record(slot).await;
        let (pid, generation) = {
            let rec = lock(record);
            match (rec.state, rec.pid) {
                (ProcessState::Running, Some(pid)) => (pid, rec.generation),
                _ => return rec.clone(),
            }
        };

        // Check liveness without the record lock; only demote if nothing moved meanwhile.
        if self.inner.probe.is_alive(pid) {
            return lock(record).clone();
        }

        let (snapshot, demoted) = {
            let mut rec = lock(record);
            let unchanged = rec.state == ProcessState::Running
                && rec.pid == Some(pid)
                && rec.generation == generation;
            if unchanged {
                rec.state = ProcessState::Crashed;
                rec.pid = None;
                rec.message = Some(match rec.last_exit_code {
                    Some(code) => format!("process {pid} exited unexpectedly (code {code})"),
                    None => format!("process {pid} exited unexpectedly"),
                });
            }
            (rec.clone(), unchanged)
        };

        if demoted {
            tracing::warn!(app_id = %slot.app.id, pid, "process is gone; marking crashed");
            pid_store::clear(&slot.app).await;
        }
        snapshot
    }

    async fn start_locked(&self, slot: &Arc<AppSlot>) -> Result<ProcessStatus, LifecycleError> {
        let current = self.reconcile(slot).await;
        if current.state.is_active() {
            tracing::info!(app_id = %slot.app.id, pid = ?current.pid, "already running");
            return Ok(current.view(&slot.app.id));
        }

        tracing::info!(app_id = %slot.app.id, "starting");
        match self.launch(slot).await {
            Ok(status) => Ok(status),
            Err(err) => {
                tracing::error!(app_id = %slot.app.id, code = err.code(), error = %err, "start failed");
                let record = self.record(slot).await;
                {
                    let mut rec = lock(record);
                    rec.state = ProcessState::Crashed;
                    rec.pid = None;
                    rec.message = Some(err.to_string());
                }
                pid_store::clear(&slot.app).await;
                Err(err)
            }
        }
    }

    async fn launch(&self, slot: &Arc<AppSlot>) -> Result<ProcessStatus, LifecycleError> {
        let app = &slot.app;
        let launch_err = |message: String| LifecycleError::Launch {
            app_id: app.id.clone(),
            message,
            details: None,
        };

        if !tokio::fs::metadata(&app.working_dir)
            .await
            .is_ok_and(|m| m.is_dir())
        {
            return Err(launch_err(format!(
                "working directory does not exist: {}",
                app.working_dir.display()
            )));
        }
        if let Some(entry) = &app.entry {
            let entry_path = app.working_dir.join(entry);
            if tokio::fs::metadata(&entry_path).await.is_err() {
                return Err(launch_err(format!(
                    "entry file not found: {}",
                    entry_path.display()
                )));
            }
        }
        let program = app.resolved_program();
        if program.components().count() > 1 && tokio::fs::metadata(&program).await.is_err() {
            return Err(launch_err(format!(
                "program not found: {}",
                program.display()
            )));
        }

        // Nothing of ours is running, so anything on the port is foreign.
        if self
            .inner
            .probe
            .port_in_use(app.probe_host(), app.port, PORT_PROBE_TIMEOUT)
            .await
        {
            return Err(LifecycleError::PortConflict {
                app_id: app.id.clone(),
                port: app.port,
            });
        }

        let record = self.record(slot).await;
        let generation = {
            let mut rec = lock(record);
            rec.state = ProcessState::Starting;
            rec.pid = None;
            rec.started_at = Some(Utc::now());
            rec.last_exit_code = None;
            rec.exited = false;
            rec.message = Some("starting".to_string());
            rec.generation = rec.generation.wrapping_add(1);
            rec.generation
        };

        let args = app.launch_args();
        let command_line = std::iter::once(program.display().to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        let marker = logs::launch_marker(&app.id, &command_line, &app.working_dir);
        let logs_dir = &self.inner.settings.logs_dir;
        let stdout_path = logs::log_path(logs_dir, &app.id, LogStream::Stdout);
        let stderr_path = logs::log_path(logs_dir, &app.id, LogStream::Stderr);
        let stdout = logs::open_for_child(&stdout_path, &marker)
            .await
            .map_err(|e| launch_err(format!("open {}: {e}", stdout_path.display())))?;
        let stderr = logs::open_for_child(&stderr_path, &marker)
            .await
            .map_err(|e| launch_err(format!("open {}: {e}", stderr_path.display())))?;

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .current_dir(&app.working_dir)
            .envs(&app.env)
            .stdin(std::process::Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    // New session: the child leads its own process group, so
                    // stop() can signal the whole tree.
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        tracing::info!(app_id = %app.id, command = %command_line, cwd = %app.working_dir.display(), "spawning");
        let mut child = cmd
            .spawn()
            .map_err(|e| launch_err(format!("spawn {}: {e}", program.display())))?;
        let Some(pid) = child.id() else {
            let code = child.try_wait().ok().flatten().and_then(exit_code);
            lock(record).last_exit_code = code;
            return Err(launch_err("process exited before its pid was read".to_string()));
        };

        if let Err(err) = pid_store::save(app, pid).await {
            tracing::warn!(app_id = %app.id, pid, error = %err, "failed to write pid file");
        }
        lock(record).pid = Some(pid);
        tracing::info!(app_id = %app.id, pid, "spawned");

        self.spawn_exit_watcher(slot.clone(), generation, child);
        self.await_ready(slot, pid, generation).await
    }

    // Reaps the child and records its exit code for reconciliation to report.
    fn spawn_exit_watcher(&self, slot: Arc<AppSlot>, generation: u64, mut child: tokio::process::Child) {
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => exit_code(status),
                Err(err) => {
                    tracing::warn!(app_id = %slot.app.id, error = %err, "wait on child failed");
                    None
                }
            };
            tracing::debug!(app_id = %slot.app.id, exit_code = ?code, "child exited");

            let Some(record) = slot.record.get() else {
                return;
            };
            let mut rec = lock(record);
            if rec.generation == generation {
                rec.exited = true;
                rec.last_exit_code = code;
            }
        });
    }

    fn has_exited(&self, record: &Mutex<ProcessRecord>, pid: u32, generation: u64) -> bool {
        let exited = {
            let rec = lock(record);
            rec.generation == generation && rec.exited
        };
        exited || !self.inner.probe.is_alive(pid)
    }

    async fn await_ready(
        &self,
        slot: &AppSlot,
        pid: u32,
        generation: u64,
    ) -> Result<ProcessStatus, LifecycleError> {
        let settings = &self.inner.settings;
        let record = self.record(slot).await;
        let started = Instant::now();
        let grace_deadline = started + settings.startup_grace;
        let deadline = started + settings.startup_timeout.max(settings.startup_grace);

        loop {
            if self.has_exited(record, pid, generation) {
                return Err(self.early_exit_error(slot, record, pid, generation).await);
            }
            let now = Instant::now();
            if now >= grace_deadline {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL.min(grace_deadline - now)).await;
        }

        if let Some(url) = slot.app.health_url() {
            loop {
                if self.has_exited(record, pid, generation) {
                    return Err(self.early_exit_error(slot, record, pid, generation).await);
                }
                if self
                    .inner
                    .probe
                    .check_health(&url, settings.health_timeout)
                    .await
                {
                    break;
                }
                if Instant::now() >= deadline {
                    tracing::warn!(app_id = %slot.app.id, pid, %url, "never became healthy; terminating");
                    self.terminate(&slot.app, pid).await;
                    self.kill_leftovers(&slot.app, pid);
                    return Err(LifecycleError::HealthCheckTimeout {
                        app_id: slot.app.id.clone(),
                        timeout_ms: settings.startup_timeout.as_millis() as u64,
                    });
                }
                tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
            }
        }

        let mut rec = lock(record);
        rec.state = ProcessState::Running;
        rec.message = None;
        rec.touch();
        tracing::info!(app_id = %slot.app.id, pid, port = slot.app.port, "running");
        Ok(rec.view(&slot.app.id))
    }

    async fn early_exit_error(
        &self,
        slot: &AppSlot,
        record: &Mutex<ProcessRecord>,
        pid: u32,
        generation: u64,
    ) -> LifecycleError {
        // The watcher may not have reaped the child yet.
        let deadline = Instant::now() + EXIT_CODE_WAIT;
        let code = loop {
            let code = {
                let rec = lock(record);
                (rec.generation == generation && rec.exited).then_some(rec.last_exit_code)
            };
            match code {
                Some(code) => break code,
                None if Instant::now() >= deadline => break None,
                None => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        };
        // A launcher that backgrounds the real server and exits would
        // otherwise leave it holding the port.
        self.kill_leftovers(&slot.app, pid);

        let stderr_path = logs::log_path(&self.inner.settings.logs_dir, &slot.app.id, LogStream::Stderr);
        let details = logs::tail(&stderr_path, STDERR_TAIL_LINES, STDERR_TAIL_BYTES)
            .await
            .ok()
            .map(|(lines, _)| {
                lines
                    .into_iter()
                    .filter(|l| !l.starts_with("[homehub]"))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .filter(|s| !s.trim().is_empty());

        LifecycleError::Launch {
            app_id: slot.app.id.clone(),
            message: match code {
                Some(code) => format!("exited during startup with code {code}"),
                None => "exited during startup".to_string(),
            },
            details,
        }
    }

    fn kill_leftovers(&self, app: &ManagedApp, pgid: u32) {
        #[cfg(unix)]
        match kill_group(pgid) {
            Ok(()) => tracing::info!(app_id = %app.id, pgid, "killed leftover process group members"),
            Err(err) if is_no_such_process(&err) => {}
            Err(err) => {
                tracing::warn!(app_id = %app.id, pgid, error = %err, "failed to kill leftover process group")
            }
        };
    }

    async fn stop_locked(&self, slot: &AppSlot) -> ProcessStatus {
        let current = self.reconcile(slot).await;
        let record = self.record(slot).await;

        let pid = match (current.state, current.pid) {
            (ProcessState::Stopped, _) => return current.view(&slot.app.id),
            (_, Some(pid)) => pid,
            // Crashed: nothing left to signal; acknowledge it.
            (_, None) => {
                pid_store::clear(&slot.app).await;
                let mut rec = lock(record);
                rec.state = ProcessState::Stopped;
                rec.message = Some("stopped".to_string());
                return rec.view(&slot.app.id);
            }
        };

        tracing::info!(app_id = %slot.app.id, pid, "stopping");
        {
            let mut rec = lock(record);
            rec.state = ProcessState::Stopping;
            rec.message = Some("stopping".to_string());
        }

        let forced = self.terminate(&slot.app, pid).await;
        pid_store::clear(&slot.app).await;

        let mut rec = lock(record);
        rec.state = ProcessState::Stopped;
        rec.pid = None;
        rec.message = Some(if forced {
            "killed after shutdown grace".to_string()
        } else {
            "stopped".to_string()
        });
        tracing::info!(app_id = %slot.app.id, pid, forced, "stopped");
        rec.view(&slot.app.id)
    }

    /// SIGTERM, wait the shutdown grace, then SIGKILL. Returns whether the
    /// kill was needed. Failures are logged, never raised.
    async fn terminate(&self, app: &ManagedApp, pid: u32) -> bool {
        #[cfg(unix)]
        if let Err(err) = signal_process(pid, libc::SIGTERM) {
            if is_no_such_process(&err) {
                tracing::debug!(app_id = %app.id, pid, "process already gone");
                return false;
            }
            tracing::warn!(app_id = %app.id, pid, error = %err, "SIGTERM failed");
        }

        if self.wait_for_exit(pid, self.inner.settings.shutdown_grace).await {
            return false;
        }

        tracing::warn!(app_id = %app.id, pid, "did not stop gracefully; sending SIGKILL");
        #[cfg(unix)]
        if let Err(err) = signal_process(pid, libc::SIGKILL)
            && !is_no_such_process(&err)
        {
            tracing::warn!(app_id = %app.id, pid, error = %err, "SIGKILL failed");
        }
        if !self.wait_for_exit(pid, KILL_WAIT).await {
            tracing::error!(app_id = %app.id, pid, "process survived SIGKILL");
        }
        true
    }

    async fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.inner.probe.is_alive(pid) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::probe::pid_is_alive;
    use crate::test_support::{hub_config, settings, sh_app};

    async fn wait_for_state(m: &LifecycleManager, id: &str, want: ProcessState) -> ProcessStatus {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let st = m.status(id).await.unwrap();
            if st.state == want || Instant::now() >= deadline {
                return st;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn start_then_stop_cycles_through_states() {
        let dir = tempfile::tempdir().unwrap();
        let app = sh_app(dir.path(), "demo", "exec sleep 30");
        let pid_file = pid_store::path_for(&app);
        let m = LifecycleManager::new(hub_config(dir.path(), vec![app]));

        assert_eq!(m.status("demo").await.unwrap().state, ProcessState::Stopped);

        let st = m.start("demo").await.unwrap();
        assert_eq!(st.state, ProcessState::Running);
        let pid = st.pid.expect("running app has a pid");
        assert!(st.started_at.is_some());
        assert!(st.last_activity_at.is_some());
        assert!(pid_is_alive(pid));
        assert_eq!(std::fs::read_to_string(&pid_file).unwrap(), pid.to_string());

        let st = m.stop("demo").await.unwrap();
        assert_eq!(st.state, ProcessState::Stopped);
        assert_eq!(st.pid, None);
        assert!(!pid_file.exists());
        assert!(!pid_is_alive(pid));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_spawn_one_child() {
        let dir = tempfile::tempdir().unwrap();
        let app = sh_app(dir.path(), "demo", "echo launched; exec sleep 30");
        let m = LifecycleManager::new(hub_config(dir.path(), vec![app]));

        let (a, b) = tokio::join!(m.start("demo"), m.start("demo"));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.state, ProcessState::Running);
        assert_eq!(b.state, ProcessState::Running);
        assert_eq!(a.pid, b.pid);

        let stdout = std::fs::read_to_string(dir.path().join("logs/demo_stdout.log")).unwrap();
        assert_eq!(stdout.lines().filter(|l| *l == "launched").count(), 1);

        m.stop("demo").await.unwrap();
    }

    #[tokio::test]
    async fn start_is_a_no_op_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let app = sh_app(dir.path(), "demo", "exec sleep 30");
        let m = LifecycleManager::new(hub_config(dir.path(), vec![app]));

        let first = m.start("demo").await.unwrap();
        let second = m.start("demo").await.unwrap();
        assert_eq!(first.pid, second.pid);
        m.stop("demo").await.unwrap();
    }

    #[tokio::test]
    async fn external_kill_is_reconciled_as_crashed() {
        let dir = tempfile::tempdir().unwrap();
        let app = sh_app(dir.path(), "demo", "exec sleep 30");
        let pid_file = pid_store::path_for(&app);
        let m = LifecycleManager::new(hub_config(dir.path(), vec![app]));

        let pid = m.start("demo").await.unwrap().pid.unwrap();
        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }

        let st = wait_for_state(&m, "demo", ProcessState::Crashed).await;
        assert_eq!(st.state, ProcessState::Crashed);
        assert_eq!(st.pid, None);
        assert!(!pid_file.exists());

        // The exit watcher may record the code slightly after the demotion.
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut code = st.last_exit_code;
        while code.is_none() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
            code = m.status("demo").await.unwrap().last_exit_code;
        }
        assert_eq!(code, Some(128 + libc::SIGKILL));

        // A crashed app can be started again.
        let st = m.start("demo").await.unwrap();
        assert_eq!(st.state, ProcessState::Running);
        assert_eq!(st.last_exit_code, None);
        m.stop("demo").await.unwrap();
    }

    #[tokio::test]
    async fn missing_working_dir_is_a_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let app = sh_app(&dir.path().join("missing"), "demo", "exec sleep 30");
        let m = LifecycleManager::new(hub_config(dir.path(), vec![app]));

        let err = m.start("demo").await.unwrap_err();
        assert!(matches!(err, LifecycleError::Launch { .. }), "{err}");
        assert_eq!(err.code(), "launch_error");

        let st = m.status("demo").await.unwrap();
        assert_eq!(st.state, ProcessState::Crashed);
        assert!(st.message.unwrap().contains("working directory"));
    }

    #[tokio::test]
    async fn missing_entry_file_is_a_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = sh_app(dir.path(), "demo", "exec sleep 30");
        app.entry = Some("run.py".into());
        let m = LifecycleManager::new(hub_config(dir.path(), vec![app]));

        let err = m.start("demo").await.unwrap_err();
        assert!(err.to_string().contains("entry file not found"), "{err}");
        assert_eq!(m.status("demo").await.unwrap().state, ProcessState::Crashed);
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let app = ManagedApp::new("demo", dir.path(), "definitely-not-a-real-binary-xyz", vec![], 1);
        let m = LifecycleManager::new(hub_config(dir.path(), vec![app]));

        let err = m.start("demo").await.unwrap_err();
        assert!(matches!(err, LifecycleError::Launch { .. }), "{err}");
        assert_eq!(m.status("demo").await.unwrap().state, ProcessState::Crashed);
    }

    #[tokio::test]
    async fn early_exit_reports_code_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let app = sh_app(dir.path(), "demo", "echo boom >&2; exit 3");
        let pid_file = pid_store::path_for(&app);
        let m = LifecycleManager::new(hub_config(dir.path(), vec![app]));

        let err = m.start("demo").await.unwrap_err();
        assert!(err.to_string().contains("code 3"), "{err}");
        assert!(err.details().unwrap_or_default().contains("boom"));

        let st = m.status("demo").await.unwrap();
        assert_eq!(st.state, ProcessState::Crashed);
        assert_eq!(st.last_exit_code, Some(3));
        assert!(!pid_file.exists());
    }

    #[tokio::test]
    async fn bound_port_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut app = sh_app(dir.path(), "demo", "exec sleep 30");
        app.port = port;
        let m = LifecycleManager::new(hub_config(dir.path(), vec![app]));

        let err = m.start("demo").await.unwrap_err();
        assert!(matches!(err, LifecycleError::PortConflict { port: p, .. } if p == port), "{err}");
        assert_eq!(m.status("demo").await.unwrap().state, ProcessState::Crashed);
        drop(listener);
    }

    #[tokio::test]
    async fn unhealthy_app_times_out_and_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = sh_app(dir.path(), "demo", "exec sleep 30");
        app.health_path = Some("/health".to_string());
        let pid_file = pid_store::path_for(&app);
        let mut cfg = hub_config(dir.path(), vec![app]);
        cfg.hub.startup_timeout = Duration::from_millis(800);
        cfg.hub.health_timeout = Duration::from_millis(100);
        let m = LifecycleManager::new(cfg);

        let err = m.start("demo").await.unwrap_err();
        assert!(matches!(err, LifecycleError::HealthCheckTimeout { .. }), "{err}");
        assert_eq!(m.status("demo").await.unwrap().state, ProcessState::Crashed);
        assert!(!pid_file.exists());
    }

    #[derive(Debug)]
    struct HealthyAfter {
        calls: std::sync::atomic::AtomicUsize,
        after: usize,
    }

    #[async_trait::async_trait]
    impl ProcessProbe for HealthyAfter {
        fn is_alive(&self, pid: u32) -> bool {
            pid_is_alive(pid)
        }

        async fn check_health(&self, _url: &str, _timeout: Duration) -> bool {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1 >= self.after
        }

        async fn port_in_use(&self, _host: &str, _port: u16, _timeout: Duration) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn becomes_running_once_health_passes() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = sh_app(dir.path(), "demo", "exec sleep 30");
        app.health_path = Some("/health".to_string());
        let probe = Arc::new(HealthyAfter {
            calls: Default::default(),
            after: 3,
        });
        let m = LifecycleManager::with_probe(hub_config(dir.path(), vec![app]), probe.clone());

        let st = m.start("demo").await.unwrap();
        assert_eq!(st.state, ProcessState::Running);
        assert!(probe.calls.load(std::sync::atomic::Ordering::SeqCst) >= 3);

        let report = m.health("demo").await.unwrap();
        assert!(report.healthy);
        assert!(report.url.unwrap().ends_with("/health"));
        m.stop("demo").await.unwrap();
    }

    #[tokio::test]
    async fn stop_escalates_to_sigkill() {
        let dir = tempfile::tempdir().unwrap();
        let app = sh_app(dir.path(), "demo", "trap '' TERM; while true; do sleep 1; done");
        let mut cfg = hub_config(dir.path(), vec![app]);
        cfg.hub.shutdown_grace = Duration::from_millis(300);
        let m = LifecycleManager::new(cfg);

        let pid = m.start("demo").await.unwrap().pid.unwrap();
        let st = m.stop("demo").await.unwrap();
        assert_eq!(st.state, ProcessState::Stopped);
        assert_eq!(st.message.as_deref(), Some("killed after shutdown grace"));
        assert!(!pid_is_alive(pid));
    }

    #[tokio::test]
    async fn stop_is_a_no_op_when_stopped_and_clears_crashed() {
        let dir = tempfile::tempdir().unwrap();
        let app = sh_app(dir.path(), "demo", "exit 1");
        let m = LifecycleManager::new(hub_config(dir.path(), vec![app]));

        let st = m.stop("demo").await.unwrap();
        assert_eq!(st.state, ProcessState::Stopped);

        m.start("demo").await.unwrap_err();
        assert_eq!(m.status("demo").await.unwrap().state, ProcessState::Crashed);
        let st = m.stop("demo").await.unwrap();
        assert_eq!(st.state, ProcessState::Stopped);
        assert_eq!(st.last_exit_code, Some(1));
    }

    #[tokio::test]
    async fn restart_launches_a_new_process() {
        let dir = tempfile::tempdir().unwrap();
        let app = sh_app(dir.path(), "demo", "exec sleep 30");
        let m = LifecycleManager::new(hub_config(dir.path(), vec![app]));

        let first = m.start("demo").await.unwrap().pid.unwrap();
        let st = m.restart("demo").await.unwrap();
        assert_eq!(st.state, ProcessState::Running);
        let second = st.pid.unwrap();
        assert_ne!(first, second);
        assert!(!pid_is_alive(first));
        m.stop("demo").await.unwrap();
    }

    #[tokio::test]
    async fn restart_from_stopped_just_starts() {
        let dir = tempfile::tempdir().unwrap();
        let app = sh_app(dir.path(), "demo", "exec sleep 30");
        let m = LifecycleManager::new(hub_config(dir.path(), vec![app]));

        let st = m.restart("demo").await.unwrap();
        assert_eq!(st.state, ProcessState::Running);
        m.stop("demo").await.unwrap();
    }

    #[tokio::test]
    async fn unknown_app_is_not_found_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let m = LifecycleManager::new(hub_config(dir.path(), vec![]));

        assert!(matches!(m.status("nope").await, Err(LifecycleError::NotFound(_))));
        assert!(matches!(m.start("nope").await, Err(LifecycleError::NotFound(_))));
        assert!(matches!(m.stop("nope").await, Err(LifecycleError::NotFound(_))));
        assert!(matches!(m.restart("nope").await, Err(LifecycleError::NotFound(_))));
        assert!(matches!(m.touch_activity("nope").await, Err(LifecycleError::NotFound(_))));
        assert!(matches!(m.app_url("nope"), Err(LifecycleError::NotFound(_))));
    }

    #[tokio::test]
    async fn corrupt_pid_file_reads_as_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let app = sh_app(dir.path(), "demo", "exec sleep 30");
        std::fs::write(pid_store::path_for(&app), "garbage").unwrap();
        let m = LifecycleManager::new(hub_config(dir.path(), vec![app]));

        let st = m.status("demo").await.unwrap();
        assert_eq!(st.state, ProcessState::Stopped);
        assert_eq!(st.pid, None);
    }

    #[tokio::test]
    async fn stale_pid_file_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let app = sh_app(dir.path(), "demo", "exec sleep 30");
        let mut gone = std::process::Command::new("/bin/sh")
            .args(["-c", "exit 0"])
            .spawn()
            .unwrap();
        let stale = gone.id();
        gone.wait().unwrap();
        std::fs::write(pid_store::path_for(&app), stale.to_string()).unwrap();
        let pid_file = pid_store::path_for(&app);
        let m = LifecycleManager::new(hub_config(dir.path(), vec![app]));

        assert_eq!(m.status("demo").await.unwrap().state, ProcessState::Stopped);
        assert!(!pid_file.exists());
    }

    #[tokio::test]
    async fn live_pid_file_is_adopted_and_stoppable() {
        let dir = tempfile::tempdir().unwrap();
        let app = sh_app(dir.path(), "demo", "exec sleep 30");
        let mut orphan = std::process::Command::new("/bin/sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = orphan.id();
        std::fs::write(pid_store::path_for(&app), pid.to_string()).unwrap();
        let m = LifecycleManager::new(hub_config(dir.path(), vec![app]));

        let st = m.status("demo").await.unwrap();
        assert_eq!(st.state, ProcessState::Running);
        assert_eq!(st.pid, Some(pid));

        // Adopted processes are not our children; nothing reaps them but the
        // zombie check still sees them exit.
        let st = m.stop("demo").await.unwrap();
        assert_eq!(st.state, ProcessState::Stopped);
        orphan.wait().unwrap();
    }

    #[tokio::test]
    async fn touch_activity_moves_the_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let app = sh_app(dir.path(), "demo", "exec sleep 30");
        let m = LifecycleManager::new(hub_config(dir.path(), vec![app]));

        assert_eq!(m.status("demo").await.unwrap().last_activity_at, None);
        let st = m.touch_activity("demo").await.unwrap();
        assert!(st.last_activity_at.is_some());

        let snap = m.activity("demo").await.unwrap();
        assert!(snap.idle_for.unwrap() < Duration::from_secs(5));
        assert_eq!(snap.idle_timeout, settings(dir.path()).default_idle_timeout);
    }

    #[tokio::test]
    async fn health_of_stopped_app_is_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let app = sh_app(dir.path(), "demo", "exec sleep 30");
        let m = LifecycleManager::new(hub_config(dir.path(), vec![app]));

        let report = m.health("demo").await.unwrap();
        assert!(!report.healthy);
        assert_eq!(report.reason.as_deref(), Some("not running"));
    }

    #[tokio::test]
    async fn tail_log_reads_child_output() {
        let dir = tempfile::tempdir().unwrap();
        let app = sh_app(dir.path(), "demo", "echo hello from demo; exec sleep 30");
        let m = LifecycleManager::new(hub_config(dir.path(), vec![app]));

        m.start("demo").await.unwrap();
        let tail = m.tail_log("demo", LogStream::Stdout, 10).await.unwrap();
        assert!(tail.lines.iter().any(|l| l == "hello from demo"), "{:?}", tail.lines);
        assert!(tail.size_bytes > 0);
        m.stop("demo").await.unwrap();
    }

    #[tokio::test]
    async fn apps_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let slow = sh_app(dir.path(), "slow", "trap '' TERM; while true; do sleep 1; done");
        let other = sh_app(dir.path(), "other", "exec sleep 30");
        let mut cfg = hub_config(dir.path(), vec![slow, other]);
        cfg.hub.shutdown_grace = Duration::from_secs(2);
        let m = LifecycleManager::new(cfg);

        m.start("slow").await.unwrap();
        let stopping = tokio::spawn({
            let m = m.clone();
            async move { m.stop("slow").await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        // `other` is usable while `slow` sits in its shutdown grace.
        let began = Instant::now();
        assert_eq!(m.status("slow").await.unwrap().state, ProcessState::Stopping);
        assert_eq!(m.status("other").await.unwrap().state, ProcessState::Stopped);
        assert!(began.elapsed() < Duration::from_secs(1));

        stopping.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn apps_in_one_directory_keep_separate_processes() {
        let dir = tempfile::tempdir().unwrap();
        let a = sh_app(dir.path(), "a", "exec sleep 30");
        let b = sh_app(dir.path(), "b", "exec sleep 30");
        let m = LifecycleManager::new(hub_config(dir.path(), vec![a, b]));

        let first = m.start("a").await.unwrap();
        let pid_a = first.pid.unwrap();
        assert_eq!(m.status("b").await.unwrap().state, ProcessState::Stopped);

        let second = m.start("b").await.unwrap();
        let pid_b = second.pid.unwrap();
        assert_ne!(pid_a, pid_b);

        m.stop("b").await.unwrap();
        assert!(!pid_is_alive(pid_b));
        let st = m.status("a").await.unwrap();
        assert_eq!(st.state, ProcessState::Running);
        assert_eq!(st.pid, Some(pid_a));
        assert!(pid_is_alive(pid_a));

        m.stop("a").await.unwrap();
    }

    #[tokio::test]
    async fn stop_if_idle_stops_an_idle_app() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = sh_app(dir.path(), "demo", "exec sleep 30");
        app.idle_timeout = Some(Duration::from_millis(500));
        let m = LifecycleManager::new(hub_config(dir.path(), vec![app]));

        let pid = m.start("demo").await.unwrap().pid.unwrap();
        assert!(m.stop_if_idle("demo").await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(700)).await;
        let st = m.stop_if_idle("demo").await.unwrap().expect("idle app is stopped");
        assert_eq!(st.state, ProcessState::Stopped);
        assert!(!pid_is_alive(pid));
    }

    #[tokio::test]
    async fn idle_tick_spares_app_touched_while_waiting_for_the_op_lock() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = sh_app(dir.path(), "demo", "exec sleep 30");
        app.idle_timeout = Some(Duration::from_millis(500));
        let m = LifecycleManager::new(hub_config(dir.path(), vec![app]));
        let pid = m.start("demo").await.unwrap().pid.unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;

        // Another operation holds the lock while the tick sees an idle app.
        let slot = m.slot("demo").unwrap().clone();
        let guard = slot.op.lock().await;
        let scheduler = crate::scheduler::IdleScheduler::new(m.clone());
        let tick = tokio::spawn(async move { scheduler.tick().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!tick.is_finished());

        m.touch_activity("demo").await.unwrap();
        drop(guard);

        assert!(tick.await.unwrap().is_empty());
        let st = m.status("demo").await.unwrap();
        assert_eq!(st.state, ProcessState::Running);
        assert_eq!(st.pid, Some(pid));
        assert!(pid_is_alive(pid));

        m.stop("demo").await.unwrap();
    }

    #[tokio::test]
    async fn early_exit_kills_backgrounded_children() {
        let dir = tempfile::tempdir().unwrap();
        let app = sh_app(dir.path(), "demo", "sleep 30 & echo $! > bg.pid; exit 3");
        let m = LifecycleManager::new(hub_config(dir.path(), vec![app]));

        let err = m.start("demo").await.unwrap_err();
        assert!(matches!(err, LifecycleError::Launch { .. }), "{err}");
        assert!(err.to_string().contains("code 3"), "{err}");

        let bg: u32 = std::fs::read_to_string(dir.path().join("bg.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(3);
        while pid_is_alive(bg) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!pid_is_alive(bg), "backgrounded child {bg} outlived the failed start");
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_start() {
        let dir = tempfile::tempdir().unwrap();
        let app = sh_app(dir.path(), "demo", "exec sleep 30");
        let mut cfg = hub_config(dir.path(), vec![app]);
        cfg.hub.startup_grace = Duration::from_secs(1);
        let m = LifecycleManager::new(cfg);

        let starting = tokio::spawn({
            let m = m.clone();
            async move { m.start("demo").await }
        });
        let st = wait_for_state(&m, "demo", ProcessState::Starting).await;
        assert_eq!(st.state, ProcessState::Starting);

        let stopping = tokio::spawn({
            let m = m.clone();
            async move { m.stop("demo").await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!stopping.is_finished());
        assert_eq!(m.status("demo").await.unwrap().state, ProcessState::Starting);

        let started = starting.await.unwrap().unwrap();
        assert_eq!(started.state, ProcessState::Running);
        let pid = started.pid.unwrap();

        let stopped = stopping.await.unwrap().unwrap();
        assert_eq!(stopped.state, ProcessState::Stopped);
        assert_eq!(stopped.pid, None);
        assert!(!pid_is_alive(pid));
    }

    #[derive(Debug, Default)]
    struct SlowLiveness {
        slow: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl ProcessProbe for SlowLiveness {
        fn is_alive(&self, pid: u32) -> bool {
            if self.slow.load(std::sync::atomic::Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(600));
            }
            pid_is_alive(pid)
        }

        async fn check_health(&self, _url: &str, _timeout: Duration) -> bool {
            true
        }

        async fn port_in_use(&self, _host: &str, _port: u16, _timeout: Duration) -> bool {
            false
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn liveness_check_does_not_hold_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let app = sh_app(dir.path(), "demo", "exec sleep 30");
        let liveness = Arc::new(SlowLiveness::default());
        let m = LifecycleManager::with_probe(hub_config(dir.path(), vec![app]), liveness.clone());
        m.start("demo").await.unwrap();

        liveness.slow.store(true, std::sync::atomic::Ordering::SeqCst);
        let status = tokio::spawn({
            let m = m.clone();
            async move { m.status("demo").await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let began = Instant::now();
        m.touch_activity("demo").await.unwrap();
        assert!(began.elapsed() < Duration::from_millis(300));

        assert_eq!(status.await.unwrap().unwrap().state, ProcessState::Running);
        liveness.slow.store(false, std::sync::atomic::Ordering::SeqCst);
        m.stop("demo").await.unwrap();
    }
}
