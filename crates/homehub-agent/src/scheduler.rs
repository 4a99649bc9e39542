use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures_util::future::join_all;
use homehub_process::{AppId, IdleEntry, ProcessState, SchedulerStatus};
use tokio::{sync::watch, task::JoinHandle};

use crate::manager::LifecycleManager;

/// Stops running apps that have seen no activity for longer than their idle
/// timeout.
#[derive(Debug, Clone)]
pub struct IdleScheduler {
    manager: LifecycleManager,
    interval: Duration,
    running: Arc<AtomicBool>,
}

pub struct IdleSchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl IdleSchedulerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            tracing::warn!(error = %err, "idle scheduler task ended abnormally");
        }
    }
}

impl IdleScheduler {
    pub fn new(manager: LifecycleManager) -> Self {
        let interval = manager.settings().check_interval;
        Self::with_interval(manager, interval)
    }

    pub fn with_interval(manager: LifecycleManager, interval: Duration) -> Self {
        Self {
            manager,
            interval,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn spawn(&self) -> IdleSchedulerHandle {
        let (tx, mut rx) = watch::channel(false);
        let this = self.clone();
        let task = tokio::spawn(async move {
            this.running.store(true, Ordering::SeqCst);
            tracing::info!(interval_secs = this.interval.as_secs(), "idle scheduler started");

            let mut ticker = tokio::time::interval(this.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.tick().await;
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }

            this.running.store(false, Ordering::SeqCst);
            tracing::info!("idle scheduler stopped");
        });
        IdleSchedulerHandle { shutdown: tx, task }
    }

    /// One pass over every app. Returns the ids that were stopped.
    pub async fn tick(&self) -> Vec<AppId> {
        let checks = self
            .manager
            .apps()
            .map(|app| self.check_app(app.id.clone()))
            .collect::<Vec<_>>();
        join_all(checks).await.into_iter().flatten().collect()
    }

    async fn check_app(&self, app_id: AppId) -> Option<AppId> {
        let snap = match self.manager.activity(app_id.as_str()).await {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(app_id = %app_id, error = %err, "idle check failed");
                return None;
            }
        };
        if snap.status.state != ProcessState::Running {
            return None;
        }
        let idle = snap.idle_for?;
        if idle <= snap.idle_timeout {
            return None;
        }

        // Activity or an operation may land before the op lock is ours; the
        // manager re-checks idleness under it.
        match self.manager.stop_if_idle(app_id.as_str()).await {
            Ok(Some(_)) => Some(app_id),
            Ok(None) => {
                tracing::debug!(app_id = %app_id, "no longer idle; left running");
                None
            }
            Err(err) => {
                tracing::warn!(app_id = %app_id, error = %err, "failed to stop idle app");
                None
            }
        }
    }

    pub async fn status(&self) -> SchedulerStatus {
        let snaps = join_all(
            self.manager
                .apps()
                .map(|app| self.manager.activity(app.id.as_str())),
        )
        .await;

        let apps = snaps
            .into_iter()
            .filter_map(Result::ok)
            .filter(|s| s.status.state == ProcessState::Running)
            .map(|s| {
                let idle_secs = s.idle_for.unwrap_or_default().as_secs();
                let timeout_secs = s.idle_timeout.as_secs();
                IdleEntry {
                    app_id: s.status.app_id,
                    last_activity_at: s.status.last_activity_at,
                    idle_secs,
                    timeout_secs,
                    secs_until_shutdown: timeout_secs.saturating_sub(idle_secs),
                }
            })
            .collect();

        SchedulerStatus {
            running: self.is_running(),
            check_interval_secs: self.interval.as_secs(),
            default_idle_timeout_secs: self.manager.settings().default_idle_timeout.as_secs(),
            apps,
        }
    }
}
