use futures_util::future::join_all;
use homehub_process::{AppSummary, HubInfo};

use crate::config::ManagedApp;
use crate::error::LifecycleError;
use crate::manager::LifecycleManager;

/// Read-only view combining configured metadata with live status.
#[derive(Debug, Clone)]
pub struct StatusAggregator {
    manager: LifecycleManager,
}

impl StatusAggregator {
    pub fn new(manager: LifecycleManager) -> Self {
        Self { manager }
    }

    pub fn hub_info(&self) -> HubInfo {
        let s = self.manager.settings();
        HubInfo {
            name: s.name.clone(),
            version: s.version.clone(),
            description: s.description.clone(),
        }
    }

    pub async fn list_apps(&self) -> Vec<AppSummary> {
        let summaries = join_all(self.manager.apps().map(|app| self.summary_of(app))).await;
        summaries
            .into_iter()
            .filter_map(|r| match r {
                Ok(v) => Some(v),
                Err(err) => {
                    tracing::warn!(error = %err, "status unavailable");
                    None
                }
            })
            .collect()
    }

    pub async fn summary(&self, app_id: &str) -> Result<AppSummary, LifecycleError> {
        let app = self.manager.app(app_id)?;
        self.summary_of(app).await
    }

    async fn summary_of(&self, app: &ManagedApp) -> Result<AppSummary, LifecycleError> {
        let status = self.manager.status(app.id.as_str()).await?;
        Ok(AppSummary {
            id: app.id.clone(),
            name: app.name.clone(),
            description: app.description.clone(),
            icon: app.icon.clone(),
            color: app.color.clone(),
            host: app.host.clone(),
            port: app.port,
            url: app.url(),
            idle_timeout_secs: self.manager.idle_timeout(app).as_secs(),
            status,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use homehub_process::ProcessState;

    use super::*;
    use crate::test_support::{hub_config, sh_app};

    #[tokio::test]
    async fn lists_every_app_in_config_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut notes = sh_app(dir.path(), "notes", "exec sleep 30");
        notes.name = "Notes".to_string();
        notes.icon = "📝".to_string();
        notes.host = "0.0.0.0".to_string();
        notes.idle_timeout = Some(Duration::from_secs(60));
        let expenses = sh_app(dir.path(), "expenses", "exec sleep 30");
        let m = LifecycleManager::new(hub_config(dir.path(), vec![expenses, notes]));
        let agg = StatusAggregator::new(m.clone());

        m.start("notes").await.unwrap();
        let apps = agg.list_apps().await;
        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0].id.as_str(), "expenses");
        assert_eq!(apps[0].status.state, ProcessState::Stopped);
        assert_eq!(apps[0].idle_timeout_secs, 600);

        let n = &apps[1];
        assert_eq!(n.name, "Notes");
        assert_eq!(n.icon, "📝");
        assert_eq!(n.status.state, ProcessState::Running);
        assert_eq!(n.idle_timeout_secs, 60);
        assert!(n.url.starts_with("http://127.0.0.1:"));

        m.stop("notes").await.unwrap();
    }

    #[tokio::test]
    async fn hub_info_comes_from_settings() {
        let dir = tempfile::tempdir().unwrap();
        let agg = StatusAggregator::new(LifecycleManager::new(hub_config(dir.path(), vec![])));
        let info = agg.hub_info();
        assert_eq!(info.name, "Test Hub");
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
        assert!(agg.list_apps().await.is_empty());
    }

    #[tokio::test]
    async fn summary_of_unknown_app_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let agg = StatusAggregator::new(LifecycleManager::new(hub_config(dir.path(), vec![])));
        let err = agg.summary("ghost").await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
