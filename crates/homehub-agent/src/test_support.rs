use std::{path::Path, time::Duration};

use crate::config::{HubConfig, HubSettings, ManagedApp};

/// Short timeouts so lifecycle tests finish in a few seconds.
pub(crate) fn settings(dir: &Path) -> HubSettings {
    HubSettings {
        name: "Test Hub".to_string(),
        default_idle_timeout: Duration::from_secs(600),
        check_interval: Duration::from_secs(1),
        startup_grace: Duration::from_millis(300),
        startup_timeout: Duration::from_secs(3),
        health_timeout: Duration::from_millis(500),
        shutdown_grace: Duration::from_secs(1),
        restart_pause: Duration::from_millis(50),
        logs_dir: dir.join("logs"),
        ..HubSettings::default()
    }
}

pub(crate) fn hub_config(dir: &Path, apps: Vec<ManagedApp>) -> HubConfig {
    HubConfig {
        hub: settings(dir),
        apps,
    }
}

pub(crate) fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    listener.local_addr().unwrap().port()
}

/// An app whose process is `/bin/sh -c <script>` running in `dir`.
pub(crate) fn sh_app(dir: &Path, id: &str, script: &str) -> ManagedApp {
    ManagedApp::new(
        id,
        dir,
        "/bin/sh",
        vec!["-c".to_string(), script.to_string()],
        free_port(),
    )
}
