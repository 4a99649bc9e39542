use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    time::Duration,
};

use homehub_process::AppId;

pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 15 * 60;
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 60;
const DEFAULT_STARTUP_GRACE_MS: u64 = 2000;
const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_HEALTH_TIMEOUT_MS: u64 = 2000;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5000;
const DEFAULT_RESTART_PAUSE_MS: u64 = 1000;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_ICON: &str = "📦";
const DEFAULT_COLOR: &str = "#607D8B";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("hub: {0}")]
    InvalidHub(String),
    #[error("app `{app_id}`: {message}")]
    InvalidApp { app_id: String, message: String },
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    hub: RawHub,
    #[serde(default)]
    apps: BTreeMap<String, RawApp>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawHub {
    name: Option<String>,
    version: Option<String>,
    description: Option<String>,
    default_idle_timeout_secs: Option<u64>,
    check_interval_secs: Option<u64>,
    startup_grace_ms: Option<u64>,
    startup_timeout_ms: Option<u64>,
    health_timeout_ms: Option<u64>,
    shutdown_grace_ms: Option<u64>,
    restart_pause_ms: Option<u64>,
    logs_dir: Option<PathBuf>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct RawApp {
    name: Option<String>,
    description: Option<String>,
    icon: Option<String>,
    color: Option<String>,
    path: PathBuf,
    command: Vec<String>,
    entry: Option<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    host: Option<String>,
    port: u16,
    health_path: Option<String>,
    idle_timeout_secs: Option<u64>,
}

/// Process-wide settings shared by every managed app.
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub name: String,
    pub version: String,
    pub description: String,
    pub default_idle_timeout: Duration,
    pub check_interval: Duration,
    /// Minimum time a fresh child must stay alive before it can be `running`.
    pub startup_grace: Duration,
    /// Upper bound for the whole start sequence, health polling included.
    pub startup_timeout: Duration,
    /// Per-request timeout of a single health probe.
    pub health_timeout: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub shutdown_grace: Duration,
    pub restart_pause: Duration,
    pub logs_dir: PathBuf,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            name: "Home Server Hub".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: "Central management for home server applications".to_string(),
            default_idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            check_interval: Duration::from_secs(DEFAULT_CHECK_INTERVAL_SECS),
            startup_grace: Duration::from_millis(DEFAULT_STARTUP_GRACE_MS),
            startup_timeout: Duration::from_millis(DEFAULT_STARTUP_TIMEOUT_MS),
            health_timeout: Duration::from_millis(DEFAULT_HEALTH_TIMEOUT_MS),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
            restart_pause: Duration::from_millis(DEFAULT_RESTART_PAUSE_MS),
            logs_dir: PathBuf::from("logs"),
        }
    }
}

/// A sibling application the hub can start, stop and monitor.
#[derive(Debug, Clone)]
pub struct ManagedApp {
    pub id: AppId,
    pub name: String,
    pub description: String,
    pub icon: String,
    pub color: String,
    pub working_dir: PathBuf,
    pub program: String,
    /// May contain `{host}` and `{port}` placeholders.
    pub args: Vec<String>,
    pub entry: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub host: String,
    pub port: u16,
    pub health_path: Option<String>,
    pub idle_timeout: Option<Duration>,
}

impl ManagedApp {
    pub fn new(
        id: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        program: impl Into<String>,
        args: Vec<String>,
        port: u16,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: AppId(id),
            description: String::new(),
            icon: DEFAULT_ICON.to_string(),
            color: DEFAULT_COLOR.to_string(),
            working_dir: working_dir.into(),
            program: program.into(),
            args,
            entry: None,
            env: BTreeMap::new(),
            host: DEFAULT_HOST.to_string(),
            port,
            health_path: None,
            idle_timeout: None,
        }
    }

    pub fn idle_timeout_or(&self, default: Duration) -> Duration {
        self.idle_timeout.unwrap_or(default)
    }

    pub fn launch_args(&self) -> Vec<String> {
        let port = self.port.to_string();
        self.args
            .iter()
            .map(|a| a.replace("{host}", &self.host).replace("{port}", &port))
            .collect()
    }

    /// Host to connect to when probing; wildcard binds are reached via loopback.
    pub fn probe_host(&self) -> &str {
        match self.host.as_str() {
            "0.0.0.0" | "" => "127.0.0.1",
            "::" => "::1",
            h => h,
        }
    }

    pub fn url(&self) -> String {
        let host = self.probe_host();
        if host.contains(':') {
            format!("http://[{host}]:{}", self.port)
        } else {
            format!("http://{host}:{}", self.port)
        }
    }

    pub fn health_url(&self) -> Option<String> {
        self.health_path
            .as_deref()
            .map(|p| format!("{}{}", self.url(), p))
    }

    /// Program path to execute. Relative paths with a separator resolve
    /// inside the working directory; bare names go through `PATH`.
    pub fn resolved_program(&self) -> PathBuf {
        let p = Path::new(&self.program);
        if p.is_relative() && p.components().count() > 1 {
            self.working_dir.join(p)
        } else {
            p.to_path_buf()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HubConfig {
    pub hub: HubSettings,
    pub apps: Vec<ManagedApp>,
}

impl HubConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Self::from_yaml_str(&raw, base)
    }

    /// Parses and validates a config document; relative paths resolve against `base_dir`.
    pub fn from_yaml_str(raw: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        let parsed: RawConfig = serde_yaml::from_str(raw)?;
        let hub = build_hub(parsed.hub, base_dir)?;

        let mut apps = Vec::with_capacity(parsed.apps.len());
        for (id, raw_app) in parsed.apps {
            apps.push(build_app(id, raw_app, base_dir)?);
        }

        Ok(Self { hub, apps })
    }

    /// Pairs of apps configured with the same port. Allowed; whichever of
    /// the two starts second gets a port conflict.
    pub fn shared_ports(&self) -> Vec<(u16, AppId, AppId)> {
        let mut seen: HashMap<u16, &AppId> = HashMap::new();
        let mut out = Vec::new();
        for app in &self.apps {
            if let Some(other) = seen.insert(app.port, &app.id) {
                out.push((app.port, other.clone(), app.id.clone()));
            }
        }
        out
    }

    pub fn warn_on_shared_ports(&self) {
        for (port, first, second) in self.shared_ports() {
            tracing::warn!(port, app_id = %second, other = %first, "two apps are configured with the same port");
        }
    }
}

fn build_hub(raw: RawHub, base_dir: &Path) -> Result<HubSettings, ConfigError> {
    let defaults = HubSettings::default();
    let secs = |v: Option<u64>, d: Duration| v.map(Duration::from_secs).unwrap_or(d);
    let millis = |v: Option<u64>, d: Duration| v.map(Duration::from_millis).unwrap_or(d);

    let hub = HubSettings {
        name: raw.name.unwrap_or(defaults.name),
        version: raw.version.unwrap_or(defaults.version),
        description: raw.description.unwrap_or(defaults.description),
        default_idle_timeout: secs(raw.default_idle_timeout_secs, defaults.default_idle_timeout),
        check_interval: secs(raw.check_interval_secs, defaults.check_interval),
        startup_grace: millis(raw.startup_grace_ms, defaults.startup_grace),
        startup_timeout: millis(raw.startup_timeout_ms, defaults.startup_timeout),
        health_timeout: millis(raw.health_timeout_ms, defaults.health_timeout),
        shutdown_grace: millis(raw.shutdown_grace_ms, defaults.shutdown_grace),
        restart_pause: millis(raw.restart_pause_ms, defaults.restart_pause),
        logs_dir: base_dir.join(raw.logs_dir.unwrap_or(defaults.logs_dir)),
    };

    if hub.default_idle_timeout.is_zero() {
        return Err(ConfigError::InvalidHub(
            "default_idle_timeout_secs must be > 0".to_string(),
        ));
    }
    if hub.check_interval.is_zero() {
        return Err(ConfigError::InvalidHub(
            "check_interval_secs must be > 0".to_string(),
        ));
    }
    if hub.health_timeout.is_zero() {
        return Err(ConfigError::InvalidHub(
            "health_timeout_ms must be > 0".to_string(),
        ));
    }
    if hub.startup_timeout < hub.startup_grace {
        return Err(ConfigError::InvalidHub(format!(
            "startup_timeout_ms ({}) must be >= startup_grace_ms ({})",
            hub.startup_timeout.as_millis(),
            hub.startup_grace.as_millis()
        )));
    }
    Ok(hub)
}

fn valid_app_id(id: &str) -> bool {
    // Ids end up in log file names.
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn build_app(id: String, raw: RawApp, base_dir: &Path) -> Result<ManagedApp, ConfigError> {
    let invalid = |message: &str| ConfigError::InvalidApp {
        app_id: id.clone(),
        message: message.to_string(),
    };

    if !valid_app_id(&id) {
        return Err(invalid("id must be non-empty and use only [A-Za-z0-9_-]"));
    }
    let mut command = raw.command.into_iter();
    let Some(program) = command.next().filter(|p| !p.trim().is_empty()) else {
        return Err(invalid("command must name a program"));
    };
    if raw.port == 0 {
        return Err(invalid("port must be > 0"));
    }
    if let Some(p) = &raw.health_path
        && !p.starts_with('/')
    {
        return Err(invalid("health_path must start with '/'"));
    }
    if raw.idle_timeout_secs == Some(0) {
        return Err(invalid("idle_timeout_secs must be > 0"));
    }

    Ok(ManagedApp {
        name: raw.name.unwrap_or_else(|| id.clone()),
        id: AppId(id),
        description: raw.description.unwrap_or_default(),
        icon: raw.icon.unwrap_or_else(|| DEFAULT_ICON.to_string()),
        color: raw.color.unwrap_or_else(|| DEFAULT_COLOR.to_string()),
        working_dir: base_dir.join(raw.path),
        program,
        args: command.collect(),
        entry: raw.entry,
        env: raw.env,
        host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
        port: raw.port,
        health_path: raw.health_path,
        idle_timeout: raw.idle_timeout_secs.map(Duration::from_secs),
    })
}
