use std::time::Duration;

/// OS-facing liveness checks used by the lifecycle manager.
///
/// Implementations hold no per-app state and must be safe to call
/// concurrently for different apps.
#[async_trait::async_trait]
pub trait ProcessProbe: Send + Sync + std::fmt::Debug {
    /// Whether the OS reports a live (non-zombie) process for `pid`.
    fn is_alive(&self, pid: u32) -> bool;

    /// Bounded HTTP GET; only a 2xx answer counts as healthy.
    async fn check_health(&self, url: &str, timeout: Duration) -> bool;

    /// Whether something accepts TCP connections on `host:port`.
    async fn port_in_use(&self, host: &str, port: u16, timeout: Duration) -> bool;
}

#[derive(Debug, Clone)]
pub struct OsProbe {
    client: reqwest::Client,
}

impl OsProbe {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("homehub/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

impl Default for OsProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ProcessProbe for OsProbe {
    fn is_alive(&self, pid: u32) -> bool {
        pid_is_alive(pid)
    }

    async fn check_health(&self, url: &str, timeout: Duration) -> bool {
        match self.client.get(url).timeout(timeout).send().await {
            Ok(resp) => {
                let ok = resp.status().is_success();
                if !ok {
                    tracing::debug!(%url, status = %resp.status(), "health check returned non-2xx");
                }
                ok
            }
            Err(err) => {
                tracing::debug!(%url, error = %err, "health check failed");
                false
            }
        }
    }

    async fn port_in_use(&self, host: &str, port: u16, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host, port))).await,
            Ok(Ok(_))
        )
    }
}

#[cfg(unix)]
pub fn pid_is_alive(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }

    let rc = unsafe { libc::kill(raw, 0) };
    if rc != 0 {
        // EPERM: the process exists but belongs to another user.
        return std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    }
    !is_zombie(pid)
}

#[cfg(not(unix))]
pub fn pid_is_alive(_pid: u32) -> bool {
    false
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // The command name is parenthesized and may contain spaces.
    let Some(end) = stat.rfind(')') else {
        return false;
    };
    matches!(
        stat.get(end + 1..).and_then(|rest| rest.split_whitespace().next()),
        Some("Z") | Some("X")
    )
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}
