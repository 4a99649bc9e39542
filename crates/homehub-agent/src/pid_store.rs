//! Last-known PID of each managed app, kept in `.homehub-<id>.pid` inside the
//! app's working directory so a restarted hub (or an operator) can find it.
//! Keyed by id so apps sharing a directory never see each other's process.
//!
//! The file is advisory. Anything unreadable loads as "no process".

use std::path::PathBuf;

use tokio::io::AsyncWriteExt;

use crate::config::ManagedApp;

const PID_FILE_PREFIX: &str = ".homehub-";

pub fn file_name(app: &ManagedApp) -> String {
    format!("{PID_FILE_PREFIX}{}.pid", app.id)
}

pub fn path_for(app: &ManagedApp) -> PathBuf {
    app.working_dir.join(file_name(app))
}

pub async fn load(app: &ManagedApp) -> Option<u32> {
    let path = path_for(app);
    let raw = match tokio::fs::read_to_string(&path).await {
        Ok(v) => v,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            tracing::warn!(app_id = %app.id, path = %path.display(), error = %err, "unreadable pid file");
            return None;
        }
    };

    match raw.trim().parse::<u32>() {
        Ok(pid) if pid > 0 => Some(pid),
        _ => {
            tracing::warn!(app_id = %app.id, path = %path.display(), "corrupt pid file; removing");
            let _ = tokio::fs::remove_file(&path).await;
            None
        }
    }
}

pub async fn save(app: &ManagedApp, pid: u32) -> std::io::Result<()> {
    let path = path_for(app);
    let tmp = app.working_dir.join(format!("{}.tmp", file_name(app)));
    let mut f = tokio::fs::File::create(&tmp).await?;
    f.write_all(pid.to_string().as_bytes()).await?;
    f.flush().await?;
    drop(f);
    tokio::fs::rename(&tmp, &path).await
}

pub async fn clear(app: &ManagedApp) {
    let path = path_for(app);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(app_id = %app.id, path = %path.display(), error = %err, "failed to remove pid file");
        }
    }
}
