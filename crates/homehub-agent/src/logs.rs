use std::path::{Path, PathBuf};

use homehub_process::{AppId, LogStream};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

pub const DEFAULT_TAIL_LINES: usize = 100;
pub const MAX_TAIL_LINES: usize = 2000;
const TAIL_LIMIT_BYTES: u64 = 256 * 1024;

pub fn log_path(logs_dir: &Path, app_id: &AppId, stream: LogStream) -> PathBuf {
    logs_dir.join(format!("{}_{}.log", app_id, stream.as_str()))
}

/// Opens (appending) the redirection target for one of a child's output
/// streams and writes a launch marker so runs can be told apart.
pub(crate) async fn open_for_child(path: &Path, marker: &str) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut f = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    f.write_all(marker.as_bytes()).await?;
    f.flush().await?;
    Ok(f.into_std().await)
}

pub(crate) fn launch_marker(app_id: &AppId, command_line: &str, cwd: &Path) -> String {
    format!(
        "\n[homehub] {} starting {}: {} (cwd {})\n",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        app_id,
        command_line,
        cwd.display()
    )
}

fn split_lines_from_tail(buf: &[u8], max_lines: usize, partial_head: bool) -> Vec<String> {
    // Best-effort UTF-8: invalid sequences become U+FFFD.
    let text = String::from_utf8_lossy(buf);
    let mut out: Vec<String> = text.lines().map(|l| l.to_string()).collect();

    // The first line is cut if we started reading mid-file.
    if partial_head && !out.is_empty() {
        out.remove(0);
    }
    if out.len() > max_lines {
        out.drain(0..(out.len() - max_lines));
    }
    out
}

/// Returns up to `max_lines` trailing lines and the file size. A missing file
/// is an empty log.
pub async fn tail(path: &Path, max_lines: usize, limit_bytes: u64) -> std::io::Result<(Vec<String>, u64)> {
    let mut f = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(err) => return Err(err),
    };
    let size = f.metadata().await?.len();
    let start = size.saturating_sub(limit_bytes);
    f.seek(std::io::SeekFrom::Start(start)).await?;

    let mut buf = Vec::with_capacity((size - start) as usize);
    f.read_to_end(&mut buf).await?;

    Ok((split_lines_from_tail(&buf, max_lines, start > 0), size))
}

pub(crate) async fn tail_default(path: &Path, max_lines: usize) -> std::io::Result<(Vec<String>, u64)> {
    tail(path, max_lines.clamp(1, MAX_TAIL_LINES), TAIL_LIMIT_BYTES).await
}
