//! Fallback log tailer.
//!
//! Some server configurations write only to their rotating log file and not
//! to stdout. A third reader task tails the instance's `logs/` directory and
//! feeds the same output queue as the stream readers, preserving file order.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use hycon_core::ConsoleSource;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;

pub(crate) const TAIL_POLL: Duration = Duration::from_millis(200);
/// Files already larger than this at first open are tailed from the end so a
/// fresh viewer is not flooded with history.
pub(crate) const TAIL_SKIP_BYTES: u64 = 256 * 1024;
pub const PREFERRED_LOG: &str = "latest.log";

struct OpenLog {
    path: PathBuf,
    reader: BufReader<File>,
    /// Bytes consumed so far; used to detect truncation.
    pos: u64,
    /// Partial line seen at EOF, completed on a later poll.
    carry: String,
}

/// The file to tail: the fixed preferred name when present, otherwise the
/// most recently modified `*.log`.
async fn pick_log_file(logs_dir: &Path) -> Option<PathBuf> {
    let preferred = logs_dir.join(PREFERRED_LOG);
    if tokio::fs::metadata(&preferred)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
    {
        return Some(preferred);
    }

    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    let mut rd = tokio::fs::read_dir(logs_dir).await.ok()?;
    while let Ok(Some(entry)) = rd.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let modified = meta
            .modified()
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        if newest.as_ref().map(|(m, _)| modified > *m).unwrap_or(true) {
            newest = Some((modified, path));
        }
    }
    newest.map(|(_, p)| p)
}

async fn open_log(
    path: &Path,
    tx: &mpsc::UnboundedSender<(ConsoleSource, String)>,
) -> std::io::Result<OpenLog> {
    let file = File::open(path).await?;
    let len = file.metadata().await?.len();
    let mut reader = BufReader::new(file);
    let mut pos = 0;
    if len > TAIL_SKIP_BYTES {
        reader.seek(std::io::SeekFrom::Start(len)).await?;
        pos = len;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        let _ = tx.send((
            ConsoleSource::System,
            format!("[hycon] tailing {name} from current end ({len} bytes of history skipped)"),
        ));
    }
    Ok(OpenLog {
        path: path.to_path_buf(),
        reader,
        pos,
        carry: String::new(),
    })
}

/// Drain newly appended complete lines. Err means the receiver is gone.
async fn read_new_lines(
    open: &mut OpenLog,
    tx: &mpsc::UnboundedSender<(ConsoleSource, String)>,
) -> Result<(), ()> {
    loop {
        let mut chunk = String::new();
        match open.reader.read_line(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                open.pos += n as u64;
                if chunk.ends_with('\n') {
                    let mut line = std::mem::take(&mut open.carry);
                    line.push_str(chunk.trim_end_matches(['\n', '\r']));
                    if tx.send((ConsoleSource::LogFile, line)).is_err() {
                        return Err(());
                    }
                } else {
                    open.carry.push_str(&chunk);
                }
            }
            Err(_) => break,
        }
    }
    Ok(())
}

pub(crate) async fn run_log_tailer(
    logs_dir: PathBuf,
    tx: mpsc::UnboundedSender<(ConsoleSource, String)>,
    alive: Arc<AtomicBool>,
) {
    let mut open: Option<OpenLog> = None;

    while alive.load(Ordering::Relaxed) {
        let newest = pick_log_file(&logs_dir).await;

        // Rotation: the open handle no longer matches the newest file.
        if let Some(o) = &open {
            let rotated = newest.as_ref() != Some(&o.path);
            let truncated = !rotated
                && tokio::fs::metadata(&o.path)
                    .await
                    .map(|m| m.len() < o.pos)
                    .unwrap_or(true);
            if rotated || truncated {
                open = None;
            }
        }

        if open.is_none()
            && let Some(path) = &newest
            && let Ok(o) = open_log(path, &tx).await
        {
            open = Some(o);
        }

        if let Some(o) = &mut open
            && read_new_lines(o, &tx).await.is_err()
        {
            return;
        }

        tokio::time::sleep(TAIL_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    async fn recv_line(
        rx: &mut mpsc::UnboundedReceiver<(ConsoleSource, String)>,
    ) -> (ConsoleSource, String) {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for tailed line")
            .expect("tailer channel closed")
    }

    #[tokio::test]
    async fn follows_appends_and_switches_on_rotation() {
        let tmp = tempfile::tempdir().unwrap();
        let logs = tmp.path().to_path_buf();
        let first = logs.join("server-2026-01-01.log");
        std::fs::write(&first, "a1\na2\n").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        let handle = tokio::spawn(run_log_tailer(logs.clone(), tx, alive.clone()));

        assert_eq!(recv_line(&mut rx).await.1, "a1");
        assert_eq!(recv_line(&mut rx).await.1, "a2");

        // Append to the same file.
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&first).unwrap();
            writeln!(f, "a3").unwrap();
        }
        assert_eq!(recv_line(&mut rx).await.1, "a3");

        // Rotation: the preferred name appears; only its lines follow, with
        // no replay of the previous file.
        std::fs::write(logs.join(PREFERRED_LOG), "b1\n").unwrap();
        let (source, line) = recv_line(&mut rx).await;
        assert_eq!(source, ConsoleSource::LogFile);
        assert_eq!(line, "b1");

        alive.store(false, Ordering::Relaxed);
        handle.await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn large_existing_file_is_tailed_from_the_end() {
        let tmp = tempfile::tempdir().unwrap();
        let logs = tmp.path().to_path_buf();
        let path = logs.join(PREFERRED_LOG);

        let mut history = String::new();
        while (history.len() as u64) <= TAIL_SKIP_BYTES {
            history.push_str("old history line\n");
        }
        std::fs::write(&path, history).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        let handle = tokio::spawn(run_log_tailer(logs, tx, alive.clone()));

        let (source, notice) = recv_line(&mut rx).await;
        assert_eq!(source, ConsoleSource::System);
        assert!(notice.contains("history skipped"));

        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(f, "fresh line").unwrap();
        }
        let (source, line) = recv_line(&mut rx).await;
        assert_eq!(source, ConsoleSource::LogFile);
        assert_eq!(line, "fresh line");

        alive.store(false, Ordering::Relaxed);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn waits_for_a_log_dir_to_appear() {
        let tmp = tempfile::tempdir().unwrap();
        let logs = tmp.path().join("logs");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        let handle = tokio::spawn(run_log_tailer(logs.clone(), tx, alive.clone()));

        tokio::time::sleep(Duration::from_millis(500)).await;
        std::fs::create_dir_all(&logs).unwrap();
        std::fs::write(logs.join(PREFERRED_LOG), "late\n").unwrap();

        assert_eq!(recv_line(&mut rx).await.1, "late");

        alive.store(false, Ordering::Relaxed);
        handle.await.unwrap();
    }
}
