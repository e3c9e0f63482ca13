//! Process supervisor: owns the per-instance process handle and registry.
//!
//! All registry mutation funnels through `start`, `stop` and the lazy exit
//! cleanup in `is_running`. Liveness is strictly poll-based; there is no
//! push notification of exit. The externally visible status label
//! (offline/starting/online/stopping) is owned by the caller, which must
//! pair every `start`/`stop` with a label update.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use hycon_core::{AuthState, ConsoleLine, ConsoleSource, InstanceId, InstanceStatus};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

use crate::auth::AuthMachine;
use crate::buffer::{ConsoleBuffer, MAX_CONSOLE_LINES};
use crate::console::{self, AuthSnapshot, MonitorContext};
use crate::launch::{self, RunInfo};
use crate::paths;
use crate::publish::Publisher;
use crate::settings::StartupSettings;
use crate::store::AuthRecords;
use crate::tail;

/// Graceful shutdown command understood by the server.
pub const STOP_COMMAND: &str = "/stop";

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

/// How long the graceful `/stop` gets before SIGTERM.
fn stop_grace() -> Duration {
    Duration::from_secs(
        env_u64("HYCON_STOP_GRACE_SECS")
            .map(|v| v.clamp(1, 300))
            .unwrap_or(10),
    )
}

/// How long SIGTERM gets before SIGKILL.
fn kill_grace() -> Duration {
    Duration::from_secs(
        env_u64("HYCON_KILL_GRACE_SECS")
            .map(|v| v.clamp(1, 60))
            .unwrap_or(5),
    )
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the agent dies, make sure the server is terminated too.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn signal_group(pgid: Option<i32>, signal: libc::c_int) {
    if let Some(pgid) = pgid {
        unsafe {
            libc::kill(-pgid, signal);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: Option<i32>, _signal: i32) {}

fn spawn_stream_reader<R>(
    stream: R,
    source: ConsoleSource,
    tx: mpsc::UnboundedSender<(ConsoleSource, String)>,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send((source, line)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send((
                        ConsoleSource::System,
                        format!("[hycon] {} read error: {e}", source.as_str()),
                    ));
                    break;
                }
            }
        }
    });
}

struct Instance {
    child: Child,
    pid: Option<u32>,
    pgid: Option<i32>,
    stdin: Option<ChildStdin>,
    buffer: Arc<Mutex<ConsoleBuffer>>,
    snapshot: Arc<std::sync::Mutex<AuthSnapshot>>,
    /// Cleared on stop/exit-discovery so the monitor and tailer unwind.
    alive: Arc<AtomicBool>,
    display_name: String,
}

/// Registry of running instances. Cloning is cheap; all clones share state.
#[derive(Clone)]
pub struct ServerManager {
    data_root: PathBuf,
    inner: Arc<Mutex<HashMap<InstanceId, Instance>>>,
    publisher: Publisher,
    records: Arc<dyn AuthRecords>,
}

impl ServerManager {
    pub fn new(data_root: PathBuf, publisher: Publisher, records: Arc<dyn AuthRecords>) -> Self {
        Self {
            data_root,
            inner: Arc::new(Mutex::new(HashMap::new())),
            publisher,
            records,
        }
    }

    pub fn instance_dir(&self, id: InstanceId) -> PathBuf {
        paths::instance_dir(&self.data_root, id)
    }

    /// Spawn the server process for `id` and wire up its supervision tasks.
    ///
    /// Fails without side effects when the instance is already running or the
    /// server files are missing.
    pub async fn start(
        &self,
        id: InstanceId,
        port: u16,
        custom_args: &str,
        display_name: &str,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.contains_key(&id) {
            anyhow::bail!("instance {id} is already running");
        }

        let dir = self.instance_dir(id);
        let settings = StartupSettings::load(&dir).await;
        let plan = launch::build_launch_plan(&dir, &settings, custom_args, port)?;

        let mut cmd = Command::new(&plan.exec);
        cmd.args(&plan.args)
            .current_dir(&dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        for (key, value) in &plan.env {
            cmd.env(key, value);
        }

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    // New session so the whole process tree can be signalled.
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn `{}` (cwd {})", plan.command_line(), dir.display()))?;
        let pid = child.id();
        let pgid = pid.map(|p| p as i32);

        let started_at_unix_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let run = RunInfo {
            instance_id: id.0,
            display_name: display_name.to_string(),
            started_at_unix_ms,
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            pid,
            exec: plan.exec.clone(),
            args: plan.args.clone(),
            port,
        };
        if let Err(e) = launch::write_run_json(&dir, &run).await {
            tracing::warn!(instance = %id, error = %e, "failed to write run.json");
        }

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let buffer = Arc::new(Mutex::new(ConsoleBuffer::new(MAX_CONSOLE_LINES)));
        let alive = Arc::new(AtomicBool::new(true));
        let (line_tx, line_rx) = mpsc::unbounded_channel();

        let _ = line_tx.send((
            ConsoleSource::System,
            format!("[hycon] started {display_name} (pid {pid:?}) on port {port}"),
        ));

        if let Some(out) = stdout {
            spawn_stream_reader(out, ConsoleSource::Stdout, line_tx.clone());
        }
        if let Some(err) = stderr {
            spawn_stream_reader(err, ConsoleSource::Stderr, line_tx.clone());
        }
        tokio::spawn(tail::run_log_tailer(
            paths::logs_dir(&dir),
            line_tx,
            alive.clone(),
        ));

        // Automatic commands from the monitor re-enter the command channel.
        let (auto_tx, mut auto_rx) = mpsc::unbounded_channel::<String>();
        {
            let manager = self.clone();
            tokio::spawn(async move {
                while let Some(command) = auto_rx.recv().await {
                    if let Err(e) = manager.send_command(id, &command).await {
                        tracing::warn!(instance = %id, error = %e, "automatic command failed");
                    }
                }
            });
        }

        let auth = match paths::find_credential_artifact(&dir) {
            Some(path) => {
                tracing::info!(instance = %id, path = %path.display(), "persisted credentials found, skipping login flow");
                if let Err(e) = self.records.mark_authenticated(id, &path).await {
                    tracing::warn!(instance = %id, error = %e, "failed to record authentication");
                }
                AuthMachine::already_authenticated()
            }
            None => AuthMachine::new(),
        };
        let snapshot = Arc::new(std::sync::Mutex::new(AuthSnapshot {
            state: auth.state(),
            verified: auth.verified(),
        }));

        tokio::spawn(console::run_monitor(
            MonitorContext {
                id,
                instance_dir: dir,
                buffer: buffer.clone(),
                publisher: self.publisher.clone(),
                records: self.records.clone(),
                commands: auto_tx,
                auth,
                snapshot: snapshot.clone(),
                alive: alive.clone(),
            },
            line_rx,
        ));

        inner.insert(
            id,
            Instance {
                child,
                pid,
                pgid,
                stdin,
                buffer,
                snapshot,
                alive,
                display_name: display_name.to_string(),
            },
        );

        tracing::info!(instance = %id, pid = ?pid, port, "instance started");
        Ok(())
    }

    /// Graceful stop with bounded escalation: `/stop` -> SIGTERM -> SIGKILL.
    /// The registry entry is always removed on success, even when the kill
    /// path was needed.
    pub async fn stop(&self, id: InstanceId) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.lock().await;
            let entry = inner
                .get_mut(&id)
                .ok_or_else(|| anyhow::anyhow!("instance {id} is not running"))?;
            if let Some(stdin) = entry.stdin.as_mut() {
                // Best effort; the process may already be gone.
                let _ = stdin.write_all(format!("{STOP_COMMAND}\n").as_bytes()).await;
                let _ = stdin.flush().await;
            }
        }
        tracing::info!(instance = %id, "stop requested");

        let term_deadline = Instant::now() + stop_grace();
        let mut term_sent = false;
        let mut kill_sent = false;
        let mut final_deadline: Option<Instant> = None;

        loop {
            {
                let mut inner = self.inner.lock().await;
                let (exited, pgid) = {
                    let Some(entry) = inner.get_mut(&id) else {
                        // Reaped concurrently (is_running poll); nothing left.
                        return Ok(());
                    };
                    (!matches!(entry.child.try_wait(), Ok(None)), entry.pgid)
                };

                if exited {
                    if let Some(removed) = inner.remove(&id) {
                        removed.alive.store(false, Ordering::Relaxed);
                        tracing::info!(instance = %id, name = %removed.display_name, "instance stopped");
                    }
                    return Ok(());
                }

                let now = Instant::now();
                if !term_sent && now >= term_deadline {
                    signal_group(pgid, libc::SIGTERM);
                    term_sent = true;
                    final_deadline = Some(now + kill_grace());
                    tracing::warn!(instance = %id, "graceful stop timed out, sent SIGTERM");
                }
                if let Some(deadline) = final_deadline
                    && !kill_sent
                    && now >= deadline
                {
                    signal_group(pgid, libc::SIGKILL);
                    if let Some(entry) = inner.get_mut(&id) {
                        let _ = entry.child.start_kill();
                    }
                    kill_sent = true;
                    final_deadline = Some(now + Duration::from_secs(2));
                    tracing::warn!(instance = %id, "sent SIGKILL");
                }
                if kill_sent
                    && let Some(deadline) = final_deadline
                    && now >= deadline
                {
                    // Exit never confirmed; do not leave the caller blocked.
                    if let Some(removed) = inner.remove(&id) {
                        removed.alive.store(false, Ordering::Relaxed);
                    }
                    tracing::error!(instance = %id, "kill not confirmed, instance record dropped");
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Non-blocking liveness poll. Discovering an exit removes the registry
    /// entry as a side effect, so callers must tolerate a running ->
    /// not-running transition at query time.
    pub async fn is_running(&self, id: InstanceId) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.get_mut(&id) else {
            return false;
        };
        match entry.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::info!(instance = %id, code = ?status.code(), "instance exit discovered");
                if let Some(removed) = inner.remove(&id) {
                    removed.alive.store(false, Ordering::Relaxed);
                }
                false
            }
            Err(e) => {
                tracing::warn!(instance = %id, error = %e, "liveness poll failed, dropping instance");
                if let Some(removed) = inner.remove(&id) {
                    removed.alive.store(false, Ordering::Relaxed);
                }
                false
            }
        }
    }

    /// The command channel: write one line into the process's stdin.
    ///
    /// The sole contract for externally controlling a running instance; both
    /// operator and automatic commands pass through here. Callers serialize
    /// logically ordered commands themselves.
    pub async fn send_command(&self, id: InstanceId, command: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("instance {id} is not running"))?;
        if !matches!(entry.child.try_wait(), Ok(None)) {
            anyhow::bail!("instance {id} has exited");
        }
        let stdin = entry
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("stdin is closed for instance {id}"))?;
        stdin
            .write_all(format!("{command}\n").as_bytes())
            .await
            .with_context(|| format!("write command to instance {id}"))?;
        stdin
            .flush()
            .await
            .with_context(|| format!("flush command to instance {id}"))?;
        Ok(())
    }

    /// Cursor-sequenced scrollback read; `cursor == 0` returns the most
    /// recent `limit` lines for a newly joining viewer.
    pub async fn console_tail(
        &self,
        id: InstanceId,
        cursor: u64,
        limit: usize,
    ) -> anyhow::Result<(Vec<ConsoleLine>, u64)> {
        let buffer = {
            let inner = self.inner.lock().await;
            inner
                .get(&id)
                .ok_or_else(|| anyhow::anyhow!("instance {id} is not running"))?
                .buffer
                .clone()
        };
        let guard = buffer.lock().await;
        Ok(guard.tail_after(cursor, limit))
    }

    /// Combined snapshot so callers can resynchronize their status label.
    pub async fn status(&self, id: InstanceId) -> Option<InstanceStatus> {
        let mut inner = self.inner.lock().await;
        let entry = inner.get_mut(&id)?;
        let running = matches!(entry.child.try_wait(), Ok(None));
        let snap = entry
            .snapshot
            .lock()
            .map(|s| *s)
            .unwrap_or(AuthSnapshot {
                state: AuthState::Unauthenticated,
                verified: false,
            });
        Some(InstanceStatus {
            id,
            pid: entry.pid,
            running,
            auth: snap.state,
            persistence_verified: snap.verified,
        })
    }

    pub async fn instance_ids(&self) -> Vec<InstanceId> {
        let inner = self.inner.lock().await;
        let mut ids: Vec<InstanceId> = inner.keys().copied().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NullAuthRecords;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    const ECHO_SERVER: &str = r#"#!/bin/sh
while IFS= read -r line; do
  printf '%s\n' "$line" >> stdin_capture.txt
  printf 'recv:%s\n' "$line"
  if [ "$line" = "/stop" ]; then
    exit 0
  fi
done
"#;

    fn make_manager(root: &Path) -> ServerManager {
        ServerManager::new(
            root.to_path_buf(),
            Publisher::new(64),
            Arc::new(NullAuthRecords),
        )
    }

    fn prepare_instance(root: &Path, id: InstanceId) -> PathBuf {
        let dir = paths::instance_dir(root, id);
        std::fs::create_dir_all(paths::logs_dir(&dir)).unwrap();
        std::fs::write(dir.join(paths::SERVER_JAR), b"jar").unwrap();
        std::fs::write(dir.join(paths::ASSETS_PACK), b"assets").unwrap();

        let script = dir.join("fake_server.sh");
        std::fs::write(&script, ECHO_SERVER).unwrap();
        let mut perm = std::fs::metadata(&script).unwrap().permissions();
        perm.set_mode(0o755);
        std::fs::set_permissions(&script, perm).unwrap();

        let settings = serde_json::json!({ "runtime": script.display().to_string() });
        std::fs::write(
            dir.join(paths::STARTUP_SETTINGS),
            serde_json::to_vec(&settings).unwrap(),
        )
        .unwrap();
        dir
    }

    async fn wait_until<F: FnMut() -> bool>(mut cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached within 10s");
    }

    async fn wait_until_async<F, Fut>(mut cond: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if cond().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached within 10s");
    }

    #[tokio::test]
    async fn start_requires_server_files() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = make_manager(tmp.path());
        let id = InstanceId(1);
        std::fs::create_dir_all(paths::instance_dir(tmp.path(), id)).unwrap();

        let err = manager.start(id, 5520, "", "bare").await.unwrap_err();
        assert!(err.to_string().contains(paths::SERVER_JAR));
        assert!(!manager.is_running(id).await);
    }

    #[tokio::test]
    async fn stop_without_start_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = make_manager(tmp.path());
        assert!(manager.stop(InstanceId(9)).await.is_err());
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = make_manager(tmp.path());
        let id = InstanceId(2);
        prepare_instance(tmp.path(), id);

        manager.start(id, 5521, "", "alpha").await.unwrap();
        let err = manager.start(id, 5521, "", "alpha").await.unwrap_err();
        assert!(err.to_string().contains("already running"));

        manager.stop(id).await.unwrap();
    }

    #[tokio::test]
    async fn command_round_trip_reaches_stdin_byte_for_byte() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = make_manager(tmp.path());
        let id = InstanceId(3);
        let dir = prepare_instance(tmp.path(), id);

        manager.start(id, 5522, "", "beta").await.unwrap();
        assert!(manager.is_running(id).await);

        manager.send_command(id, "/say hello world").await.unwrap();

        let capture = dir.join("stdin_capture.txt");
        wait_until(|| {
            std::fs::read(&capture)
                .map(|b| b.starts_with(b"/say hello world\n"))
                .unwrap_or(false)
        })
        .await;

        // The echoed output flows through the multiplexer into scrollback.
        wait_until_async(|| {
            let m = manager.clone();
            async move {
                let (lines, _) = m.console_tail(id, 0, 1000).await.unwrap_or_default();
                lines.iter().any(|l| l.text == "recv:/say hello world")
            }
        })
        .await;

        manager.stop(id).await.unwrap();
        assert!(!manager.is_running(id).await);
        assert!(manager.send_command(id, "/say again").await.is_err());
    }

    #[tokio::test]
    async fn lifecycle_allows_restart_after_stop_and_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = make_manager(tmp.path());
        let id = InstanceId(4);
        prepare_instance(tmp.path(), id);

        manager.start(id, 5523, "", "gamma").await.unwrap();
        manager.stop(id).await.unwrap();
        assert!(!manager.is_running(id).await);

        // Slot is free again after stop.
        manager.start(id, 5523, "", "gamma").await.unwrap();

        // Natural exit (graceful command straight down the channel) is
        // discovered lazily by the next poll, which also frees the slot.
        manager.send_command(id, "/stop").await.unwrap();
        wait_until_async(|| {
            let m = manager.clone();
            async move { !m.is_running(id).await }
        })
        .await;

        manager.start(id, 5523, "", "gamma").await.unwrap();
        manager.stop(id).await.unwrap();
    }
}
