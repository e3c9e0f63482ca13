//! Console Monitor: the single consumer of an instance's output queue.
//!
//! One task per instance drains the multiplexed stream/log-tail queue with a
//! short poll timeout, appends to the scrollback buffer, publishes to
//! viewers, and runs the authentication automation. Buffer appends and auth
//! state mutation happen only on this task.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use hycon_core::{AuthState, ConsoleSource, InstanceId};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

use crate::auth::{self, AuthMachine, Effect};
use crate::buffer::ConsoleBuffer;
use crate::publish::{Outbound, Publisher};
use crate::store::AuthRecords;

pub(crate) const QUEUE_POLL: Duration = Duration::from_millis(100);
pub(crate) const INITIAL_STATUS_DELAY: Duration = Duration::from_secs(2);

/// Remove ANSI escape sequences (CSI and OSC) and carriage returns so the
/// scrollback holds plain text.
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            match chars.peek() {
                Some('[') => {
                    chars.next();
                    // CSI: parameters/intermediates until a final byte @..~.
                    for n in chars.by_ref() {
                        if ('\u{40}'..='\u{7e}').contains(&n) {
                            break;
                        }
                    }
                }
                Some(']') => {
                    chars.next();
                    // OSC: terminated by BEL or ESC \.
                    while let Some(n) = chars.next() {
                        if n == '\u{7}' {
                            break;
                        }
                        if n == '\u{1b}' {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {
                    chars.next();
                }
            }
        } else if c != '\r' {
            out.push(c);
        }
    }
    out
}

/// Copy of the auth machine's externally interesting bits, readable by the
/// supervisor without touching monitor-owned state.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AuthSnapshot {
    pub state: AuthState,
    pub verified: bool,
}

pub(crate) struct MonitorContext {
    pub id: InstanceId,
    pub instance_dir: PathBuf,
    pub buffer: Arc<Mutex<ConsoleBuffer>>,
    pub publisher: Publisher,
    pub records: Arc<dyn AuthRecords>,
    /// Automatic commands go back through the command channel via this queue.
    pub commands: mpsc::UnboundedSender<String>,
    pub auth: AuthMachine,
    pub snapshot: Arc<std::sync::Mutex<AuthSnapshot>>,
    pub alive: Arc<AtomicBool>,
}

enum Pending {
    Send(String),
    Persistence,
    Verify,
}

pub(crate) async fn run_monitor(
    mut ctx: MonitorContext,
    mut rx: mpsc::UnboundedReceiver<(ConsoleSource, String)>,
) {
    let mut due: Vec<(Instant, Pending)> = vec![(
        Instant::now() + INITIAL_STATUS_DELAY,
        Pending::Send(auth::STATUS_COMMAND.to_string()),
    )];

    update_snapshot(&ctx);

    loop {
        if !ctx.alive.load(Ordering::Relaxed) {
            break;
        }
        match tokio::time::timeout(QUEUE_POLL, rx.recv()).await {
            Ok(Some((source, raw))) => {
                let text = strip_ansi(&raw);
                let line = ctx.buffer.lock().await.push(source, text.clone());
                ctx.publisher.publish(Outbound::ConsoleOutput {
                    instance: ctx.id,
                    line,
                });
                let effects = ctx.auth.observe(&text, Instant::now());
                apply_effects(&mut ctx, &mut due, effects).await;
            }
            // All producers are gone: the process exited and the tailer
            // stopped. The registry entry stays until the supervisor
            // discovers the exit on its next poll.
            Ok(None) => break,
            Err(_) => {}
        }
        run_due(&mut ctx, &mut due).await;
    }

    tracing::debug!(instance = %ctx.id, "console monitor stopped");
}

async fn apply_effects(
    ctx: &mut MonitorContext,
    due: &mut Vec<(Instant, Pending)>,
    effects: Vec<Effect>,
) {
    for effect in effects {
        match effect {
            Effect::Send { after, command } => {
                if after.is_zero() {
                    let _ = ctx.commands.send(command);
                } else {
                    due.push((Instant::now() + after, Pending::Send(command)));
                }
            }
            Effect::RequestPersistence { after } => {
                due.push((Instant::now() + after, Pending::Persistence));
            }
            Effect::ScheduleVerify { after } => {
                due.push((Instant::now() + after, Pending::Verify));
            }
            Effect::AnnouncePrompt(prompt) => {
                tracing::info!(instance = %ctx.id, url = %prompt.url, "device authentication required");
                ctx.publisher.publish(Outbound::AuthRequired {
                    instance: ctx.id,
                    prompt,
                });
            }
            Effect::AnnounceSuccess => {
                ctx.publisher.publish(Outbound::AuthSucceeded { instance: ctx.id });
            }
            Effect::Note(text) => {
                emit_system_line(ctx, text).await;
            }
            Effect::Verified(path) => {
                record_verified(ctx, &path).await;
            }
        }
    }
    update_snapshot(ctx);
}

async fn run_due(ctx: &mut MonitorContext, due: &mut Vec<(Instant, Pending)>) {
    let now = Instant::now();
    let mut i = 0;
    while i < due.len() {
        if due[i].0 > now {
            i += 1;
            continue;
        }
        let (_, action) = due.swap_remove(i);
        match action {
            Pending::Send(command) => {
                let _ = ctx.commands.send(command);
            }
            Pending::Persistence => {
                if let Some(command) = ctx.auth.next_persistence_command() {
                    let _ = ctx.commands.send(command);
                }
            }
            Pending::Verify => {
                let effects = ctx.auth.verify_persistence(&ctx.instance_dir);
                for effect in effects {
                    if let Effect::Verified(path) = effect {
                        record_verified(ctx, &path).await;
                    }
                }
            }
        }
        update_snapshot(ctx);
    }
}

async fn record_verified(ctx: &MonitorContext, path: &std::path::Path) {
    tracing::info!(instance = %ctx.id, path = %path.display(), "credential artifact verified");
    if let Err(e) = ctx.records.mark_authenticated(ctx.id, path).await {
        tracing::warn!(instance = %ctx.id, error = %e, "failed to record authentication");
    }
}

async fn emit_system_line(ctx: &MonitorContext, text: String) {
    let line = ctx.buffer.lock().await.push(ConsoleSource::System, text);
    ctx.publisher.publish(Outbound::ConsoleOutput {
        instance: ctx.id,
        line,
    });
}

fn update_snapshot(ctx: &MonitorContext) {
    if let Ok(mut snap) = ctx.snapshot.lock() {
        *snap = AuthSnapshot {
            state: ctx.auth.state(),
            verified: ctx.auth.verified(),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MAX_CONSOLE_LINES;
    use crate::store::NullAuthRecords;

    #[test]
    fn strip_ansi_removes_color_and_osc() {
        assert_eq!(strip_ansi("\u{1b}[31mERROR\u{1b}[0m done"), "ERROR done");
        assert_eq!(strip_ansi("\u{1b}]0;title\u{7}text"), "text");
        assert_eq!(strip_ansi("plain\r"), "plain");
    }

    struct Harness {
        tx: mpsc::UnboundedSender<(ConsoleSource, String)>,
        cmd_rx: mpsc::UnboundedReceiver<String>,
        buffer: Arc<Mutex<ConsoleBuffer>>,
        snapshot: Arc<std::sync::Mutex<AuthSnapshot>>,
        alive: Arc<AtomicBool>,
        dir: tempfile::TempDir,
    }

    fn spawn_monitor() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let buffer = Arc::new(Mutex::new(ConsoleBuffer::new(MAX_CONSOLE_LINES)));
        let snapshot = Arc::new(std::sync::Mutex::new(AuthSnapshot {
            state: AuthState::Unauthenticated,
            verified: false,
        }));
        let alive = Arc::new(AtomicBool::new(true));

        let ctx = MonitorContext {
            id: InstanceId(1),
            instance_dir: dir.path().to_path_buf(),
            buffer: buffer.clone(),
            publisher: Publisher::new(64),
            records: Arc::new(NullAuthRecords),
            commands: cmd_tx,
            auth: AuthMachine::new(),
            snapshot: snapshot.clone(),
            alive: alive.clone(),
        };
        tokio::spawn(run_monitor(ctx, rx));

        Harness {
            tx,
            cmd_rx,
            buffer,
            snapshot,
            alive,
            dir,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_issues_initial_status_exactly_once() {
        let mut h = spawn_monitor();

        tokio::time::sleep(Duration::from_millis(2300)).await;
        assert_eq!(h.cmd_rx.try_recv().unwrap(), auth::STATUS_COMMAND);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(h.cmd_rx.try_recv().is_err());

        h.alive.store(false, Ordering::Relaxed);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_drives_the_full_auth_flow() {
        let mut h = spawn_monitor();

        // Consume the initial status query.
        tokio::time::sleep(Duration::from_millis(2300)).await;
        assert_eq!(h.cmd_rx.try_recv().unwrap(), auth::STATUS_COMMAND);

        h.tx.send((ConsoleSource::Stdout, "No credentials configured".to_string()))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.cmd_rx.try_recv().unwrap(), auth::LOGIN_COMMAND);

        // The same trigger again within the cooldown issues nothing.
        h.tx.send((ConsoleSource::Stdout, "No credentials configured".to_string()))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(h.cmd_rx.try_recv().is_err());

        h.tx.send((ConsoleSource::Stdout, "Authentication successful".to_string()))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(h.cmd_rx.try_recv().unwrap(), "/auth persistence encrypted");

        std::fs::write(h.dir.path().join("auth.enc"), b"blob").unwrap();
        h.tx.send((
            ConsoleSource::Stdout,
            "Auth persistence set to encrypted".to_string(),
        ))
        .unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;

        let snap = *h.snapshot.lock().unwrap();
        assert_eq!(snap.state, AuthState::Authenticated);
        assert!(snap.verified);

        // Exactly one login and one persistence command were issued.
        assert!(h.cmd_rx.try_recv().is_err());

        h.alive.store(false, Ordering::Relaxed);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_buffers_and_cleans_lines() {
        let h = spawn_monitor();

        h.tx.send((
            ConsoleSource::Stderr,
            "\u{1b}[33m[WARN]\u{1b}[0m low memory".to_string(),
        ))
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let (lines, _) = h.buffer.lock().await.tail_after(0, 10);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "[WARN] low memory");
        assert_eq!(lines[0].source, ConsoleSource::Stderr);

        h.alive.store(false, Ordering::Relaxed);
    }
}
