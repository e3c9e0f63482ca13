//! Discord webhook dispatch with bounded queueing and retry.
//!
//! Event processing never blocks on delivery: rendered messages go onto a
//! bounded per-instance FIFO (oldest evicted when full) and a single worker
//! task per instance performs the HTTP posts. Delivery policy is separated
//! from HTTP via [`WebhookTransport`] so the retry behavior is testable
//! without sockets.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hycon_core::{InstanceId, WebhookDiagnostics};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::store::{WebhookRule, WebhookSettingsSource};

pub const WEBHOOK_QUEUE_MAX: usize = 1000;
const SETTINGS_TTL: Duration = Duration::from_secs(15);
const MAX_ATTEMPTS: u32 = 4;
const WORKER_IDLE_WAIT: Duration = Duration::from_secs(1);
const MESSAGE_MAX_CHARS: usize = 1900;
const RETRY_AFTER_MIN_SECS: f64 = 1.0;
const RETRY_AFTER_MAX_SECS: f64 = 30.0;
const HTTP_TIMEOUT: Duration = Duration::from_secs(8);

const DEFAULT_TEMPLATES: &[(&str, &str)] = &[
    ("player_connect", "✅ Player connected: **{player}**"),
    ("player_disconnect", "👋 Player disconnected: **{player}**"),
    ("player_death", "💀 Player death: **{player}** ({cause}) in **{world}**"),
    ("player_chat", "💬 **{player}**: {message}"),
];

pub fn default_template(event_type: &str) -> Option<&'static str> {
    DEFAULT_TEMPLATES
        .iter()
        .find(|(k, _)| *k == event_type)
        .map(|(_, t)| *t)
}

fn field(payload: &serde_json::Value, key: &str, default: &str) -> String {
    match payload.get(key) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Null) | None => default.to_string(),
        Some(other) => other.to_string(),
    }
}

fn trim_message(text: &str) -> String {
    if text.chars().count() <= MESSAGE_MAX_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(MESSAGE_MAX_CHARS - 3).collect();
    out.push_str("...");
    out
}

/// Render the outgoing message for an event, using the configured template
/// or the per-type default. `None` means nothing should be sent.
pub fn render_message(
    event_type: &str,
    payload: &serde_json::Value,
    template: Option<&str>,
) -> Option<String> {
    let resolved = match template.filter(|t| !t.trim().is_empty()) {
        Some(t) => t.to_string(),
        None => default_template(event_type)?.to_string(),
    };

    let replacements = [
        ("{player}", field(payload, "player", "Unknown")),
        ("{uuid}", field(payload, "uuid", "")),
        ("{world}", field(payload, "world", "unknown")),
        ("{cause}", field(payload, "cause", "unknown")),
        ("{message}", field(payload, "message", "")),
        ("{tps}", field(payload, "tps", "")),
        ("{mspt}", field(payload, "mspt", "")),
        ("{timestamp}", field(payload, "timestamp", "")),
    ];

    let mut out = resolved;
    for (key, value) in replacements {
        out = out.replace(key, &value);
    }
    let out = out.trim();
    if out.is_empty() {
        None
    } else {
        Some(trim_message(out))
    }
}

/// Result of one HTTP delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered,
    RateLimited { retry_after_secs: Option<f64> },
    ServerError { status: u16 },
    ClientError { status: u16, body: String },
    Transport(String),
}

#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(&self, url: &str, content: &str) -> DeliveryOutcome;
}

/// Production transport: POST `{"content": …}` as JSON.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn post(&self, url: &str, content: &str) -> DeliveryOutcome {
        let body = serde_json::json!({ "content": content });
        let resp = match self.client.post(url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => return DeliveryOutcome::Transport(e.to_string()),
        };
        let status = resp.status();
        if status.is_success() {
            return DeliveryOutcome::Delivered;
        }
        if status.as_u16() == 429 {
            let from_header = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<f64>().ok());
            let retry_after_secs = match from_header {
                Some(v) => Some(v),
                None => resp
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|v| v.get("retry_after").and_then(|r| r.as_f64())),
            };
            return DeliveryOutcome::RateLimited { retry_after_secs };
        }
        if status.is_server_error() {
            return DeliveryOutcome::ServerError {
                status: status.as_u16(),
            };
        }
        let body = resp.text().await.unwrap_or_default();
        DeliveryOutcome::ClientError {
            status: status.as_u16(),
            body: body.chars().take(200).collect(),
        }
    }
}

#[derive(Debug, Clone)]
struct Job {
    url: String,
    message: String,
    event_type: String,
}

#[derive(Default)]
struct InstanceQueue {
    jobs: VecDeque<Job>,
    worker_running: bool,
}

/// Per-instance webhook pipeline: settings cache, bounded FIFO, worker,
/// retry, diagnostics.
#[derive(Clone)]
pub struct WebhookDispatcher {
    transport: Arc<dyn WebhookTransport>,
    settings: Arc<dyn WebhookSettingsSource>,
    queue_max: usize,
    spawn_workers: bool,
    queues: Arc<Mutex<HashMap<InstanceId, InstanceQueue>>>,
    wakeups: Arc<Mutex<HashMap<InstanceId, Arc<Notify>>>>,
    diagnostics: Arc<Mutex<HashMap<InstanceId, WebhookDiagnostics>>>,
    cache: Arc<Mutex<HashMap<InstanceId, (Instant, HashMap<String, WebhookRule>)>>>,
}

impl WebhookDispatcher {
    pub fn new(
        transport: Arc<dyn WebhookTransport>,
        settings: Arc<dyn WebhookSettingsSource>,
    ) -> Self {
        Self {
            transport,
            settings,
            queue_max: WEBHOOK_QUEUE_MAX,
            spawn_workers: true,
            queues: Arc::new(Mutex::new(HashMap::new())),
            wakeups: Arc::new(Mutex::new(HashMap::new())),
            diagnostics: Arc::new(Mutex::new(HashMap::new())),
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn diagnostics(&self, id: InstanceId) -> WebhookDiagnostics {
        self.diagnostics
            .lock()
            .await
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    async fn with_diag<F: FnOnce(&mut WebhookDiagnostics)>(&self, id: InstanceId, f: F) {
        let mut diags = self.diagnostics.lock().await;
        let diag = diags.entry(id).or_default();
        f(diag);
        diag.updated_at_unix_ms = Some(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        );
    }

    /// Settings reads are cached with a short TTL to bound repeated storage
    /// round trips; a failing read reuses the stale entry.
    async fn cached_rules(&self, id: InstanceId) -> HashMap<String, WebhookRule> {
        let now = Instant::now();
        {
            let cache = self.cache.lock().await;
            if let Some((loaded_at, rules)) = cache.get(&id)
                && now.duration_since(*loaded_at) < SETTINGS_TTL
            {
                return rules.clone();
            }
        }
        match self.settings.webhooks(id).await {
            Ok(rules) => {
                self.cache.lock().await.insert(id, (now, rules.clone()));
                rules
            }
            Err(e) => {
                tracing::warn!(instance = %id, error = %e, "failed to read webhook settings");
                let cache = self.cache.lock().await;
                cache
                    .get(&id)
                    .map(|(_, rules)| rules.clone())
                    .unwrap_or_default()
            }
        }
    }

    /// Non-blocking entry point from the event path. Renders, enqueues, and
    /// makes sure a worker is draining the queue.
    pub async fn dispatch(&self, id: InstanceId, event: &serde_json::Value) {
        let Some(event_type) = event.get("type").and_then(|t| t.as_str()) else {
            return;
        };
        let rules = self.cached_rules(id).await;
        let Some(rule) = rules.get(event_type) else {
            return;
        };
        if !rule.enabled || rule.url.trim().is_empty() {
            return;
        }
        let Some(message) = render_message(event_type, event, rule.template.as_deref()) else {
            return;
        };

        let job = Job {
            url: rule.url.clone(),
            message,
            event_type: event_type.to_string(),
        };

        let mut spawn_worker = false;
        {
            let mut queues = self.queues.lock().await;
            let state = queues.entry(id).or_default();
            if state.jobs.len() >= self.queue_max {
                // Never block the event path: evict the oldest pending entry.
                state.jobs.pop_front();
                self.with_diag(id, |d| d.dropped_total += 1).await;
            }
            state.jobs.push_back(job);
            if self.spawn_workers && !state.worker_running {
                state.worker_running = true;
                spawn_worker = true;
            }
        }
        self.with_diag(id, |d| {
            d.enqueued_total += 1;
            d.last_event_type = Some(event_type.to_string());
        })
        .await;

        let notify = self.wakeup(id).await;
        if spawn_worker {
            let dispatcher = self.clone();
            tokio::spawn(async move { dispatcher.run_worker(id).await });
        }
        notify.notify_one();
    }

    async fn wakeup(&self, id: InstanceId) -> Arc<Notify> {
        let mut wakeups = self.wakeups.lock().await;
        wakeups.entry(id).or_default().clone()
    }

    async fn run_worker(self, id: InstanceId) {
        let notify = self.wakeup(id).await;
        loop {
            let job = {
                let mut queues = self.queues.lock().await;
                queues.get_mut(&id).and_then(|s| s.jobs.pop_front())
            };
            match job {
                Some(job) => self.deliver_with_retry(id, &job).await,
                None => {
                    let _ = tokio::time::timeout(WORKER_IDLE_WAIT, notify.notified()).await;
                }
            }
        }
    }

    /// Up to four attempts: `Retry-After` (clamped to [1, 30] s) on 429,
    /// linear backoff on 5xx/transport errors, immediate permanent failure
    /// on other client errors.
    async fn deliver_with_retry(&self, id: InstanceId, job: &Job) {
        for attempt in 1..=MAX_ATTEMPTS {
            match self.transport.post(&job.url, &job.message).await {
                DeliveryOutcome::Delivered => {
                    self.with_diag(id, |d| {
                        d.sent_total += 1;
                        d.last_event_type = Some(job.event_type.clone());
                    })
                    .await;
                    return;
                }
                DeliveryOutcome::RateLimited { retry_after_secs } => {
                    self.with_diag(id, |d| d.rate_limited_total += 1).await;
                    if attempt < MAX_ATTEMPTS {
                        let secs = retry_after_secs
                            .unwrap_or(0.0)
                            .clamp(RETRY_AFTER_MIN_SECS, RETRY_AFTER_MAX_SECS);
                        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                    } else {
                        self.record_failure(id, job, Some(429), "rate limited".to_string())
                            .await;
                        return;
                    }
                }
                DeliveryOutcome::ServerError { status } => {
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                    } else {
                        self.record_failure(id, job, Some(status), format!("HTTP {status}"))
                            .await;
                        return;
                    }
                }
                DeliveryOutcome::Transport(error) => {
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                    } else {
                        self.record_failure(id, job, None, error).await;
                        return;
                    }
                }
                DeliveryOutcome::ClientError { status, body } => {
                    let error = if body.is_empty() {
                        format!("HTTP {status}")
                    } else {
                        body
                    };
                    self.record_failure(id, job, Some(status), error).await;
                    return;
                }
            }
        }
    }

    async fn record_failure(&self, id: InstanceId, job: &Job, code: Option<u16>, error: String) {
        tracing::warn!(instance = %id, event_type = %job.event_type, error = %error, "webhook delivery failed");
        self.with_diag(id, |d| {
            d.failed_total += 1;
            d.last_error = Some(error);
            d.last_error_code = code;
            d.last_event_type = Some(job.event_type.clone());
        })
        .await;
    }

    #[cfg(test)]
    fn for_tests(
        transport: Arc<dyn WebhookTransport>,
        settings: Arc<dyn WebhookSettingsSource>,
        queue_max: usize,
        spawn_workers: bool,
    ) -> Self {
        let mut d = Self::new(transport, settings);
        d.queue_max = queue_max;
        d.spawn_workers = spawn_workers;
        d
    }

    #[cfg(test)]
    async fn pending_messages(&self, id: InstanceId) -> Vec<String> {
        let queues = self.queues.lock().await;
        queues
            .get(&id)
            .map(|s| s.jobs.iter().map(|j| j.message.clone()).collect())
            .unwrap_or_default()
    }
}
