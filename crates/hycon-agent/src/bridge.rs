//! Event Bridge: persistent side-channel WebSocket to the companion plugin.
//!
//! One outbound connection per instance, independent of whether the game
//! process itself is running; when the plugin isn't listening the connect
//! simply fails and is retried. Teardown is explicit (watch flag), since the
//! bridge is not tied to process lifetime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hycon_core::InstanceId;
use tokio::sync::{Mutex, watch};
use tokio_tungstenite::tungstenite::{Message as WsMessage, client::IntoClientRequest};

use crate::publish::{Outbound, Publisher};
use crate::settings::BridgeSettings;
use crate::store::EventStore;
use crate::webhook::WebhookDispatcher;

/// Event types persisted to durable storage; everything else is broadcast
/// and webhook-dispatched only.
pub const STORED_EVENT_TYPES: &[&str] = &["player_connect", "player_disconnect", "player_chat"];

pub(crate) const PING_INTERVAL: Duration = Duration::from_secs(25);
pub(crate) const RECONNECT_DELAY: Duration = Duration::from_secs(5);

struct BridgeHandle {
    stop: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct BridgeManager {
    publisher: Publisher,
    store: Arc<dyn EventStore>,
    webhooks: WebhookDispatcher,
    inner: Arc<Mutex<HashMap<InstanceId, BridgeHandle>>>,
    status: Arc<Mutex<HashMap<InstanceId, bool>>>,
}

impl BridgeManager {
    pub fn new(publisher: Publisher, store: Arc<dyn EventStore>, webhooks: WebhookDispatcher) -> Self {
        Self {
            publisher,
            store,
            webhooks,
            inner: Arc::new(Mutex::new(HashMap::new())),
            status: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start (or keep) the bridge loop for an instance. Does nothing when a
    /// live loop already exists or the settings disable the bridge.
    pub async fn ensure(&self, id: InstanceId, settings: BridgeSettings) {
        if !settings.enabled {
            self.status.lock().await.insert(id, false);
            return;
        }

        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.get(&id)
            && !handle.stop.is_closed()
        {
            return;
        }
        self.status.lock().await.entry(id).or_insert(false);

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = BridgeTask {
            id,
            settings,
            publisher: self.publisher.clone(),
            store: self.store.clone(),
            webhooks: self.webhooks.clone(),
            status: self.status.clone(),
        };
        tokio::spawn(task.run(stop_rx));
        inner.insert(id, BridgeHandle { stop: stop_tx });
        tracing::info!(instance = %id, "bridge loop started");
    }

    /// Explicit teardown; the loop observes the flag and unwinds.
    pub async fn shutdown(&self, id: InstanceId) {
        let handle = self.inner.lock().await.remove(&id);
        if let Some(handle) = handle {
            let _ = handle.stop.send(true);
            tracing::info!(instance = %id, "bridge loop stopping");
        }
    }

    pub async fn is_connected(&self, id: InstanceId) -> bool {
        self.status.lock().await.get(&id).copied().unwrap_or(false)
    }
}

struct BridgeTask {
    id: InstanceId,
    settings: BridgeSettings,
    publisher: Publisher,
    store: Arc<dyn EventStore>,
    webhooks: WebhookDispatcher,
    status: Arc<Mutex<HashMap<InstanceId, bool>>>,
}

impl BridgeTask {
    async fn run(self, mut stop: watch::Receiver<bool>) {
        let urls = self.settings.candidate_urls();
        let bearer = self.settings.bearer_token().map(str::to_string);

        loop {
            if *stop.borrow() {
                break;
            }
            for url in &urls {
                match self.connect_once(url, bearer.as_deref(), &mut stop).await {
                    // The connection opened (and later ended); go back to the
                    // primary candidate after the delay.
                    Ok(()) => break,
                    Err(e) => {
                        tracing::debug!(instance = %self.id, url = %url, error = %e, "bridge connect failed");
                    }
                }
                if *stop.borrow() {
                    break;
                }
            }
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = stop.changed() => {}
            }
        }

        self.set_connected(false).await;
        tracing::debug!(instance = %self.id, "bridge loop stopped");
    }

    /// One full connection lifetime. `Err` only when the socket never opened,
    /// so the caller can try the insecure fallback candidate.
    async fn connect_once(
        &self,
        url: &str,
        bearer: Option<&str>,
        stop: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut request = url.into_client_request()?;
        if let Some(token) = bearer {
            let value = format!("Bearer {token}");
            request.headers_mut().insert("Authorization", value.parse()?);
        }

        let (ws, _) = tokio_tungstenite::connect_async(request).await?;
        let (mut sink, mut stream) = ws.split();

        tracing::info!(instance = %self.id, url = %url, "bridge connected");
        self.set_connected(true).await;

        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + PING_INTERVAL,
            PING_INTERVAL,
        );

        let result: anyhow::Result<()> = async {
            loop {
                tokio::select! {
                    msg = stream.next() => {
                        match msg {
                            Some(Ok(WsMessage::Text(text))) => self.handle_message(&text).await,
                            Some(Ok(WsMessage::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => return Err(e.into()),
                        }
                    }
                    _ = ping.tick() => {
                        sink.send(WsMessage::Text(r#"{"type":"ping"}"#.into())).await?;
                    }
                    _ = stop.changed() => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(instance = %self.id, error = %e, "bridge connection ended with error");
        }
        self.set_connected(false).await;
        Ok(())
    }

    async fn handle_message(&self, text: &str) {
        let Ok(event) = serde_json::from_str::<serde_json::Value>(text) else {
            return;
        };
        let Some(event_type) = event.get("type").and_then(|t| t.as_str()) else {
            return;
        };

        if STORED_EVENT_TYPES.contains(&event_type)
            && let Err(e) = self.store.append(self.id, &event).await
        {
            tracing::warn!(instance = %self.id, event_type, error = %e, "failed to store bridge event");
        }

        self.publisher.publish(Outbound::BridgeEvent {
            instance: self.id,
            event: event.clone(),
        });
        self.webhooks.dispatch(self.id, &event).await;
    }

    async fn set_connected(&self, connected: bool) {
        let mut status = self.status.lock().await;
        let prev = status.insert(self.id, connected);
        drop(status);
        if prev != Some(connected) {
            self.publisher.publish(Outbound::BridgeStatus {
                instance: self.id,
                connected,
            });
        }
    }
}
