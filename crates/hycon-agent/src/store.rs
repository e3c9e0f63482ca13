//! Seams to the record-keeping layer.
//!
//! The relational storage behind these traits lives in the web tier; the
//! agent only needs narrow async calls. `Null*` implementations let the
//! daemon run standalone.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use hycon_core::InstanceId;

/// Durable append of allow-listed bridge events (chat logs, join/leave).
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, instance: InstanceId, event: &serde_json::Value) -> anyhow::Result<()>;
}

/// Marks an instance as authenticated once a credential artifact is durable.
#[async_trait]
pub trait AuthRecords: Send + Sync {
    async fn mark_authenticated(
        &self,
        instance: InstanceId,
        credential_path: &Path,
    ) -> anyhow::Result<()>;
}

/// Per-event-type webhook target configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookRule {
    pub url: String,
    pub enabled: bool,
    pub template: Option<String>,
}

/// Source of per-instance webhook settings (event type -> rule).
#[async_trait]
pub trait WebhookSettingsSource: Send + Sync {
    async fn webhooks(&self, instance: InstanceId)
    -> anyhow::Result<HashMap<String, WebhookRule>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventStore;

#[async_trait]
impl EventStore for NullEventStore {
    async fn append(&self, _instance: InstanceId, _event: &serde_json::Value) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuthRecords;

#[async_trait]
impl AuthRecords for NullAuthRecords {
    async fn mark_authenticated(
        &self,
        _instance: InstanceId,
        _credential_path: &Path,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullWebhookSettings;

#[async_trait]
impl WebhookSettingsSource for NullWebhookSettings {
    async fn webhooks(
        &self,
        _instance: InstanceId,
    ) -> anyhow::Result<HashMap<String, WebhookRule>> {
        Ok(HashMap::new())
    }
}
