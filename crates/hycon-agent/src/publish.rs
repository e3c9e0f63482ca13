//! Outbound fan-out to console viewers.
//!
//! The real transport (the web tier's socket layer) subscribes to the
//! broadcast channel; the agent only publishes and never learns who is
//! listening. Publishing to zero subscribers is not an error.

use hycon_core::{AuthPrompt, ConsoleLine, InstanceId};
use tokio::sync::broadcast;

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    ConsoleOutput {
        instance: InstanceId,
        line: ConsoleLine,
    },
    AuthRequired {
        instance: InstanceId,
        prompt: AuthPrompt,
    },
    AuthSucceeded {
        instance: InstanceId,
    },
    BridgeStatus {
        instance: InstanceId,
        connected: bool,
    },
    BridgeEvent {
        instance: InstanceId,
        event: serde_json::Value,
    },
}

#[derive(Debug, Clone)]
pub struct Publisher {
    tx: broadcast::Sender<Outbound>,
}

impl Publisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: Outbound) {
        // Err means no live subscribers; fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.tx.subscribe()
    }
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new(256)
    }
}
