//! Host-local agent for the Hytale web console.
//!
//! Supervises server processes, bridges their console I/O, drives the device
//! authentication flow from log output, and maintains the companion-plugin
//! event bridge with webhook dispatch. The HTTP/UI tier drives this crate
//! through [`supervisor::ServerManager`] and [`bridge::BridgeManager`] and
//! subscribes to [`publish::Publisher`] for fan-out.

pub mod auth;
pub mod bridge;
pub mod buffer;
pub mod console;
pub mod launch;
pub mod paths;
pub mod publish;
pub mod settings;
pub mod store;
pub mod supervisor;
pub mod tail;
pub mod webhook;

pub use bridge::BridgeManager;
pub use publish::{Outbound, Publisher};
pub use supervisor::ServerManager;
pub use webhook::WebhookDispatcher;
