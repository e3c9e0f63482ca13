use std::sync::Arc;

use hycon_agent::bridge::BridgeManager;
use hycon_agent::paths;
use hycon_agent::publish::Publisher;
use hycon_agent::settings::BridgeSettings;
use hycon_agent::store::{NullAuthRecords, NullEventStore, NullWebhookSettings};
use hycon_agent::supervisor::ServerManager;
use hycon_agent::webhook::{HttpTransport, WebhookDispatcher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Keep the non-blocking writer guard alive for the process lifetime.
    let _log_guard = init_tracing();

    let data_root = paths::data_root();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), data_root = %data_root.display(), "hycon-agent starting");

    let publisher = Publisher::default();
    let manager = ServerManager::new(
        data_root.clone(),
        publisher.clone(),
        Arc::new(NullAuthRecords),
    );
    let webhooks = WebhookDispatcher::new(
        Arc::new(HttpTransport::new()),
        Arc::new(NullWebhookSettings),
    );
    let bridges = BridgeManager::new(publisher.clone(), Arc::new(NullEventStore), webhooks);

    // Bring up bridges for instances whose settings enable one; the web tier
    // drives everything else through the manager APIs.
    let servers_dir = data_root.join("servers");
    if let Ok(mut rd) = tokio::fs::read_dir(&servers_dir).await {
        while let Ok(Some(entry)) = rd.next_entry().await {
            let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.strip_prefix("server_"))
                .and_then(|n| n.parse::<i64>().ok())
            else {
                continue;
            };
            let id = hycon_core::InstanceId(id);
            let settings = BridgeSettings::load(&entry.path()).await;
            if settings.enabled {
                bridges.ensure(id, settings).await;
            }
        }
    }

    wait_for_shutdown().await;
    tracing::info!("shutdown signal received, stopping instances");

    for id in manager.instance_ids().await {
        if let Err(e) = manager.stop(id).await {
            tracing::warn!(instance = %id, error = %e, "failed to stop instance");
        }
        bridges.shutdown(id).await;
    }

    Ok(())
}

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    match std::env::var("HYCON_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "hycon-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to register SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
