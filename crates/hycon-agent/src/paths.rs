use std::path::{Path, PathBuf};

use hycon_core::InstanceId;

pub const SERVER_JAR: &str = "HytaleServer.jar";
pub const ASSETS_PACK: &str = "Assets.zip";
pub const AOT_CACHE: &str = "HytaleServer.aot";
pub const STARTUP_SETTINGS: &str = "startup_settings.json";
pub const BRIDGE_SETTINGS: &str = "bridge_settings.json";

/// Credential artifacts the managed server is known to write, in probe order.
pub const CREDENTIAL_FILES: &[&str] = &["auth.enc", "auth.json", "credentials/auth.enc"];

/// Root under which per-instance directories live. Overridable for dev
/// installs; the Docker image sets it explicitly.
pub fn data_root() -> PathBuf {
    std::env::var("HYCON_DATA_ROOT")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("data"))
}

pub fn instance_dir(root: &Path, id: InstanceId) -> PathBuf {
    root.join("servers").join(format!("server_{id}"))
}

pub fn logs_dir(instance_dir: &Path) -> PathBuf {
    instance_dir.join("logs")
}

/// First credential artifact present under the instance dir, if any.
pub fn find_credential_artifact(instance_dir: &Path) -> Option<PathBuf> {
    CREDENTIAL_FILES
        .iter()
        .map(|rel| instance_dir.join(rel))
        .find(|p| p.is_file())
}
