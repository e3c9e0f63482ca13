//! Typed per-instance settings with explicit defaults.
//!
//! The on-disk files are plain JSON written by the web tier. Every read goes
//! through one `normalize()` pass so defaults and clamps live in exactly one
//! place instead of at each call site.

use std::collections::BTreeMap;
use std::path::Path;

use crate::paths;

const RAM_MIN_FLOOR_MB: u32 = 256;
const RAM_MAX_CEIL_MB: u32 = 65_536;

/// Launch-time configuration for one instance, read from
/// `startup_settings.json` in the instance directory.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct StartupSettings {
    /// Runtime binary used to launch the server jar.
    pub runtime: String,
    pub ram_min_mb: u32,
    pub ram_max_mb: u32,
    pub profile: String,
    pub auth_mode: String,
    /// Skip the `-XX:AOTCache` flag even when the cache artifact exists.
    pub disable_aot: bool,
    /// Feature toggles exported to the child as `HYTALE_FEATURE_<NAME>`.
    pub features: BTreeMap<String, bool>,
}

impl Default for StartupSettings {
    fn default() -> Self {
        Self {
            runtime: "java".to_string(),
            ram_min_mb: 1024,
            ram_max_mb: 4096,
            profile: "default".to_string(),
            auth_mode: "device-code".to_string(),
            disable_aot: false,
            features: BTreeMap::new(),
        }
    }
}

impl StartupSettings {
    pub fn normalize(mut self) -> Self {
        if self.runtime.trim().is_empty() {
            self.runtime = "java".to_string();
        }
        self.ram_min_mb = self.ram_min_mb.clamp(RAM_MIN_FLOOR_MB, RAM_MAX_CEIL_MB);
        self.ram_max_mb = self.ram_max_mb.clamp(self.ram_min_mb, RAM_MAX_CEIL_MB);
        if self.profile.trim().is_empty() {
            self.profile = "default".to_string();
        }
        if self.auth_mode.trim().is_empty() {
            self.auth_mode = "device-code".to_string();
        }
        self
    }

    /// Read and normalize the settings for an instance dir. A missing or
    /// unparsable file yields the defaults; the server must stay startable
    /// even if the web tier never wrote settings.
    pub async fn load(instance_dir: &Path) -> Self {
        let path = instance_dir.join(paths::STARTUP_SETTINGS);
        let raw = match tokio::fs::read(&path).await {
            Ok(v) => v,
            Err(_) => return Self::default(),
        };
        match serde_json::from_slice::<Self>(&raw) {
            Ok(s) => s.normalize(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "invalid startup settings, using defaults");
                Self::default()
            }
        }
    }

    /// Environment variables injected into the child process.
    pub fn child_env(&self) -> Vec<(String, String)> {
        let mut out = vec![
            ("HYTALE_SERVER_PROFILE".to_string(), self.profile.clone()),
            ("HYTALE_AUTH_MODE".to_string(), self.auth_mode.clone()),
        ];
        for (name, on) in &self.features {
            let key = format!(
                "HYTALE_FEATURE_{}",
                name.trim().to_ascii_uppercase().replace(['-', ' '], "_")
            );
            out.push((key, if *on { "1" } else { "0" }.to_string()));
        }
        out
    }
}

/// Connection settings for the companion-plugin event bridge, read from
/// `bridge_settings.json` in the instance directory.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub ws_path: String,
    /// Full URL override; when set, host/port/ws_path are ignored for the
    /// primary candidate.
    pub ws_url: Option<String>,
    pub auth_enabled: bool,
    pub auth_token: Option<String>,
    /// When set, the token is appended as this query parameter instead of an
    /// Authorization header.
    pub auth_query_param: Option<String>,
    /// Refuse the plain-`ws://` fallback when the secure variant fails.
    pub force_secure: bool,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 50_000,
            ws_path: "/ws".to_string(),
            ws_url: None,
            auth_enabled: false,
            auth_token: None,
            auth_query_param: None,
            force_secure: false,
        }
    }
}

impl BridgeSettings {
    pub fn normalize(mut self) -> Self {
        if self.host.trim().is_empty() {
            self.host = "127.0.0.1".to_string();
        }
        if self.port == 0 {
            self.port = 50_000;
        }
        if !self.ws_path.starts_with('/') {
            self.ws_path = format!("/{}", self.ws_path);
        }
        self.auth_token = self.auth_token.filter(|t| !t.trim().is_empty());
        self.auth_query_param = self.auth_query_param.filter(|q| !q.trim().is_empty());
        self
    }

    pub async fn load(instance_dir: &Path) -> Self {
        let path = instance_dir.join(paths::BRIDGE_SETTINGS);
        let raw = match tokio::fs::read(&path).await {
            Ok(v) => v,
            Err(_) => return Self::default(),
        };
        match serde_json::from_slice::<Self>(&raw) {
            Ok(s) => s.normalize(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "invalid bridge settings, using defaults");
                Self::default()
            }
        }
    }

    fn token_query(&self) -> Option<(String, String)> {
        if !self.auth_enabled {
            return None;
        }
        match (&self.auth_token, &self.auth_query_param) {
            (Some(token), Some(param)) => Some((param.clone(), token.clone())),
            _ => None,
        }
    }

    /// Bearer token for the Authorization header, used when no query-param
    /// name is configured.
    pub fn bearer_token(&self) -> Option<&str> {
        if !self.auth_enabled || self.auth_query_param.is_some() {
            return None;
        }
        self.auth_token.as_deref()
    }

    /// Connection candidates in try-order: the configured URL first, then a
    /// plain-`ws://` fallback when the secure scheme is in use but not forced.
    pub fn candidate_urls(&self) -> Vec<String> {
        let scheme = if self.auth_enabled { "wss" } else { "ws" };
        let base = match &self.ws_url {
            Some(url) if !url.trim().is_empty() => url.trim().to_string(),
            _ => format!("{scheme}://{}:{}{}", self.host, self.port, self.ws_path),
        };

        let mut urls = vec![base.clone()];
        if base.starts_with("wss://") && !self.force_secure {
            urls.push(format!("ws://{}", &base["wss://".len()..]));
        }

        if let Some((param, token)) = self.token_query() {
            urls = urls
                .into_iter()
                .map(|u| {
                    if u.contains(&format!("{param}=")) {
                        return u;
                    }
                    let sep = if u.contains('?') { '&' } else { '?' };
                    format!("{u}{sep}{param}={token}")
                })
                .collect();
        }
        urls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_defaults_when_missing_fields() {
        let s: StartupSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(s, StartupSettings::default());
    }

    #[test]
    fn normalize_clamps_ram_bounds() {
        let s = StartupSettings {
            ram_min_mb: 64,
            ram_max_mb: 32,
            ..StartupSettings::default()
        }
        .normalize();
        assert_eq!(s.ram_min_mb, RAM_MIN_FLOOR_MB);
        assert_eq!(s.ram_max_mb, RAM_MIN_FLOOR_MB);

        let s = StartupSettings {
            ram_max_mb: 10_000_000,
            ..StartupSettings::default()
        }
        .normalize();
        assert_eq!(s.ram_max_mb, RAM_MAX_CEIL_MB);
    }

    #[test]
    fn child_env_exports_profile_and_features() {
        let mut features = BTreeMap::new();
        features.insert("early-plugins".to_string(), true);
        features.insert("telemetry".to_string(), false);
        let s = StartupSettings {
            profile: "creative".to_string(),
            features,
            ..StartupSettings::default()
        };

        let env = s.child_env();
        assert!(env.contains(&("HYTALE_SERVER_PROFILE".to_string(), "creative".to_string())));
        assert!(env.contains(&("HYTALE_FEATURE_EARLY_PLUGINS".to_string(), "1".to_string())));
        assert!(env.contains(&("HYTALE_FEATURE_TELEMETRY".to_string(), "0".to_string())));
    }

    #[test]
    fn bridge_candidates_secure_with_fallback() {
        let s = BridgeSettings {
            enabled: true,
            auth_enabled: true,
            auth_token: Some("tok".to_string()),
            ..BridgeSettings::default()
        }
        .normalize();

        assert_eq!(
            s.candidate_urls(),
            vec![
                "wss://127.0.0.1:50000/ws".to_string(),
                "ws://127.0.0.1:50000/ws".to_string(),
            ]
        );
        assert_eq!(s.bearer_token(), Some("tok"));
    }

    #[test]
    fn bridge_candidates_forced_secure_has_no_fallback() {
        let s = BridgeSettings {
            enabled: true,
            auth_enabled: true,
            force_secure: true,
            ..BridgeSettings::default()
        }
        .normalize();
        assert_eq!(s.candidate_urls(), vec!["wss://127.0.0.1:50000/ws".to_string()]);
    }

    #[test]
    fn bridge_token_as_query_param() {
        let s = BridgeSettings {
            enabled: true,
            auth_enabled: true,
            auth_token: Some("tok".to_string()),
            auth_query_param: Some("token".to_string()),
            ..BridgeSettings::default()
        }
        .normalize();

        let urls = s.candidate_urls();
        assert_eq!(urls[0], "wss://127.0.0.1:50000/ws?token=tok");
        // Header auth is off when the query param carries the token.
        assert_eq!(s.bearer_token(), None);
    }

    #[test]
    fn bridge_path_gets_leading_slash() {
        let s = BridgeSettings {
            ws_path: "events".to_string(),
            ..BridgeSettings::default()
        }
        .normalize();
        assert_eq!(s.candidate_urls()[0], "ws://127.0.0.1:50000/events");
    }
}
