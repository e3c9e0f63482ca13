use std::path::Path;

use anyhow::Context;

use crate::paths;
use crate::settings::StartupSettings;

/// Fully resolved spawn recipe for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub exec: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl LaunchPlan {
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.exec.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

fn has_memory_flags(custom_args: &[String]) -> bool {
    custom_args
        .iter()
        .any(|a| a.starts_with("-Xms") || a.starts_with("-Xmx"))
}

/// Build the launch line:
/// `<runtime> [-XX:AOTCache=…] [-Xms/-Xmx] [custom args] -jar HytaleServer.jar
/// --assets Assets.zip --bind 0.0.0.0:<port>`.
///
/// Memory flags are skipped when the operator's custom args already carry
/// them; the AOT flag is added only when the cache artifact is present and
/// settings do not disable it.
pub fn build_launch_plan(
    instance_dir: &Path,
    settings: &StartupSettings,
    custom_args: &str,
    port: u16,
) -> anyhow::Result<LaunchPlan> {
    let jar = instance_dir.join(paths::SERVER_JAR);
    if !jar.is_file() {
        anyhow::bail!("{} not found in {}", paths::SERVER_JAR, instance_dir.display());
    }
    let assets = instance_dir.join(paths::ASSETS_PACK);
    if !assets.is_file() {
        anyhow::bail!("{} not found in {}", paths::ASSETS_PACK, instance_dir.display());
    }

    let custom: Vec<String> = custom_args
        .split_whitespace()
        .map(str::to_string)
        .collect();

    let mut args = Vec::<String>::new();
    if !settings.disable_aot && instance_dir.join(paths::AOT_CACHE).is_file() {
        args.push(format!("-XX:AOTCache={}", paths::AOT_CACHE));
    }
    if !has_memory_flags(&custom) {
        args.push(format!("-Xms{}M", settings.ram_min_mb));
        args.push(format!("-Xmx{}M", settings.ram_max_mb));
    }
    args.extend(custom);
    args.extend([
        "-jar".to_string(),
        paths::SERVER_JAR.to_string(),
        "--assets".to_string(),
        paths::ASSETS_PACK.to_string(),
        "--bind".to_string(),
        format!("0.0.0.0:{port}"),
    ]);

    Ok(LaunchPlan {
        exec: settings.runtime.clone(),
        args,
        env: settings.child_env(),
    })
}

/// Launch record dropped next to the instance so operators can see exactly
/// what was spawned. Written atomically; read by nothing in the agent.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunInfo {
    pub instance_id: i64,
    pub display_name: String,
    pub started_at_unix_ms: u64,
    pub agent_version: String,
    pub pid: Option<u32>,
    pub exec: String,
    pub args: Vec<String>,
    pub port: u16,
}

pub async fn write_run_json(dir: &Path, info: &RunInfo) -> anyhow::Result<()> {
    let path = dir.join("run.json");
    let tmp = dir.join("run.json.tmp");
    let data = serde_json::to_vec_pretty(info).context("serialize run.json")?;
    tokio::fs::write(&tmp, &data).await.context("write run.json.tmp")?;
    tokio::fs::rename(&tmp, &path)
        .await
        .context("persist run.json")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(with_aot: bool) -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(paths::SERVER_JAR), b"jar").unwrap();
        std::fs::write(tmp.path().join(paths::ASSETS_PACK), b"assets").unwrap();
        if with_aot {
            std::fs::write(tmp.path().join(paths::AOT_CACHE), b"aot").unwrap();
        }
        tmp
    }

    #[test]
    fn missing_jar_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(paths::ASSETS_PACK), b"assets").unwrap();
        let err = build_launch_plan(tmp.path(), &StartupSettings::default(), "", 5520).unwrap_err();
        assert!(err.to_string().contains(paths::SERVER_JAR));
    }

    #[test]
    fn full_line_with_aot_and_memory() {
        let tmp = fixture(true);
        let plan = build_launch_plan(tmp.path(), &StartupSettings::default(), "", 5520).unwrap();
        assert_eq!(plan.exec, "java");
        assert_eq!(
            plan.args,
            vec![
                "-XX:AOTCache=HytaleServer.aot",
                "-Xms1024M",
                "-Xmx4096M",
                "-jar",
                "HytaleServer.jar",
                "--assets",
                "Assets.zip",
                "--bind",
                "0.0.0.0:5520",
            ]
        );
    }

    #[test]
    fn custom_memory_flags_win() {
        let tmp = fixture(false);
        let plan =
            build_launch_plan(tmp.path(), &StartupSettings::default(), "-Xmx8192M -Dfoo=bar", 5520)
                .unwrap();
        assert!(!plan.args.iter().any(|a| a.starts_with("-Xms")));
        assert_eq!(plan.args[0], "-Xmx8192M");
        assert_eq!(plan.args[1], "-Dfoo=bar");
    }

    #[test]
    fn aot_disabled_by_settings() {
        let tmp = fixture(true);
        let settings = StartupSettings {
            disable_aot: true,
            ..StartupSettings::default()
        };
        let plan = build_launch_plan(tmp.path(), &settings, "", 5520).unwrap();
        assert!(!plan.args.iter().any(|a| a.starts_with("-XX:AOTCache")));
    }
}
