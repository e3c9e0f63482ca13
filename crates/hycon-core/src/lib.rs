/// Identifier of a managed server instance.
///
/// Assigned by the web tier (database row id); the agent treats it as opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct InstanceId(pub i64);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Externally visible lifecycle label for an instance.
///
/// NOTE: This label is owned by the caller (web tier), not by the agent. The
/// agent only answers "is the OS process alive"; callers must pair every
/// `start`/`stop` with a label update to keep the two from drifting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Offline,
    Starting,
    Online,
    Stopping,
}

/// Where a console line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleSource {
    Stdout,
    Stderr,
    /// Lines recovered by tailing the instance's own log file.
    LogFile,
    /// Synthetic lines from the agent itself (start/stop/error notices).
    System,
}

impl ConsoleSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::LogFile => "logfile",
            Self::System => "system",
        }
    }
}

/// One rendered console line, sequenced within its instance.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConsoleLine {
    pub seq: u64,
    pub source: ConsoleSource,
    pub text: String,
}

/// Progress of the device-code authentication flow, driven entirely by
/// scanning the server's console output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Unauthenticated,
    /// A login command has been issued; waiting for the server to print the
    /// device URL and user code.
    LoginRequested,
    /// URL/code pair surfaced to operators; waiting for them to complete it.
    CodePending,
    /// The server reported a successful login; persistence not yet requested.
    Authenticating,
    /// A persistence-mode command was issued; waiting for the acknowledgment.
    PersistenceRequested,
    /// Persistence acknowledged (or reported via status); the on-disk
    /// credential artifact is being probed.
    PersistenceVerifying,
    Authenticated,
}

impl AuthState {
    /// True once the login itself has succeeded, regardless of persistence.
    pub fn is_logged_in(self) -> bool {
        matches!(
            self,
            Self::Authenticating
                | Self::PersistenceRequested
                | Self::PersistenceVerifying
                | Self::Authenticated
        )
    }
}

/// The URL/code pair an operator needs to complete a device login.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AuthPrompt {
    pub url: String,
    pub code: Option<String>,
}

/// Point-in-time snapshot of an instance as the agent sees it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstanceStatus {
    pub id: InstanceId,
    pub pid: Option<u32>,
    pub running: bool,
    pub auth: AuthState,
    pub persistence_verified: bool,
}

/// Counters for the per-instance webhook dispatcher. Observability only.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct WebhookDiagnostics {
    pub enqueued_total: u64,
    pub sent_total: u64,
    pub failed_total: u64,
    pub dropped_total: u64,
    pub rate_limited_total: u64,
    pub last_error: Option<String>,
    pub last_error_code: Option<u16>,
    pub last_event_type: Option<String>,
    /// Unix millis of the most recent counter update.
    pub updated_at_unix_ms: Option<u64>,
}
