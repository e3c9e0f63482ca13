//! Device-code authentication automation, driven entirely by scanning the
//! server's console output.
//!
//! The machine is pure state + rules: `observe` maps one console line to a
//! list of [`Effect`]s and the monitor task executes them (sending commands,
//! broadcasting prompts, scheduling the persistence check). Keeping the
//! trigger phrases in one table keeps the overlapping patterns auditable.
//!
//! A missed match leaves the state unchanged; the operator can always drive
//! the flow manually through the command channel. Automation never
//! terminates the process.

use std::path::{Path, PathBuf};
use std::time::Duration;

use hycon_core::{AuthPrompt, AuthState};
use tokio::time::Instant;

use crate::paths;

pub const LOGIN_COMMAND: &str = "/auth login";
pub const STATUS_COMMAND: &str = "/auth status";

/// Ordered persistence-mode candidates tried after a successful login.
pub const PERSISTENCE_MODES: &[&str] = &["encrypted"];

pub const LOGIN_COOLDOWN: Duration = Duration::from_secs(20);
pub const PERSISTENCE_DELAY: Duration = Duration::from_secs(1);
pub const VERIFY_DELAY: Duration = Duration::from_secs(3);

/// Hosts the server prints when asking the operator to complete a device
/// login. Both the in-server flow and the standalone downloader format.
const DEVICE_URL_PREFIXES: &[&str] = &[
    "https://accounts.hytale.com/device",
    "https://oauth.accounts.hytale.com/oauth2/device/verify",
];

const NO_CREDENTIAL_TRIGGERS: &[&str] = &[
    "no credentials configured",
    "no stored credentials",
    "credentials not found",
    "server is not authenticated",
];

const STATUS_UNAUTHENTICATED: &[&str] = &[
    "auth status: unauthenticated",
    "auth status: missing",
    "status: not authenticated",
    "credentials invalid",
    "credentials expired",
];

const LOGIN_SUCCESS: &[&str] = &[
    "authentication successful",
    "successfully authenticated",
    "login successful",
];

const STATUS_AUTHENTICATED: &[&str] = &["auth status: authenticated", "authenticated as "];

const PERSISTENCE_UNRECOGNIZED: &[&str] = &[
    "unknown persistence mode",
    "unrecognized persistence mode",
    "invalid persistence mode",
];

fn contains_any(lower: &str, probes: &[&str]) -> bool {
    probes.iter().any(|p| lower.contains(p))
}

fn trim_url_end(url: &str) -> &str {
    url.trim_end_matches([',', '.', ')', ']', '"', '\''])
}

/// Extract the device-verification URL from a line, if present.
pub fn find_device_url(line: &str) -> Option<String> {
    for prefix in DEVICE_URL_PREFIXES {
        if let Some(start) = line.find(prefix) {
            let url = line[start..].split_whitespace().next().unwrap_or("");
            let url = trim_url_end(url);
            if !url.is_empty() {
                return Some(url.to_string());
            }
        }
    }
    None
}

/// Extract a `user_code` query parameter embedded in the URL, if any.
pub fn find_user_code_param(url: &str) -> Option<String> {
    let (_, rest) = url.split_once("user_code=")?;
    let code = rest.split('&').next().unwrap_or("");
    if code.is_empty() {
        None
    } else {
        Some(code.to_string())
    }
}

fn is_code_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-'
}

/// Extract a separately printed user code (`Enter code: ABCD-1234`).
pub fn find_prompt_code(line: &str) -> Option<String> {
    let rest = line
        .split_once("Enter code:")
        .or_else(|| line.split_once("Authorization code:"))
        .map(|(_, r)| r)?;
    let token = rest.split_whitespace().next().unwrap_or("");
    if token.len() >= 4 && token.chars().all(is_code_char) {
        Some(token.to_string())
    } else {
        None
    }
}

/// What the console monitor should do in response to an observed line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Write a command into the process's stdin, optionally delayed.
    Send { after: Duration, command: String },
    /// Ask the machine for the next persistence command after the delay.
    RequestPersistence { after: Duration },
    /// Surface the URL/code pair to viewers.
    AnnouncePrompt(AuthPrompt),
    /// Tell viewers the login itself succeeded.
    AnnounceSuccess,
    /// Probe the credential artifact after the delay.
    ScheduleVerify { after: Duration },
    /// Emit a synthetic console line.
    Note(String),
    /// A durable credential artifact was found at this path.
    Verified(PathBuf),
}

#[derive(Debug)]
pub struct AuthMachine {
    state: AuthState,
    candidates: Vec<String>,
    next_candidate: usize,
    exhausted: bool,
    pending_url: Option<String>,
    pending_code: Option<String>,
    last_prompt: Option<AuthPrompt>,
    last_login_request: Option<Instant>,
    verified: bool,
}

impl AuthMachine {
    pub fn new() -> Self {
        Self::with_candidates(PERSISTENCE_MODES.iter().map(|s| s.to_string()).collect())
    }

    pub fn with_candidates(candidates: Vec<String>) -> Self {
        Self {
            state: AuthState::Unauthenticated,
            candidates,
            next_candidate: 0,
            exhausted: false,
            pending_url: None,
            pending_code: None,
            last_prompt: None,
            last_login_request: None,
            verified: false,
        }
    }

    /// Used when a persisted credential artifact already exists at start.
    pub fn already_authenticated() -> Self {
        let mut m = Self::new();
        m.state = AuthState::Authenticated;
        m.verified = true;
        m
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn verified(&self) -> bool {
        self.verified
    }

    pub fn persistence_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Evaluate one cleaned console line against the rule table.
    pub fn observe(&mut self, line: &str, now: Instant) -> Vec<Effect> {
        // Echoed operator commands are not server responses.
        if line.trim_start().starts_with('/') {
            return Vec::new();
        }

        let lower = line.to_ascii_lowercase();
        let mut effects = Vec::new();

        if !self.state.is_logged_in() {
            let mut prompt_changed = false;
            if let Some(url) = find_device_url(line) {
                if let Some(code) = find_user_code_param(&url) {
                    self.pending_code = Some(code);
                }
                self.pending_url = Some(url);
                prompt_changed = true;
            }
            if let Some(code) = find_prompt_code(line) {
                self.pending_code = Some(code);
                prompt_changed = true;
            }
            if prompt_changed {
                self.state = AuthState::CodePending;
                if let Some(url) = &self.pending_url {
                    let prompt = AuthPrompt {
                        url: url.clone(),
                        code: self.pending_code.clone(),
                    };
                    // Identical URL+code pairs are broadcast once.
                    if self.last_prompt.as_ref() != Some(&prompt) {
                        self.last_prompt = Some(prompt.clone());
                        effects.push(Effect::AnnouncePrompt(prompt));
                    }
                }
                return effects;
            }
        }

        if contains_any(&lower, LOGIN_SUCCESS) {
            if matches!(
                self.state,
                AuthState::Unauthenticated | AuthState::LoginRequested | AuthState::CodePending
            ) {
                self.state = AuthState::Authenticating;
                self.pending_url = None;
                self.pending_code = None;
                effects.push(Effect::AnnounceSuccess);
                effects.push(Effect::RequestPersistence {
                    after: PERSISTENCE_DELAY,
                });
            }
            return effects;
        }

        if contains_any(&lower, STATUS_AUTHENTICATED) {
            // A status reply short-circuits the whole flow.
            if !matches!(
                self.state,
                AuthState::PersistenceVerifying | AuthState::Authenticated
            ) {
                let was_logged_in = self.state.is_logged_in();
                self.state = AuthState::PersistenceVerifying;
                self.pending_url = None;
                self.pending_code = None;
                if !was_logged_in {
                    effects.push(Effect::AnnounceSuccess);
                }
                effects.push(Effect::ScheduleVerify {
                    after: VERIFY_DELAY,
                });
            }
            return effects;
        }

        if self.state == AuthState::PersistenceRequested && lower.contains("persistence") {
            if contains_any(&lower, PERSISTENCE_UNRECOGNIZED) {
                if !self.exhausted {
                    self.next_candidate += 1;
                    if self.next_candidate >= self.candidates.len() {
                        self.exhausted = true;
                        effects.push(Effect::Note(
                            "auth persistence candidates exhausted; run /auth persistence <mode> manually".to_string(),
                        ));
                    } else {
                        effects.push(Effect::RequestPersistence {
                            after: PERSISTENCE_DELAY,
                        });
                    }
                }
            } else {
                // Anything persistence-related that is not a rejection counts
                // as the acknowledgment.
                self.state = AuthState::PersistenceVerifying;
                effects.push(Effect::ScheduleVerify {
                    after: VERIFY_DELAY,
                });
            }
            return effects;
        }

        if contains_any(&lower, NO_CREDENTIAL_TRIGGERS)
            || contains_any(&lower, STATUS_UNAUTHENTICATED)
        {
            return self.request_login(now);
        }

        effects
    }

    fn request_login(&mut self, now: Instant) -> Vec<Effect> {
        if !matches!(
            self.state,
            AuthState::Unauthenticated | AuthState::LoginRequested
        ) {
            return Vec::new();
        }
        if let Some(prev) = self.last_login_request
            && now.duration_since(prev) < LOGIN_COOLDOWN
        {
            return Vec::new();
        }
        self.last_login_request = Some(now);
        self.state = AuthState::LoginRequested;
        vec![Effect::Send {
            after: Duration::ZERO,
            command: LOGIN_COMMAND.to_string(),
        }]
    }

    /// The next persistence command to issue, advancing into
    /// `PersistenceRequested`. `None` once the candidate list is exhausted.
    pub fn next_persistence_command(&mut self) -> Option<String> {
        if self.exhausted {
            return None;
        }
        let Some(mode) = self.candidates.get(self.next_candidate) else {
            self.exhausted = true;
            return None;
        };
        self.state = AuthState::PersistenceRequested;
        Some(format!("/auth persistence {mode}"))
    }

    /// Filesystem probe decoupling "the server claims success" from
    /// "credentials are actually durable on disk".
    pub fn verify_persistence(&mut self, instance_dir: &Path) -> Vec<Effect> {
        self.state = AuthState::Authenticated;
        match paths::find_credential_artifact(instance_dir) {
            Some(path) => {
                self.verified = true;
                vec![Effect::Verified(path)]
            }
            None => Vec::new(),
        }
    }
}

impl Default for AuthMachine {
    fn default() -> Self {
        Self::new()
    }
}
