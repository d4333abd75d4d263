use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub type Result<T> = anyhow::Result<T>;

/// Number of applied event names retained in `SessionState::recent_events`.
pub const RECENT_EVENTS_LIMIT: usize = 30;

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".huntbuddy")
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown mode '{0}' (expected CTF or BOUNTY)")]
    Mode(String),
    #[error("unknown phase '{0}' (expected SCAN, PLAN or EXECUTE)")]
    Phase(String),
    #[error("unknown target type '{0}'")]
    TargetType(String),
    #[error("unknown session event '{0}'")]
    Event(String),
    #[error("unknown dispatch outcome '{0}' (expected success, retryable_failure or hard_failure)")]
    Outcome(String),
    #[error("unknown failure reason '{0}'")]
    FailureReason(String),
}

fn normalize_token(raw: &str) -> String {
    raw.trim().to_ascii_lowercase().replace('-', "_")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    #[default]
    Ctf,
    Bounty,
}

impl Mode {
    pub const ALL: [Mode; 2] = [Mode::Ctf, Mode::Bounty];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ctf => "CTF",
            Self::Bounty => "BOUNTY",
        }
    }
}

impl FromStr for Mode {
    type Err = ParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "ctf" => Ok(Self::Ctf),
            "bounty" => Ok(Self::Bounty),
            _ => Err(ParseError::Mode(s.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse stage of a session. Ordering follows the forward progression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    #[default]
    Scan,
    Plan,
    Execute,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scan => "SCAN",
            Self::Plan => "PLAN",
            Self::Execute => "EXECUTE",
        }
    }
}

impl FromStr for Phase {
    type Err = ParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "scan" => Ok(Self::Scan),
            "plan" => Ok(Self::Plan),
            "execute" => Ok(Self::Execute),
            _ => Err(ParseError::Phase(s.to_string())),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetType {
    WebApi,
    Web3,
    Pwn,
    Rev,
    Crypto,
    Forensics,
    Misc,
    #[default]
    Unknown,
}

impl TargetType {
    pub const ALL: [TargetType; 8] = [
        TargetType::WebApi,
        TargetType::Web3,
        TargetType::Pwn,
        TargetType::Rev,
        TargetType::Crypto,
        TargetType::Forensics,
        TargetType::Misc,
        TargetType::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebApi => "WEB_API",
            Self::Web3 => "WEB3",
            Self::Pwn => "PWN",
            Self::Rev => "REV",
            Self::Crypto => "CRYPTO",
            Self::Forensics => "FORENSICS",
            Self::Misc => "MISC",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl FromStr for TargetType {
    type Err = ParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "web_api" | "web" | "api" => Ok(Self::WebApi),
            "web3" | "smart_contract" => Ok(Self::Web3),
            "pwn" | "binary" => Ok(Self::Pwn),
            "rev" | "reversing" => Ok(Self::Rev),
            "crypto" => Ok(Self::Crypto),
            "forensics" => Ok(Self::Forensics),
            "misc" => Ok(Self::Misc),
            "unknown" => Ok(Self::Unknown),
            _ => Err(ParseError::TargetType(s.to_string())),
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified cause of the most recent failure. `None` means no failure is annotated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    #[default]
    None,
    VerificationMismatch,
    HypothesisStall,
    ContextOverflow,
    ToolingTimeout,
    ExploitChain,
    Environment,
    UnsatClaim,
    StaticDynamicContradiction,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::VerificationMismatch => "verification_mismatch",
            Self::HypothesisStall => "hypothesis_stall",
            Self::ContextOverflow => "context_overflow",
            Self::ToolingTimeout => "tooling_timeout",
            Self::ExploitChain => "exploit_chain",
            Self::Environment => "environment",
            Self::UnsatClaim => "unsat_claim",
            Self::StaticDynamicContradiction => "static_dynamic_contradiction",
        }
    }
}

impl FromStr for FailureReason {
    type Err = ParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "none" => Ok(Self::None),
            "verification_mismatch" => Ok(Self::VerificationMismatch),
            "hypothesis_stall" => Ok(Self::HypothesisStall),
            "context_overflow" => Ok(Self::ContextOverflow),
            "tooling_timeout" => Ok(Self::ToolingTimeout),
            "exploit_chain" => Ok(Self::ExploitChain),
            "environment" => Ok(Self::Environment),
            "unsat_claim" => Ok(Self::UnsatClaim),
            "static_dynamic_contradiction" => Ok(Self::StaticDynamicContradiction),
            _ => Err(ParseError::FailureReason(s.to_string())),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-classified result of a single worker invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    Success,
    RetryableFailure,
    HardFailure,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RetryableFailure => "retryable_failure",
            Self::HardFailure => "hard_failure",
        }
    }
}

impl FromStr for DispatchOutcome {
    type Err = ParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "success" => Ok(Self::Success),
            "retryable_failure" | "retryable" => Ok(Self::RetryableFailure),
            "hard_failure" | "hard" => Ok(Self::HardFailure),
            _ => Err(ParseError::Outcome(s.to_string())),
        }
    }
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named lifecycle events accepted by the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    ScanCompleted,
    PlanCompleted,
    CandidateFound,
    VerifySuccess,
    VerifyFail,
    NoNewEvidence,
    SamePayloadRepeat,
    NewEvidence,
    ReadonlyInconclusive,
    ScopeConfirmed,
    ContextLengthExceeded,
    Timeout,
    ResetLoop,
}

impl SessionEvent {
    pub const ALL: [SessionEvent; 13] = [
        SessionEvent::ScanCompleted,
        SessionEvent::PlanCompleted,
        SessionEvent::CandidateFound,
        SessionEvent::VerifySuccess,
        SessionEvent::VerifyFail,
        SessionEvent::NoNewEvidence,
        SessionEvent::SamePayloadRepeat,
        SessionEvent::NewEvidence,
        SessionEvent::ReadonlyInconclusive,
        SessionEvent::ScopeConfirmed,
        SessionEvent::ContextLengthExceeded,
        SessionEvent::Timeout,
        SessionEvent::ResetLoop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScanCompleted => "scan_completed",
            Self::PlanCompleted => "plan_completed",
            Self::CandidateFound => "candidate_found",
            Self::VerifySuccess => "verify_success",
            Self::VerifyFail => "verify_fail",
            Self::NoNewEvidence => "no_new_evidence",
            Self::SamePayloadRepeat => "same_payload_repeat",
            Self::NewEvidence => "new_evidence",
            Self::ReadonlyInconclusive => "readonly_inconclusive",
            Self::ScopeConfirmed => "scope_confirmed",
            Self::ContextLengthExceeded => "context_length_exceeded",
            Self::Timeout => "timeout",
            Self::ResetLoop => "reset_loop",
        }
    }
}

impl FromStr for SessionEvent {
    type Err = ParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let token = normalize_token(s);
        Self::ALL
            .into_iter()
            .find(|event| event.as_str() == token)
            .ok_or_else(|| ParseError::Event(s.to_string()))
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rolling outcome statistics for one worker identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerHealth {
    pub success_count: u32,
    pub retryable_failure_count: u32,
    pub hard_failure_count: u32,
    pub consecutive_failure_count: u32,
    pub last_outcome_at: Option<DateTime<Utc>>,
}

impl WorkerHealth {
    pub fn record(&mut self, outcome: DispatchOutcome, at: DateTime<Utc>) {
        match outcome {
            DispatchOutcome::Success => {
                self.success_count = self.success_count.saturating_add(1);
                self.consecutive_failure_count = 0;
            }
            DispatchOutcome::RetryableFailure => {
                self.retryable_failure_count = self.retryable_failure_count.saturating_add(1);
                self.consecutive_failure_count = self.consecutive_failure_count.saturating_add(1);
            }
            DispatchOutcome::HardFailure => {
                self.hard_failure_count = self.hard_failure_count.saturating_add(1);
                self.consecutive_failure_count = self.consecutive_failure_count.saturating_add(1);
            }
        }
        self.last_outcome_at = Some(at);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelHealth {
    pub unhealthy_since: DateTime<Utc>,
    #[serde(default)]
    pub reason: String,
}

/// Durable per-session record. Unknown or missing fields fall back to defaults so
/// records written by older builds still load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    pub mode: Mode,
    pub phase: Phase,
    pub target_type: TargetType,
    pub scope_confirmed: bool,
    pub latest_candidate: String,
    pub latest_verified: String,
    pub candidate_pending_verification: bool,
    pub hypothesis: String,
    pub alternatives: Vec<String>,
    pub no_new_evidence_loops: u32,
    pub same_payload_loops: u32,
    pub verify_fail_count: u32,
    pub readonly_inconclusive_count: u32,
    pub context_fail_count: u32,
    pub timeout_fail_count: u32,
    pub recent_events: Vec<String>,
    pub last_task_category: String,
    pub last_task_route: String,
    pub last_task_subagent: String,
    pub last_task_model: Option<String>,
    pub last_task_variant: Option<String>,
    pub last_dispatch_at: Option<DateTime<Utc>>,
    pub pending_task_failover: bool,
    pub task_failover_count: u32,
    pub dispatch_health_by_subagent: BTreeMap<String, WorkerHealth>,
    pub model_health_by_model: BTreeMap<String, ModelHealth>,
    pub last_failure_reason: FailureReason,
    pub last_failure_summary: String,
    pub last_failed_route: String,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub failure_reason_counts: BTreeMap<FailureReason, u32>,
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(Mode::default())
    }
}

impl SessionState {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            phase: Phase::Scan,
            target_type: TargetType::Unknown,
            scope_confirmed: false,
            latest_candidate: String::new(),
            latest_verified: String::new(),
            candidate_pending_verification: false,
            hypothesis: String::new(),
            alternatives: Vec::new(),
            no_new_evidence_loops: 0,
            same_payload_loops: 0,
            verify_fail_count: 0,
            readonly_inconclusive_count: 0,
            context_fail_count: 0,
            timeout_fail_count: 0,
            recent_events: Vec::new(),
            last_task_category: String::new(),
            last_task_route: String::new(),
            last_task_subagent: String::new(),
            last_task_model: None,
            last_task_variant: None,
            last_dispatch_at: None,
            pending_task_failover: false,
            task_failover_count: 0,
            dispatch_health_by_subagent: BTreeMap::new(),
            model_health_by_model: BTreeMap::new(),
            last_failure_reason: FailureReason::None,
            last_failure_summary: String::new(),
            last_failed_route: String::new(),
            last_failure_at: None,
            failure_reason_counts: BTreeMap::new(),
            last_updated_at: None,
        }
    }

    /// Append an event name, dropping the oldest entries beyond `RECENT_EVENTS_LIMIT`.
    pub fn push_recent_event(&mut self, name: &str) {
        self.recent_events.push(name.to_string());
        let overflow = self.recent_events.len().saturating_sub(RECENT_EVENTS_LIMIT);
        if overflow > 0 {
            self.recent_events.drain(..overflow);
        }
    }

    pub fn note_failure(
        &mut self,
        reason: FailureReason,
        route: &str,
        summary: &str,
        at: DateTime<Utc>,
    ) {
        self.last_failure_reason = reason;
        self.last_failed_route = route.trim().to_string();
        self.last_failure_summary = summary.trim().to_string();
        self.last_failure_at = Some(at);
        let count = self.failure_reason_counts.entry(reason).or_insert(0);
        *count = count.saturating_add(1);
    }

    /// Clears the last-failure annotation; the histogram is cumulative and kept.
    pub fn clear_failure(&mut self) {
        self.last_failure_reason = FailureReason::None;
        self.last_failed_route.clear();
        self.last_failure_summary.clear();
        self.last_failure_at = None;
    }

    pub fn clear_task_failover(&mut self) {
        self.pending_task_failover = false;
        self.task_failover_count = 0;
    }

    pub fn worker_health(&self, worker: &str) -> Option<&WorkerHealth> {
        self.dispatch_health_by_subagent.get(worker)
    }
}

/// Receives a snapshot after every persisted state change.
///
/// Implementations must not call back into the store that notifies them.
pub trait StateObserver: Send + Sync {
    fn state_changed(&self, session_id: &str, state: &SessionState) -> Result<()>;

    /// Non-fatal diagnostic from the notifying component.
    fn warn(&self, msg: &str) {
        eprintln!("[huntbuddy WARN] {msg}");
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub dispatch: DispatchConfig,
    pub routing: RoutingConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Mode assigned to sessions created on first access.
    pub default_mode: Mode,
    /// State table file name, relative to the runtime dir unless absolute.
    pub state_file: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            default_mode: Mode::Ctf,
            state_file: "session-state.json".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn state_path(&self, workspace: &Path) -> PathBuf {
        let path = Path::new(&self.state_file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            runtime_dir(workspace).join(path)
        }
    }
}

/// Alternate execution profile of a worker bound to a different model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelVariant {
    pub variant: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub max_failover_retries: u32,
    pub operational_feedback_enabled: bool,
    pub operational_feedback_consecutive_failures: u32,
    pub model_failover_enabled: bool,
    pub model_cooldown_ms: u64,
    /// Workers exempt from health-based substitution.
    pub pinned_workers: Vec<String>,
    /// Primary model of each base worker.
    pub worker_models: BTreeMap<String, String>,
    /// Ordered fallback profiles per base worker.
    pub model_variants: BTreeMap<String, Vec<ModelVariant>>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_failover_retries: 2,
            operational_feedback_enabled: false,
            operational_feedback_consecutive_failures: 2,
            model_failover_enabled: false,
            model_cooldown_ms: 300_000,
            pinned_workers: vec![
                "ctf-verify".to_string(),
                "ctf-decoy-check".to_string(),
                "bounty-scope".to_string(),
                "md-scribe".to_string(),
            ],
            worker_models: BTreeMap::new(),
            model_variants: BTreeMap::new(),
        }
    }
}

impl DispatchConfig {
    pub fn is_pinned(&self, worker: &str) -> bool {
        self.pinned_workers.iter().any(|pinned| pinned == worker)
    }
}

/// Route and worker tables for one mode, keyed by target type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeRouting {
    pub scan: BTreeMap<TargetType, String>,
    pub plan: BTreeMap<TargetType, String>,
    pub execute: BTreeMap<TargetType, String>,
    pub stuck: BTreeMap<TargetType, String>,
    pub failover: BTreeMap<TargetType, String>,
    pub capabilities: BTreeMap<TargetType, Vec<String>>,
}

impl ModeRouting {
    /// Every route name referenced by the phase, stuck and failover tables.
    pub fn route_names(&self) -> impl Iterator<Item = &str> {
        self.scan
            .values()
            .chain(self.plan.values())
            .chain(self.execute.values())
            .chain(self.stuck.values())
            .chain(self.failover.values())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub ctf: ModeRouting,
    pub bounty: ModeRouting,
}

impl RoutingConfig {
    pub fn for_mode(&self, mode: Mode) -> &ModeRouting {
        match mode {
            Mode::Ctf => &self.ctf,
            Mode::Bounty => &self.bounty,
        }
    }

    pub fn failover_worker(&self, mode: Mode, target: TargetType) -> Option<&str> {
        self.for_mode(mode)
            .failover
            .get(&target)
            .map(String::as_str)
            .filter(|worker| !worker.trim().is_empty())
    }

    pub fn capable_workers(&self, mode: Mode, target: TargetType) -> &[String] {
        self.for_mode(mode)
            .capabilities
            .get(&target)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

fn uniform(route: &str) -> BTreeMap<TargetType, String> {
    TargetType::ALL
        .into_iter()
        .map(|target| (target, route.to_string()))
        .collect()
}

fn table(entries: &[(TargetType, &str)]) -> BTreeMap<TargetType, String> {
    entries
        .iter()
        .map(|(target, route)| (*target, route.to_string()))
        .collect()
}

fn capability_table(entries: &[(TargetType, &[&str])]) -> BTreeMap<TargetType, Vec<String>> {
    entries
        .iter()
        .map(|(target, workers)| (*target, workers.iter().map(|w| w.to_string()).collect()))
        .collect()
}

impl Default for RoutingConfig {
    fn default() -> Self {
        use TargetType::*;
        let ctf_specialists = table(&[
            (WebApi, "ctf-web"),
            (Web3, "ctf-web3"),
            (Pwn, "ctf-pwn"),
            (Rev, "ctf-rev"),
            (Crypto, "ctf-crypto"),
            (Forensics, "ctf-forensics"),
            (Misc, "ctf-explore"),
            (Unknown, "ctf-explore"),
        ]);
        let ctf = ModeRouting {
            scan: ctf_specialists.clone(),
            plan: uniform("deep-plan"),
            execute: ctf_specialists,
            stuck: uniform("ctf-research"),
            failover: table(&[
                (WebApi, "ctf-research"),
                (Web3, "ctf-research"),
                (Pwn, "ctf-solve"),
                (Rev, "ctf-solve"),
                (Crypto, "ctf-research"),
                (Forensics, "ctf-solve"),
                (Misc, "ctf-research"),
                (Unknown, "ctf-research"),
            ]),
            capabilities: capability_table(&[
                (WebApi, &["ctf-web", "ctf-research", "ctf-solve"]),
                (Web3, &["ctf-web3", "ctf-research", "ctf-solve"]),
                (Pwn, &["ctf-pwn", "ctf-rev", "ctf-solve"]),
                (Rev, &["ctf-rev", "ctf-pwn", "ctf-solve"]),
                (Crypto, &["ctf-crypto", "ctf-research", "ctf-solve"]),
                (Forensics, &["ctf-forensics", "ctf-explore", "ctf-solve"]),
                (Misc, &["ctf-explore", "ctf-solve"]),
                (Unknown, &["ctf-explore", "ctf-solve"]),
            ]),
        };
        let bounty = ModeRouting {
            scan: uniform("bounty-scope"),
            plan: uniform("deep-plan"),
            execute: uniform("bounty-triage"),
            stuck: uniform("bounty-research"),
            failover: uniform("bounty-research"),
            capabilities: TargetType::ALL
                .into_iter()
                .map(|target| {
                    (
                        target,
                        vec!["bounty-triage".to_string(), "bounty-research".to_string()],
                    )
                })
                .collect(),
        };
        Self { ctf, bounty }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
}

impl AppConfig {
    pub fn user_settings_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".huntbuddy/settings.json"))
    }

    pub fn project_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    pub fn project_local_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.local.json")
    }

    pub fn toml_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("config.toml")
    }

    /// Merge defaults, `config.toml`, user settings, project settings and local
    /// overrides, later layers winning key by key.
    pub fn load(workspace: &Path) -> Result<Self> {
        Self::load_layers(workspace, Self::user_settings_path())
    }

    fn load_layers(workspace: &Path, user_settings: Option<PathBuf>) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        let toml_path = Self::toml_path(workspace);
        if toml_path.exists() {
            let raw = fs::read_to_string(&toml_path)?;
            let value: serde_json::Value = toml::from_str(&raw)?;
            merge_json_value(&mut merged, &value);
        }

        let mut paths = Vec::new();
        if let Some(user) = user_settings {
            paths.push(user);
        }
        paths.push(Self::project_settings_path(workspace));
        paths.push(Self::project_local_settings_path(workspace));

        for path in paths {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(path)?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            merge_json_value(&mut merged, &value);
        }

        Ok(serde_json::from_value(merged)?)
    }

    pub fn ensure(workspace: &Path) -> Result<Self> {
        let path = Self::project_settings_path(workspace);
        if path.exists()
            || Self::project_local_settings_path(workspace).exists()
            || Self::toml_path(workspace).exists()
            || Self::user_settings_path().is_some_and(|p| p.exists())
        {
            return Self::load(workspace);
        }
        let cfg = Self::default();
        cfg.save(workspace)?;
        Ok(cfg)
    }

    pub fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::project_settings_path(workspace);
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid config path"))?,
        )?;
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

fn merge_json_value(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_obj), serde_json::Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_json_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn outcome_strategy() -> impl Strategy<Value = DispatchOutcome> {
        prop_oneof![
            Just(DispatchOutcome::Success),
            Just(DispatchOutcome::RetryableFailure),
            Just(DispatchOutcome::HardFailure),
        ]
    }

    proptest! {
        #[test]
        fn success_always_resets_failure_streak(
            history in prop::collection::vec(outcome_strategy(), 0..40)
        ) {
            let mut health = WorkerHealth::default();
            for outcome in history {
                health.record(outcome, Utc::now());
            }
            health.record(DispatchOutcome::Success, Utc::now());
            prop_assert_eq!(health.consecutive_failure_count, 0);
        }

        #[test]
        fn recent_events_never_exceed_limit(count in 0usize..120) {
            let mut state = SessionState::default();
            for i in 0..count {
                state.push_recent_event(&format!("event-{i}"));
            }
            prop_assert!(state.recent_events.len() <= RECENT_EVENTS_LIMIT);
            if count > 0 {
                let newest = format!("event-{}", count - 1);
                prop_assert_eq!(state.recent_events.last(), Some(&newest));
            }
        }

        #[test]
        fn partial_dispatch_overlay_keeps_untouched_defaults(
            retries in 0u32..10,
            cooldown_ms in prop::option::of(0u64..1_000_000),
            feedback in any::<bool>(),
        ) {
            let mut overlay = json!({
                "dispatch": {
                    "max_failover_retries": retries,
                    "operational_feedback_enabled": feedback,
                }
            });
            if let Some(cooldown_ms) = cooldown_ms {
                overlay["dispatch"]["model_cooldown_ms"] = json!(cooldown_ms);
            }
            let mut merged = serde_json::to_value(AppConfig::default()).unwrap();
            merge_json_value(&mut merged, &overlay);
            let cfg: AppConfig = serde_json::from_value(merged).unwrap();
            let defaults = DispatchConfig::default();

            prop_assert_eq!(cfg.dispatch.max_failover_retries, retries);
            prop_assert_eq!(cfg.dispatch.operational_feedback_enabled, feedback);
            prop_assert_eq!(
                cfg.dispatch.model_cooldown_ms,
                cooldown_ms.unwrap_or(defaults.model_cooldown_ms)
            );
            prop_assert_eq!(cfg.dispatch.pinned_workers, defaults.pinned_workers);
            prop_assert_eq!(cfg.routing, RoutingConfig::default());
        }
    }

    #[test]
    fn event_names_parse_back() {
        for event in SessionEvent::ALL {
            assert_eq!(event.as_str().parse::<SessionEvent>(), Ok(event));
        }
        assert_eq!(
            "Scan-Completed".parse::<SessionEvent>(),
            Ok(SessionEvent::ScanCompleted)
        );
        assert!(matches!(
            "launch_rockets".parse::<SessionEvent>(),
            Err(ParseError::Event(_))
        ));
    }

    #[test]
    fn enum_serde_names_match_display() {
        assert_eq!(serde_json::to_value(TargetType::WebApi).unwrap(), json!("WEB_API"));
        assert_eq!(serde_json::to_value(Mode::Bounty).unwrap(), json!("BOUNTY"));
        assert_eq!(
            serde_json::to_value(FailureReason::ToolingTimeout).unwrap(),
            json!("tooling_timeout")
        );
        assert_eq!("bounty".parse::<Mode>(), Ok(Mode::Bounty));
        assert_eq!("web".parse::<TargetType>(), Ok(TargetType::WebApi));
        assert_eq!("hard".parse::<DispatchOutcome>(), Ok(DispatchOutcome::HardFailure));
    }

    #[test]
    fn worker_health_counts_each_outcome() {
        let mut health = WorkerHealth::default();
        health.record(DispatchOutcome::HardFailure, Utc::now());
        health.record(DispatchOutcome::RetryableFailure, Utc::now());
        assert_eq!(health.consecutive_failure_count, 2);
        assert_eq!(health.hard_failure_count, 1);
        assert_eq!(health.retryable_failure_count, 1);
        health.record(DispatchOutcome::Success, Utc::now());
        assert_eq!(health.success_count, 1);
        assert_eq!(health.consecutive_failure_count, 0);
        assert!(health.last_outcome_at.is_some());
    }

    #[test]
    fn clear_failure_keeps_histogram() {
        let mut state = SessionState::default();
        state.note_failure(FailureReason::ToolingTimeout, "ctf-web", "nmap hung", Utc::now());
        state.note_failure(FailureReason::ToolingTimeout, "ctf-web", "again", Utc::now());
        state.clear_failure();
        assert_eq!(state.last_failure_reason, FailureReason::None);
        assert!(state.last_failed_route.is_empty());
        assert!(state.last_failure_at.is_none());
        assert_eq!(state.failure_reason_counts[&FailureReason::ToolingTimeout], 2);
    }

    #[test]
    fn session_state_tolerates_missing_fields() {
        let state: SessionState =
            serde_json::from_value(json!({"mode": "BOUNTY", "phase": "PLAN"})).unwrap();
        assert_eq!(state.mode, Mode::Bounty);
        assert_eq!(state.phase, Phase::Plan);
        assert_eq!(state.target_type, TargetType::Unknown);
        assert!(state.dispatch_health_by_subagent.is_empty());
    }

    #[test]
    fn failure_histogram_serializes_with_reason_keys() {
        let mut state = SessionState::default();
        state.note_failure(FailureReason::HypothesisStall, "", "", Utc::now());
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["failure_reason_counts"]["hypothesis_stall"], json!(1));
        let back: SessionState = serde_json::from_value(value).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn default_routing_covers_every_target() {
        let routing = RoutingConfig::default();
        for mode in Mode::ALL {
            for target in TargetType::ALL {
                assert!(routing.failover_worker(mode, target).is_some());
                assert!(!routing.capable_workers(mode, target).is_empty());
                let tables = routing.for_mode(mode);
                assert!(tables.scan.contains_key(&target));
                assert!(tables.execute.contains_key(&target));
            }
        }
    }

    #[test]
    fn load_merges_toml_and_local_overrides() {
        let workspace = tempfile::tempdir().expect("workspace");
        let dir = runtime_dir(workspace.path());
        fs::create_dir_all(&dir).expect("runtime dir");
        fs::write(
            dir.join("config.toml"),
            "[dispatch]\nmax_failover_retries = 5\noperational_feedback_enabled = true\n",
        )
        .expect("toml");
        fs::write(
            dir.join("settings.local.json"),
            r#"{"dispatch":{"max_failover_retries":3},"store":{"default_mode":"BOUNTY"},
               "routing":{"ctf":{"failover":{"PWN":"ctf-pwn-backup"}}}}"#,
        )
        .expect("local settings");

        let cfg = AppConfig::load_layers(workspace.path(), None).expect("load");
        assert_eq!(cfg.dispatch.max_failover_retries, 3);
        assert!(cfg.dispatch.operational_feedback_enabled);
        assert_eq!(cfg.store.default_mode, Mode::Bounty);
        assert_eq!(
            cfg.routing.failover_worker(Mode::Ctf, TargetType::Pwn),
            Some("ctf-pwn-backup")
        );
        // Untouched entries of a partially overridden table survive the merge.
        assert_eq!(
            cfg.routing.failover_worker(Mode::Ctf, TargetType::Rev),
            Some("ctf-solve")
        );
    }

    #[test]
    fn user_settings_sit_below_project_layers() {
        let workspace = tempfile::tempdir().expect("workspace");
        let home = tempfile::tempdir().expect("home");
        let user = home.path().join("settings.json");
        fs::write(
            &user,
            r#"{"dispatch":{"model_cooldown_ms":1234,"max_failover_retries":7}}"#,
        )
        .expect("user settings");
        let dir = runtime_dir(workspace.path());
        fs::create_dir_all(&dir).expect("runtime dir");
        fs::write(
            dir.join("settings.json"),
            r#"{"dispatch":{"max_failover_retries":1}}"#,
        )
        .expect("project settings");

        let cfg = AppConfig::load_layers(workspace.path(), Some(user)).expect("load");
        assert_eq!(cfg.dispatch.model_cooldown_ms, 1234);
        assert_eq!(cfg.dispatch.max_failover_retries, 1);
    }

    #[test]
    fn store_config_resolves_relative_state_file() {
        let cfg = StoreConfig::default();
        let path = cfg.state_path(Path::new("/work"));
        assert_eq!(path, PathBuf::from("/work/.huntbuddy/session-state.json"));
    }
}
