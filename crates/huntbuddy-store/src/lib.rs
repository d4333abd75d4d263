use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use huntbuddy_core::{
    DispatchOutcome, FailureReason, Mode, ModelHealth, Phase, RECENT_EVENTS_LIMIT, SessionEvent,
    SessionState, StateObserver, StoreConfig, TargetType,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Version written into the table envelope. Version 1 tables were a bare
/// `{session_id: record}` map with camelCase field names.
pub const SCHEMA_VERSION: u64 = 2;

#[derive(thiserror::Error, Debug)]
pub enum RecordError {
    #[error("session id is empty")]
    EmptyId,
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record failed validation: {0}")]
    Invalid(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct TableEnvelope<'a> {
    schema_version: u64,
    sessions: &'a BTreeMap<String, SessionState>,
}

/// Result of decoding a durable table: the surviving records plus one message
/// per record that was dropped.
#[derive(Debug, Default)]
pub struct DecodedTable {
    pub sessions: BTreeMap<String, SessionState>,
    pub dropped: Vec<String>,
}

/// Owns every session record of the process. All reads hand out clones; every
/// mutator writes the whole table through to disk before notifying the observer.
pub struct SessionStore {
    path: Option<PathBuf>,
    default_mode: Mode,
    sessions: Mutex<BTreeMap<String, SessionState>>,
    persistence_degraded: AtomicBool,
    observer: Option<Arc<dyn StateObserver>>,
    observer_degraded: AtomicBool,
}

impl SessionStore {
    /// Open the table at `path`. A missing file starts empty; an unreadable or
    /// corrupt file also starts empty after a warning.
    pub fn open(path: impl Into<PathBuf>, default_mode: Mode) -> Self {
        Self::build(Some(path.into()), default_mode, None)
    }

    pub fn from_config(
        workspace: &Path,
        cfg: &StoreConfig,
        observer: Option<Arc<dyn StateObserver>>,
    ) -> Self {
        Self::build(Some(cfg.state_path(workspace)), cfg.default_mode, observer)
    }

    /// Store without a durable table. Nothing is written and persistence is not
    /// reported as degraded.
    pub fn in_memory(default_mode: Mode) -> Self {
        Self::build(None, default_mode, None)
    }

    pub fn with_observer(mut self, observer: Arc<dyn StateObserver>) -> Self {
        self.observer = Some(observer);
        self.observer_degraded.store(false, Ordering::SeqCst);
        self
    }

    fn build(
        path: Option<PathBuf>,
        default_mode: Mode,
        observer: Option<Arc<dyn StateObserver>>,
    ) -> Self {
        let store = Self {
            path,
            default_mode,
            sessions: Mutex::new(BTreeMap::new()),
            persistence_degraded: AtomicBool::new(false),
            observer,
            observer_degraded: AtomicBool::new(false),
        };
        if let Some(path) = store.path.clone() {
            let loaded = store.load_from(&path);
            *store.lock() = loaded;
        }
        store
    }

    fn load_from(&self, path: &Path) -> BTreeMap<String, SessionState> {
        if !path.exists() {
            return BTreeMap::new();
        }
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) => {
                self.warn(&format!(
                    "could not read session table {}: {err}; starting empty",
                    path.display()
                ));
                return BTreeMap::new();
            }
        };
        match decode_table(&raw) {
            Ok(decoded) => {
                for message in &decoded.dropped {
                    self.warn(message);
                }
                decoded.sessions
            }
            Err(err) => {
                self.warn(&format!(
                    "session table {} is corrupt: {err:#}; starting empty",
                    path.display()
                ));
                BTreeMap::new()
            }
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn default_mode(&self) -> Mode {
        self.default_mode
    }

    pub fn is_persistence_degraded(&self) -> bool {
        self.persistence_degraded.load(Ordering::SeqCst)
    }

    pub fn is_observer_degraded(&self) -> bool {
        self.observer_degraded.load(Ordering::SeqCst)
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn snapshot_all(&self) -> BTreeMap<String, SessionState> {
        self.lock().clone()
    }

    /// Existing record, or a fresh one in the default mode. Creation alone is not
    /// persisted; the record reaches disk with its first mutation.
    pub fn get(&self, session_id: &str) -> SessionState {
        let mut sessions = self.lock();
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState::new(self.default_mode))
            .clone()
    }

    pub fn set_mode(&self, session_id: &str, mode: Mode) -> SessionState {
        self.update(session_id, |state, _| state.mode = mode)
    }

    pub fn set_target_type(&self, session_id: &str, target: TargetType) -> SessionState {
        self.update(session_id, |state, _| state.target_type = target)
    }

    pub fn set_hypothesis(&self, session_id: &str, hypothesis: &str) -> SessionState {
        self.update(session_id, |state, _| {
            state.hypothesis = hypothesis.trim().to_string()
        })
    }

    pub fn set_alternatives<S: AsRef<str>>(
        &self,
        session_id: &str,
        alternatives: &[S],
    ) -> SessionState {
        let cleaned = clean_alternatives(alternatives.iter().map(|item| item.as_ref()));
        self.update(session_id, |state, _| state.alternatives = cleaned)
    }

    pub fn set_candidate(&self, session_id: &str, candidate: &str) -> SessionState {
        self.update(session_id, |state, _| {
            state.latest_candidate = candidate.trim().to_string();
            state.candidate_pending_verification = !state.latest_candidate.is_empty();
        })
    }

    pub fn set_verified(&self, session_id: &str, verified: &str) -> SessionState {
        self.update(session_id, |state, _| {
            state.latest_verified = verified.trim().to_string()
        })
    }

    pub fn record_failure(
        &self,
        session_id: &str,
        reason: FailureReason,
        route: &str,
        summary: &str,
    ) -> SessionState {
        self.update(session_id, |state, now| {
            state.note_failure(reason, route, summary, now)
        })
    }

    pub fn clear_failure(&self, session_id: &str) -> SessionState {
        self.update(session_id, |state, _| state.clear_failure())
    }

    pub fn set_last_task_category(&self, session_id: &str, category: &str) -> SessionState {
        self.update(session_id, |state, _| {
            state.last_task_category = category.trim().to_string()
        })
    }

    /// Record who is about to be invoked. `last_task_subagent` keys the health
    /// bucket updated by the following `record_dispatch_outcome`.
    pub fn set_last_dispatch(
        &self,
        session_id: &str,
        route: &str,
        worker: &str,
        model: Option<&str>,
        variant: Option<&str>,
    ) -> SessionState {
        self.update(session_id, |state, now| {
            state.last_task_route = route.trim().to_string();
            state.last_task_subagent = worker.trim().to_string();
            state.last_task_model = non_empty(model);
            state.last_task_variant = non_empty(variant);
            state.last_dispatch_at = Some(now);
        })
    }

    /// Fold an outcome into the health bucket of the last dispatched worker.
    /// Without a recorded dispatch this is a no-op.
    pub fn record_dispatch_outcome(&self, session_id: &str, outcome: DispatchOutcome) -> SessionState {
        let current = self.get(session_id);
        if current.last_task_subagent.is_empty() {
            return current;
        }
        self.update(session_id, |state, now| {
            if state.last_task_subagent.is_empty() {
                return;
            }
            state
                .dispatch_health_by_subagent
                .entry(state.last_task_subagent.clone())
                .or_default()
                .record(outcome, now);
        })
    }

    pub fn trigger_task_failover(&self, session_id: &str) -> SessionState {
        self.update(session_id, |state, _| state.pending_task_failover = true)
    }

    /// Call once per failover actually used.
    pub fn consume_task_failover(&self, session_id: &str) -> SessionState {
        self.update(session_id, |state, _| {
            state.pending_task_failover = false;
            state.task_failover_count = state.task_failover_count.saturating_add(1);
        })
    }

    pub fn clear_task_failover(&self, session_id: &str) -> SessionState {
        self.update(session_id, |state, _| state.clear_task_failover())
    }

    pub fn mark_model_unhealthy(&self, session_id: &str, model: &str, reason: &str) -> SessionState {
        self.update(session_id, |state, now| {
            state.model_health_by_model.insert(
                model.trim().to_string(),
                ModelHealth {
                    unhealthy_since: now,
                    reason: reason.trim().to_string(),
                },
            );
        })
    }

    pub fn mark_model_healthy(&self, session_id: &str, model: &str) -> SessionState {
        self.update(session_id, |state, _| {
            state.model_health_by_model.remove(model.trim());
        })
    }

    pub fn apply_event(&self, session_id: &str, event: SessionEvent) -> SessionState {
        self.update(session_id, |state, now| apply_session_event(state, event, now))
    }

    fn update<F>(&self, session_id: &str, mutate: F) -> SessionState
    where
        F: FnOnce(&mut SessionState, DateTime<Utc>),
    {
        let now = Utc::now();
        let snapshot = {
            let mut sessions = self.lock();
            let state = sessions
                .entry(session_id.to_string())
                .or_insert_with(|| SessionState::new(self.default_mode));
            mutate(state, now);
            state.last_updated_at = Some(now);
            let snapshot = state.clone();
            self.persist_locked(&sessions);
            snapshot
        };
        self.notify(session_id, &snapshot);
        snapshot
    }

    fn persist_locked(&self, sessions: &BTreeMap<String, SessionState>) {
        let Some(path) = &self.path else {
            return;
        };
        if self.is_persistence_degraded() {
            return;
        }
        if let Err(err) = write_table(path, sessions) {
            self.persistence_degraded.store(true, Ordering::SeqCst);
            self.warn(&format!(
                "session state persistence disabled after write failure on {}: {err:#}",
                path.display()
            ));
        }
    }

    fn notify(&self, session_id: &str, snapshot: &SessionState) {
        let Some(observer) = &self.observer else {
            return;
        };
        if self.is_observer_degraded() {
            return;
        }
        if let Err(err) = observer.state_changed(session_id, snapshot) {
            self.observer_degraded.store(true, Ordering::SeqCst);
            self.warn(&format!(
                "state observer disabled after notification failure: {err:#}"
            ));
        }
    }

    fn warn(&self, msg: &str) {
        match &self.observer {
            Some(observer) if !self.is_observer_degraded() => observer.warn(msg),
            _ => eprintln!("[huntbuddy WARN] {msg}"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, SessionState>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// State machine transition for one lifecycle event.
pub fn apply_session_event(state: &mut SessionState, event: SessionEvent, at: DateTime<Utc>) {
    state.push_recent_event(event.as_str());
    let route = state.last_task_route.clone();
    match event {
        SessionEvent::ScanCompleted => {
            if state.phase == Phase::Scan {
                state.phase = Phase::Plan;
            }
        }
        SessionEvent::PlanCompleted => {
            if state.phase < Phase::Execute {
                state.phase = Phase::Execute;
            }
        }
        SessionEvent::CandidateFound => {
            state.candidate_pending_verification = true;
        }
        SessionEvent::VerifySuccess => {
            state.candidate_pending_verification = false;
            if state.latest_verified.is_empty() && !state.latest_candidate.is_empty() {
                state.latest_verified = state.latest_candidate.clone();
            }
            state.clear_failure();
            state.verify_fail_count = 0;
            state.no_new_evidence_loops = 0;
            state.same_payload_loops = 0;
            state.clear_task_failover();
        }
        SessionEvent::VerifyFail => {
            state.candidate_pending_verification = false;
            state.verify_fail_count = state.verify_fail_count.saturating_add(1);
            state.no_new_evidence_loops = state.no_new_evidence_loops.saturating_add(1);
            state.note_failure(
                FailureReason::VerificationMismatch,
                &route,
                "candidate failed verification",
                at,
            );
        }
        SessionEvent::NoNewEvidence => {
            state.no_new_evidence_loops = state.no_new_evidence_loops.saturating_add(1);
            state.note_failure(
                FailureReason::HypothesisStall,
                &route,
                "no new evidence",
                at,
            );
        }
        SessionEvent::SamePayloadRepeat => {
            state.same_payload_loops = state.same_payload_loops.saturating_add(1);
            state.note_failure(
                FailureReason::HypothesisStall,
                &route,
                "same payload repeated",
                at,
            );
        }
        SessionEvent::NewEvidence => {
            state.no_new_evidence_loops = 0;
            state.same_payload_loops = 0;
            state.clear_task_failover();
            state.clear_failure();
        }
        SessionEvent::ReadonlyInconclusive => {
            state.readonly_inconclusive_count =
                state.readonly_inconclusive_count.saturating_add(1);
        }
        SessionEvent::ScopeConfirmed => {
            state.scope_confirmed = true;
        }
        SessionEvent::ContextLengthExceeded => {
            state.context_fail_count = state.context_fail_count.saturating_add(1);
            state.note_failure(
                FailureReason::ContextOverflow,
                &route,
                "context length exceeded",
                at,
            );
        }
        SessionEvent::Timeout => {
            state.timeout_fail_count = state.timeout_fail_count.saturating_add(1);
            state.note_failure(
                FailureReason::ToolingTimeout,
                &route,
                "worker timed out",
                at,
            );
        }
        SessionEvent::ResetLoop => {
            state.no_new_evidence_loops = 0;
            state.same_payload_loops = 0;
            state.readonly_inconclusive_count = 0;
            state.clear_failure();
        }
    }
}

/// Decode a durable table. Malformed records are dropped one by one; only a
/// file that is not a JSON object at all is an error.
pub fn decode_table(raw: &str) -> Result<DecodedTable> {
    let root: Value = serde_json::from_str(raw).context("state table is not valid JSON")?;
    let Value::Object(mut root) = root else {
        bail!("state table root is not an object");
    };
    let is_envelope = root.get("schema_version").is_some_and(Value::is_u64)
        && root.get("sessions").is_some_and(Value::is_object);
    let (version, records) = if is_envelope {
        let version = root
            .get("schema_version")
            .and_then(Value::as_u64)
            .unwrap_or(SCHEMA_VERSION);
        match root.remove("sessions") {
            Some(Value::Object(records)) => (version, records),
            _ => (version, Map::new()),
        }
    } else {
        (1, root)
    };

    let mut decoded = DecodedTable::default();
    for (session_id, record) in records {
        match decode_record(&session_id, record, version) {
            Ok(state) => {
                decoded.sessions.insert(session_id, state);
            }
            Err(err) => decoded
                .dropped
                .push(format!("dropped session record '{session_id}': {err}")),
        }
    }
    Ok(decoded)
}

pub fn decode_record(session_id: &str, record: Value, version: u64) -> Result<SessionState, RecordError> {
    if session_id.trim().is_empty() {
        return Err(RecordError::EmptyId);
    }
    let Value::Object(mut fields) = record else {
        return Err(RecordError::NotAnObject);
    };
    if version < 2 {
        fields = migrate_v1_fields(fields);
    }
    let mut state: SessionState = serde_json::from_value(Value::Object(fields))?;
    normalize(&mut state, version);
    Ok(state)
}

fn migrate_v1_fields(fields: Map<String, Value>) -> Map<String, Value> {
    fields
        .into_iter()
        .map(|(key, value)| {
            let key = camel_to_snake(&key);
            let value = match (key.as_str(), value) {
                ("dispatch_health_by_subagent" | "model_health_by_model", Value::Object(map)) => {
                    Value::Object(
                        map.into_iter()
                            .map(|(name, bucket)| (name, snake_case_keys(bucket)))
                            .collect(),
                    )
                }
                (_, value) => value,
            };
            (key, value)
        })
        .collect()
}

fn snake_case_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (camel_to_snake(&key), value))
                .collect(),
        ),
        other => other,
    }
}

fn camel_to_snake(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for ch in key.chars() {
        if ch.is_ascii_uppercase() {
            if !out.is_empty() {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

fn normalize(state: &mut SessionState, version: u64) {
    let overflow = state.recent_events.len().saturating_sub(RECENT_EVENTS_LIMIT);
    if overflow > 0 {
        state.recent_events.drain(..overflow);
    }
    state.alternatives = clean_alternatives(state.alternatives.iter().map(String::as_str));
    // v1 writers left the pending flag set after clearing the candidate.
    if version < 2 && state.latest_candidate.trim().is_empty() {
        state.candidate_pending_verification = false;
    }
}

fn write_table(path: &Path, sessions: &BTreeMap<String, SessionState>) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let body = serde_json::to_vec_pretty(&TableEnvelope {
        schema_version: SCHEMA_VERSION,
        sessions,
    })?;
    let mut tmp_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    fs::write(&tmp, body).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

fn clean_alternatives<'a>(items: impl Iterator<Item = &'a str>) -> Vec<String> {
    items
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
