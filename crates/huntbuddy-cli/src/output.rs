use anyhow::Result;
use huntbuddy_core::SessionState;
use huntbuddy_store::SessionStore;
use serde::Serialize;
use serde_json::json;

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

pub(crate) fn print_state(
    store: &SessionStore,
    session_id: &str,
    state: &SessionState,
    json_mode: bool,
) -> Result<()> {
    if json_mode {
        return print_json(&json!({
            "session_id": session_id,
            "state": state,
            "persistence_degraded": store.is_persistence_degraded(),
        }));
    }
    println!(
        "session {session_id}: mode={} phase={} target={}",
        state.mode, state.phase, state.target_type
    );
    if !state.hypothesis.is_empty() {
        println!("hypothesis: {}", state.hypothesis);
    }
    if !state.alternatives.is_empty() {
        println!("alternatives: {}", state.alternatives.join(" | "));
    }
    if !state.latest_candidate.is_empty() {
        println!(
            "candidate: {}{}",
            state.latest_candidate,
            if state.candidate_pending_verification {
                " (pending verification)"
            } else {
                ""
            }
        );
    }
    if !state.latest_verified.is_empty() {
        println!("verified: {}", state.latest_verified);
    }
    println!(
        "loops: no_new_evidence={} same_payload={} verify_fail={} context_fail={} timeout_fail={}",
        state.no_new_evidence_loops,
        state.same_payload_loops,
        state.verify_fail_count,
        state.context_fail_count,
        state.timeout_fail_count
    );
    if !state.last_task_subagent.is_empty() {
        println!(
            "last dispatch: {} via {}",
            state.last_task_subagent, state.last_task_route
        );
    }
    println!(
        "failover: pending={} count={}",
        state.pending_task_failover, state.task_failover_count
    );
    if !state.last_failure_summary.is_empty() || state.last_failure_at.is_some() {
        println!(
            "last failure: {} {}",
            state.last_failure_reason, state.last_failure_summary
        );
    }
    if store.is_persistence_degraded() {
        println!("warning: persistence disabled, state kept in memory only");
    }
    Ok(())
}
