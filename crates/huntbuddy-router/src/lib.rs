mod model_health;
mod readiness;

pub use model_health::{
    CooldownModelResolver, ModelHealthResolver, VARIANT_SEPARATOR, configured_model, split_variant,
    variant_agent_name,
};
pub use readiness::{
    ReadinessReport, capability_workers, check_readiness, required_workers, variant_workers,
};

use huntbuddy_core::{AppConfig, DispatchConfig, RoutingConfig, SessionState};
use serde::Serialize;
use uuid::Uuid;

pub const SCORE_SUCCESS_WEIGHT: i64 = 2;
pub const SCORE_RETRYABLE_WEIGHT: i64 = 1;
pub const SCORE_HARD_WEIGHT: i64 = 2;
pub const SCORE_CONSECUTIVE_WEIGHT: i64 = 3;

/// Abstract route name -> concrete worker id. Aliases come after the identity entries.
pub const ROUTE_WORKERS: &[(&str, &str)] = &[
    ("ctf-web", "ctf-web"),
    ("ctf-web3", "ctf-web3"),
    ("ctf-pwn", "ctf-pwn"),
    ("ctf-rev", "ctf-rev"),
    ("ctf-crypto", "ctf-crypto"),
    ("ctf-forensics", "ctf-forensics"),
    ("ctf-explore", "ctf-explore"),
    ("ctf-solve", "ctf-solve"),
    ("ctf-research", "ctf-research"),
    ("ctf-hypothesis", "ctf-hypothesis"),
    ("ctf-decoy-check", "ctf-decoy-check"),
    ("ctf-verify", "ctf-verify"),
    ("deep-plan", "deep-plan"),
    ("bounty-scope", "bounty-scope"),
    ("bounty-triage", "bounty-triage"),
    ("bounty-research", "bounty-research"),
    ("md-scribe", "md-scribe"),
    ("ctf-misc", "ctf-solve"),
    ("verify", "ctf-verify"),
    ("scope-gate", "bounty-scope"),
    ("decoy-check", "ctf-decoy-check"),
    ("compact-notes", "md-scribe"),
    ("plan", "deep-plan"),
];

pub fn worker_for_route(route: &str) -> Option<&'static str> {
    let route = route.trim();
    ROUTE_WORKERS
        .iter()
        .find(|(name, _)| *name == route)
        .map(|(_, worker)| *worker)
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchDecision {
    pub decision_id: Uuid,
    pub route: String,
    /// `None` when the route has no mapping.
    pub worker: Option<String>,
    pub reason: String,
    pub pinned: bool,
    /// The pending failover was used; the caller should consume it.
    pub used_failover: bool,
    pub model: Option<String>,
    pub variant: Option<String>,
}

impl DispatchDecision {
    /// An unmapped route is a misconfiguration; callers must not retry it.
    pub fn is_configuration_gap(&self) -> bool {
        self.worker.is_none()
    }
}

/// Worker health as a single comparable number. Workers without a bucket score 0.
pub fn health_score(state: &SessionState, worker: &str) -> i64 {
    let Some(health) = state.worker_health(worker) else {
        return 0;
    };
    SCORE_SUCCESS_WEIGHT * i64::from(health.success_count)
        - SCORE_RETRYABLE_WEIGHT * i64::from(health.retryable_failure_count)
        - SCORE_HARD_WEIGHT * i64::from(health.hard_failure_count)
        - SCORE_CONSECUTIVE_WEIGHT * i64::from(health.consecutive_failure_count)
}

pub struct DispatchEngine {
    pub cfg: DispatchConfig,
    pub routing: RoutingConfig,
    resolver: Box<dyn ModelHealthResolver>,
}

impl DispatchEngine {
    pub fn new(cfg: DispatchConfig, routing: RoutingConfig) -> Self {
        let resolver = Box::new(CooldownModelResolver::new(&cfg));
        Self {
            cfg,
            routing,
            resolver,
        }
    }

    pub fn from_app_config(app: &AppConfig) -> Self {
        Self::new(app.dispatch.clone(), app.routing.clone())
    }

    pub fn with_resolver(mut self, resolver: impl ModelHealthResolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    pub fn health_score(&self, state: &SessionState, worker: &str) -> i64 {
        health_score(state, worker)
    }

    pub fn is_pinned(&self, worker: &str) -> bool {
        self.cfg.is_pinned(worker) || self.cfg.is_pinned(&self.resolver.base_agent_name(worker))
    }

    /// Resolve an abstract route into a worker for the session's current state.
    pub fn resolve(&self, route: &str, state: &SessionState) -> DispatchDecision {
        let route = route.trim();

        if state.pending_task_failover
            && state.task_failover_count < self.cfg.max_failover_retries
            && let Some(fallback) = self
                .routing
                .failover_worker(state.mode, state.target_type)
        {
            let reason = format!(
                "pending task failover attempt {}/{} for {}/{}: {fallback}",
                state.task_failover_count + 1,
                self.cfg.max_failover_retries,
                state.mode,
                state.target_type
            );
            return self.finish(route, fallback.trim(), reason, true, state);
        }

        let Some(mapped) = worker_for_route(route) else {
            return DispatchDecision {
                decision_id: Uuid::now_v7(),
                route: route.to_string(),
                worker: None,
                reason: format!("no worker mapping for route '{route}'"),
                pinned: false,
                used_failover: false,
                model: None,
                variant: None,
            };
        };
        let mut reason = format!("route {route} -> {mapped}");

        if self.is_pinned(mapped) {
            reason.push_str(" (pinned)");
            return self.decision(route, mapped.to_string(), reason, true, false);
        }

        let mut worker = mapped.to_string();
        if self.cfg.operational_feedback_enabled
            && let Some((switched, note)) = self.health_switch(mapped, state)
        {
            worker = switched;
            reason.push_str("; ");
            reason.push_str(&note);
        }

        self.finish(route, &worker, reason, false, state)
    }

    /// Candidate pool for health switching: the mapped worker first, then the
    /// failover worker, then the capability profile, without duplicates.
    fn candidate_pool(&self, mapped: &str, state: &SessionState) -> Vec<String> {
        let mut pool = vec![mapped.to_string()];
        let failover = self
            .routing
            .failover_worker(state.mode, state.target_type)
            .into_iter();
        let capable = self
            .routing
            .capable_workers(state.mode, state.target_type)
            .iter()
            .map(String::as_str);
        for candidate in failover.chain(capable) {
            let candidate = candidate.trim();
            if !candidate.is_empty() && !pool.iter().any(|existing| existing == candidate) {
                pool.push(candidate.to_string());
            }
        }
        pool
    }

    fn health_switch(&self, mapped: &str, state: &SessionState) -> Option<(String, String)> {
        let threshold = self.cfg.operational_feedback_consecutive_failures;
        let streak = state
            .worker_health(mapped)
            .map_or(0, |health| health.consecutive_failure_count);
        if streak < threshold {
            return None;
        }

        let mapped_score = health_score(state, mapped);
        let mut best = mapped.to_string();
        let mut best_score = mapped_score;
        for candidate in self.candidate_pool(mapped, state).into_iter().skip(1) {
            let score = health_score(state, &candidate);
            // Strictly greater so ties keep the mapped worker.
            if score > best_score {
                best_score = score;
                best = candidate;
            }
        }

        let note = if best == mapped {
            format!(
                "operational feedback: {mapped} streak {streak} >= {threshold}, kept (score {mapped_score})"
            )
        } else {
            format!(
                "operational feedback: {mapped} streak {streak} >= {threshold}, switched to {best} (score {best_score} > {mapped_score})"
            )
        };
        Some((best, note))
    }

    fn finish(
        &self,
        route: &str,
        worker: &str,
        mut reason: String,
        used_failover: bool,
        state: &SessionState,
    ) -> DispatchDecision {
        if self.is_pinned(worker) {
            return self.decision(route, worker.to_string(), reason, true, used_failover);
        }
        let mut worker = worker.to_string();
        if self.cfg.model_failover_enabled {
            let resolved =
                self.resolver
                    .resolve_healthy_agent(&worker, state, self.cfg.model_cooldown_ms);
            if resolved != worker {
                reason.push_str(&format!("; model failover {worker} -> {resolved}"));
                worker = resolved;
            }
        }
        self.decision(route, worker, reason, false, used_failover)
    }

    fn decision(
        &self,
        route: &str,
        worker: String,
        reason: String,
        pinned: bool,
        used_failover: bool,
    ) -> DispatchDecision {
        let model = configured_model(&self.cfg, &worker);
        let variant = split_variant(&worker).1.map(str::to_string);
        DispatchDecision {
            decision_id: Uuid::now_v7(),
            route: route.to_string(),
            worker: Some(worker),
            reason,
            pinned,
            used_failover,
            model,
            variant,
        }
    }
}
