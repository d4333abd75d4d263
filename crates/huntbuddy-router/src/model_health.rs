//! Model-level health resolution.
//!
//! A worker may be executable under several profiles, each bound to a different
//! underlying model. Profiles are named `<base>--<variant>`. When the model behind
//! the requested profile is inside its unhealthy cooldown, the resolver picks the
//! first profile of the same base worker whose model is healthy.

use chrono::Utc;
use huntbuddy_core::{DispatchConfig, ModelVariant, SessionState};
use std::collections::BTreeMap;

pub const VARIANT_SEPARATOR: &str = "--";

pub trait ModelHealthResolver: Send + Sync {
    /// Returns `worker` unchanged when no substitution is needed.
    fn resolve_healthy_agent(&self, worker: &str, state: &SessionState, cooldown_ms: u64) -> String;

    fn is_model_healthy(&self, state: &SessionState, model: &str, cooldown_ms: u64) -> bool;

    /// Logical worker name with any profile suffix removed.
    fn base_agent_name(&self, worker: &str) -> String {
        split_variant(worker).0.to_string()
    }
}

/// Split `<base>--<variant>` into its parts.
pub fn split_variant(worker: &str) -> (&str, Option<&str>) {
    match worker.split_once(VARIANT_SEPARATOR) {
        Some((base, variant)) if !base.is_empty() && !variant.is_empty() => (base, Some(variant)),
        _ => (worker, None),
    }
}

pub fn variant_agent_name(base: &str, variant: &str) -> String {
    format!("{base}{VARIANT_SEPARATOR}{variant}")
}

/// Model configured for a worker profile, if any.
pub fn configured_model(cfg: &DispatchConfig, worker: &str) -> Option<String> {
    model_for(&cfg.worker_models, &cfg.model_variants, worker).map(str::to_string)
}

fn model_for<'a>(
    worker_models: &'a BTreeMap<String, String>,
    model_variants: &'a BTreeMap<String, Vec<ModelVariant>>,
    worker: &str,
) -> Option<&'a str> {
    let (base, variant) = split_variant(worker);
    match variant {
        Some(variant) => model_variants
            .get(base)?
            .iter()
            .find(|candidate| candidate.variant == variant)
            .map(|candidate| candidate.model.as_str()),
        None => worker_models.get(base).map(String::as_str),
    }
}

/// Treats a model as unhealthy for `cooldown_ms` after it was marked in the
/// session's model ledger.
#[derive(Debug, Clone, Default)]
pub struct CooldownModelResolver {
    worker_models: BTreeMap<String, String>,
    model_variants: BTreeMap<String, Vec<ModelVariant>>,
}

impl CooldownModelResolver {
    pub fn new(cfg: &DispatchConfig) -> Self {
        Self {
            worker_models: cfg.worker_models.clone(),
            model_variants: cfg.model_variants.clone(),
        }
    }

    /// Every profile of `base` in preference order: the primary first, then the
    /// configured variants.
    fn profiles<'a>(&'a self, base: &'a str) -> impl Iterator<Item = (String, &'a str)> + 'a {
        let primary = self
            .worker_models
            .get(base)
            .map(|model| (base.to_string(), model.as_str()));
        let variants = self
            .model_variants
            .get(base)
            .into_iter()
            .flatten()
            .map(move |v| (variant_agent_name(base, &v.variant), v.model.as_str()));
        primary.into_iter().chain(variants)
    }
}

impl ModelHealthResolver for CooldownModelResolver {
    fn resolve_healthy_agent(&self, worker: &str, state: &SessionState, cooldown_ms: u64) -> String {
        let Some(current) = model_for(&self.worker_models, &self.model_variants, worker) else {
            return worker.to_string();
        };
        if self.is_model_healthy(state, current, cooldown_ms) {
            return worker.to_string();
        }
        let (base, _) = split_variant(worker);
        self.profiles(base)
            .find(|(agent, model)| agent != worker && self.is_model_healthy(state, model, cooldown_ms))
            .map(|(agent, _)| agent)
            .unwrap_or_else(|| worker.to_string())
    }

    fn is_model_healthy(&self, state: &SessionState, model: &str, cooldown_ms: u64) -> bool {
        let Some(entry) = state.model_health_by_model.get(model) else {
            return true;
        };
        let elapsed_ms = Utc::now()
            .signed_duration_since(entry.unhealthy_since)
            .num_milliseconds();
        elapsed_ms >= i64::try_from(cooldown_ms).unwrap_or(i64::MAX)
    }
}
