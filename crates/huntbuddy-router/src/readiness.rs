use crate::model_health::variant_agent_name;
use crate::{ROUTE_WORKERS, worker_for_route};
use huntbuddy_core::{DispatchConfig, Mode, RoutingConfig};
use serde::Serialize;
use std::collections::BTreeSet;

/// Every worker a session may be dispatched to through route mapping: the static
/// route table plus each route named in the phase, stuck and failover tables of
/// both modes. Names the static table does not know are taken as worker ids.
pub fn required_workers(routing: &RoutingConfig) -> BTreeSet<String> {
    let mut workers: BTreeSet<String> = ROUTE_WORKERS
        .iter()
        .map(|(_, worker)| worker.to_string())
        .collect();
    for mode in Mode::ALL {
        for route in routing.for_mode(mode).route_names() {
            let route = route.trim();
            if route.is_empty() {
                continue;
            }
            workers.insert(worker_for_route(route).unwrap_or(route).to_string());
        }
    }
    workers
}

/// Model-failover profiles (`<base>--<variant>`) that must also be registered.
pub fn variant_workers(dispatch: &DispatchConfig) -> BTreeSet<String> {
    dispatch
        .model_variants
        .iter()
        .flat_map(|(base, variants)| {
            variants
                .iter()
                .map(move |v| variant_agent_name(base, &v.variant))
        })
        .collect()
}

/// Workers named in capability profiles. Operational-feedback switching may
/// dispatch to any of them.
pub fn capability_workers(routing: &RoutingConfig) -> BTreeSet<String> {
    Mode::ALL
        .into_iter()
        .flat_map(|mode| routing.for_mode(mode).capabilities.values())
        .flatten()
        .map(|worker| worker.trim())
        .filter(|worker| !worker.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    pub required: Vec<String>,
    pub capable: Vec<String>,
    pub variants: Vec<String>,
    pub missing: Vec<String>,
}

/// Compare the addressable workers with those registered in the host.
pub fn check_readiness<S: AsRef<str>>(
    routing: &RoutingConfig,
    dispatch: &DispatchConfig,
    registered: &[S],
) -> ReadinessReport {
    let required = required_workers(routing);
    let capable = capability_workers(routing);
    let variants = variant_workers(dispatch);
    let registered: BTreeSet<&str> = registered.iter().map(|name| name.as_ref().trim()).collect();
    let missing: BTreeSet<String> = required
        .iter()
        .chain(capable.iter())
        .chain(variants.iter())
        .filter(|worker| !registered.contains(worker.as_str()))
        .cloned()
        .collect();
    ReadinessReport {
        required: required.into_iter().collect(),
        capable: capable.into_iter().collect(),
        variants: variants.into_iter().collect(),
        missing: missing.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huntbuddy_core::{ModelVariant, TargetType};

    #[test]
    fn static_table_workers_are_always_required() {
        let workers = required_workers(&RoutingConfig::default());
        for (_, worker) in ROUTE_WORKERS {
            assert!(workers.contains(*worker), "{worker} missing");
        }
    }

    #[test]
    fn configured_routes_resolve_through_table_and_deduplicate() {
        let mut routing = RoutingConfig::default();
        routing
            .ctf
            .stuck
            .insert(TargetType::Crypto, "scope-gate".to_string());
        routing
            .bounty
            .failover
            .insert(TargetType::Web3, "bounty-web3-specialist".to_string());
        let workers = required_workers(&routing);
        assert!(workers.contains("bounty-scope"));
        assert!(!workers.contains("scope-gate"));
        assert!(workers.contains("bounty-web3-specialist"));
        let total = workers.len();
        let unique: BTreeSet<_> = workers.iter().collect();
        assert_eq!(total, unique.len());
    }

    #[test]
    fn capability_only_workers_are_checked() {
        let mut routing = RoutingConfig::default();
        routing
            .ctf
            .capabilities
            .get_mut(&TargetType::Crypto)
            .expect("crypto profile")
            .push("ctf-lattice".to_string());
        assert!(!required_workers(&routing).contains("ctf-lattice"));
        assert!(capability_workers(&routing).contains("ctf-lattice"));

        let registered: Vec<String> = required_workers(&routing).into_iter().collect();
        let report = check_readiness(&routing, &DispatchConfig::default(), &registered);
        assert_eq!(report.missing, vec!["ctf-lattice".to_string()]);
        assert!(report.capable.contains(&"ctf-lattice".to_string()));
    }

    #[test]
    fn readiness_reports_unregistered_workers() {
        let mut dispatch = DispatchConfig::default();
        dispatch.model_variants.insert(
            "ctf-web".to_string(),
            vec![ModelVariant {
                variant: "backup".to_string(),
                model: "model-b".to_string(),
            }],
        );
        let routing = RoutingConfig::default();
        let mut registered: Vec<String> = required_workers(&routing).into_iter().collect();
        registered.retain(|w| w != "ctf-verify");

        let report = check_readiness(&routing, &dispatch, &registered);
        assert_eq!(report.variants, vec!["ctf-web--backup".to_string()]);
        assert_eq!(
            report.missing,
            vec!["ctf-verify".to_string(), "ctf-web--backup".to_string()]
        );
    }
}
