use anyhow::{Result, anyhow};
use huntbuddy_core::DispatchOutcome;
use huntbuddy_router::DispatchEngine;

use crate::context::CliContext;
use crate::output::{print_json, print_state};
use crate::{DispatchArgs, FailoverCmd, ModelCmd, OutcomeArgs};

pub(crate) fn run_dispatch(ctx: &CliContext, args: DispatchArgs) -> Result<()> {
    let runtime = ctx.runtime()?;
    let engine = DispatchEngine::from_app_config(&runtime.cfg);
    let state = runtime.store.get(&ctx.session);
    let decision = engine.resolve(&args.route, &state);
    runtime.observer.verbose_log(&format!(
        "dispatch {} -> {}: {}",
        decision.route,
        decision.worker.as_deref().unwrap_or("<none>"),
        decision.reason
    ));
    if let Err(err) = runtime
        .observer
        .record("dispatch", serde_json::to_value(&decision)?)
    {
        runtime
            .observer
            .warn_log(&format!("dispatch decision not logged: {err:#}"));
    }

    if args.record
        && let Some(worker) = decision.worker.as_deref()
    {
        runtime.store.set_last_dispatch(
            &ctx.session,
            &decision.route,
            worker,
            decision.model.as_deref(),
            decision.variant.as_deref(),
        );
        if decision.used_failover {
            runtime.store.consume_task_failover(&ctx.session);
        }
    }

    if ctx.json {
        print_json(&decision)?;
    } else {
        println!(
            "{} -> {}",
            decision.route,
            decision.worker.as_deref().unwrap_or("<no mapping>")
        );
        println!("reason: {}", decision.reason);
    }

    if decision.is_configuration_gap() {
        return Err(anyhow!(
            "route '{}' has no worker mapping; fix the routing configuration",
            decision.route
        ));
    }
    Ok(())
}

pub(crate) fn run_outcome(ctx: &CliContext, args: OutcomeArgs) -> Result<()> {
    let runtime = ctx.runtime()?;
    if runtime.store.get(&ctx.session).last_task_subagent.is_empty() {
        runtime
            .observer
            .verbose_log("no recorded dispatch; outcome ignored");
    }
    let mut state = runtime
        .store
        .record_dispatch_outcome(&ctx.session, args.outcome);
    if args.arm_failover && args.outcome != DispatchOutcome::Success {
        state = runtime.store.trigger_task_failover(&ctx.session);
    }
    print_state(&runtime.store, &ctx.session, &state, ctx.json)
}

pub(crate) fn run_failover(ctx: &CliContext, cmd: FailoverCmd) -> Result<()> {
    let runtime = ctx.runtime()?;
    let state = match cmd {
        FailoverCmd::Trigger => runtime.store.trigger_task_failover(&ctx.session),
        FailoverCmd::Consume => runtime.store.consume_task_failover(&ctx.session),
        FailoverCmd::Clear => runtime.store.clear_task_failover(&ctx.session),
    };
    print_state(&runtime.store, &ctx.session, &state, ctx.json)
}

pub(crate) fn run_model(ctx: &CliContext, cmd: ModelCmd) -> Result<()> {
    let runtime = ctx.runtime()?;
    let state = match cmd {
        ModelCmd::Unhealthy { model, reason } => {
            runtime
                .store
                .mark_model_unhealthy(&ctx.session, &model, &reason)
        }
        ModelCmd::Healthy { model } => runtime.store.mark_model_healthy(&ctx.session, &model),
    };
    print_state(&runtime.store, &ctx.session, &state, ctx.json)
}
