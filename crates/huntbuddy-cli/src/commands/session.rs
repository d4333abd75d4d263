use anyhow::Result;
use serde_json::json;

use crate::context::CliContext;
use crate::output::{print_json, print_state};
use crate::{EventArgs, FailureCmd, SetCmd, StateCmd};

pub(crate) fn run_state(ctx: &CliContext, cmd: StateCmd) -> Result<()> {
    let runtime = ctx.runtime()?;
    match cmd {
        StateCmd::Show => {
            let state = runtime.store.get(&ctx.session);
            print_state(&runtime.store, &ctx.session, &state, ctx.json)?;
        }
        StateCmd::List => {
            let ids = runtime.store.session_ids();
            if ctx.json {
                print_json(&json!({ "sessions": ids }))?;
            } else if ids.is_empty() {
                println!("no sessions");
            } else {
                for id in ids {
                    println!("{id}");
                }
            }
        }
    }
    Ok(())
}

pub(crate) fn run_event(ctx: &CliContext, args: EventArgs) -> Result<()> {
    let runtime = ctx.runtime()?;
    let state = runtime.store.apply_event(&ctx.session, args.event);
    print_state(&runtime.store, &ctx.session, &state, ctx.json)
}

pub(crate) fn run_set(ctx: &CliContext, cmd: SetCmd) -> Result<()> {
    let runtime = ctx.runtime()?;
    let store = &runtime.store;
    let id = ctx.session.as_str();
    let state = match cmd {
        SetCmd::Mode { mode } => store.set_mode(id, mode),
        SetCmd::Target { target } => store.set_target_type(id, target),
        SetCmd::Hypothesis { text } => store.set_hypothesis(id, &text),
        SetCmd::Alternatives { items } => store.set_alternatives(id, &items),
        SetCmd::Candidate { text } => store.set_candidate(id, &text),
        SetCmd::Verified { text } => store.set_verified(id, &text),
        SetCmd::Category { name } => store.set_last_task_category(id, &name),
    };
    print_state(store, id, &state, ctx.json)
}

pub(crate) fn run_failure(ctx: &CliContext, cmd: FailureCmd) -> Result<()> {
    let runtime = ctx.runtime()?;
    let state = match cmd {
        FailureCmd::Record(args) => {
            runtime
                .store
                .record_failure(&ctx.session, args.reason, &args.route, &args.summary)
        }
        FailureCmd::Clear => runtime.store.clear_failure(&ctx.session),
    };
    print_state(&runtime.store, &ctx.session, &state, ctx.json)
}
