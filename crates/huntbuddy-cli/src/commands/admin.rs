use anyhow::{Result, anyhow};
use huntbuddy_core::AppConfig;
use huntbuddy_router::{capability_workers, check_readiness, required_workers, variant_workers};
use serde_json::json;

use crate::context::CliContext;
use crate::output::print_json;
use crate::{ConfigCmd, ReadinessArgs};

pub(crate) fn run_readiness(ctx: &CliContext, args: ReadinessArgs) -> Result<()> {
    let cfg = ctx.load_config()?;
    let Some(registered) = args.registered else {
        let required: Vec<String> = required_workers(&cfg.routing).into_iter().collect();
        let capable: Vec<String> = capability_workers(&cfg.routing).into_iter().collect();
        let variants: Vec<String> = variant_workers(&cfg.dispatch).into_iter().collect();
        if ctx.json {
            print_json(&json!({
                "required": required,
                "capable": capable,
                "variants": variants,
            }))?;
        } else {
            let mut all: Vec<&String> = required
                .iter()
                .chain(capable.iter())
                .chain(variants.iter())
                .collect();
            all.sort();
            all.dedup();
            for worker in all {
                println!("{worker}");
            }
        }
        return Ok(());
    };

    let report = check_readiness(&cfg.routing, &cfg.dispatch, &registered);
    if ctx.json {
        print_json(&report)?;
    } else if report.missing.is_empty() {
        println!("all referenced workers registered");
    } else {
        println!("missing workers: {}", report.missing.join(", "));
    }
    if !report.missing.is_empty() {
        return Err(anyhow!(
            "{} referenced workers are not registered",
            report.missing.len()
        ));
    }
    Ok(())
}

pub(crate) fn run_config(ctx: &CliContext, cmd: ConfigCmd) -> Result<()> {
    match cmd {
        ConfigCmd::Show => {
            let cfg = AppConfig::ensure(&ctx.cwd)?;
            if ctx.json {
                print_json(&cfg)?;
            } else {
                println!("{}", serde_json::to_string_pretty(&cfg)?);
            }
        }
    }
    Ok(())
}
