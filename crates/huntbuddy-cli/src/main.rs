use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use huntbuddy_core::{DispatchOutcome, FailureReason, Mode, SessionEvent, TargetType};

mod commands;
mod context;
mod output;

use commands::admin::{run_config, run_readiness};
use commands::dispatch::{run_dispatch, run_failover, run_model, run_outcome};
use commands::session::{run_event, run_failure, run_set, run_state};
use context::CliContext;

#[derive(Parser)]
#[command(name = "huntbuddy")]
#[command(about = "Session state and dispatch decisions for CTF and bug-bounty runs", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    json: bool,

    /// Log state changes and decisions to stderr.
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    /// Session identifier the command operates on.
    #[arg(long, global = true, default_value = "default")]
    session: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect stored sessions.
    State {
        #[command(subcommand)]
        command: StateCmd,
    },
    /// Apply a lifecycle event to the session state machine.
    Event(EventArgs),
    Set {
        #[command(subcommand)]
        command: SetCmd,
    },
    Failure {
        #[command(subcommand)]
        command: FailureCmd,
    },
    /// Resolve an abstract route into a worker assignment.
    Dispatch(DispatchArgs),
    /// Report how the last dispatched worker finished.
    Outcome(OutcomeArgs),
    Failover {
        #[command(subcommand)]
        command: FailoverCmd,
    },
    Model {
        #[command(subcommand)]
        command: ModelCmd,
    },
    /// List every worker the configured routing may address.
    Readiness(ReadinessArgs),
    Config {
        #[command(subcommand)]
        command: ConfigCmd,
    },
}

#[derive(Subcommand)]
enum StateCmd {
    Show,
    List,
}

#[derive(Args)]
struct EventArgs {
    event: SessionEvent,
}

#[derive(Subcommand)]
enum SetCmd {
    Mode { mode: Mode },
    Target { target: TargetType },
    Hypothesis { text: String },
    Alternatives { items: Vec<String> },
    Candidate { text: String },
    Verified { text: String },
    Category { name: String },
}

#[derive(Subcommand)]
enum FailureCmd {
    Record(FailureRecordArgs),
    Clear,
}

#[derive(Args)]
struct FailureRecordArgs {
    #[arg(long)]
    reason: FailureReason,
    #[arg(long, default_value = "")]
    route: String,
    #[arg(long, default_value = "")]
    summary: String,
}

#[derive(Args)]
struct DispatchArgs {
    #[arg(long)]
    route: String,
    /// Store the decision as the session's last dispatch and consume a used failover.
    #[arg(long)]
    record: bool,
}

#[derive(Args)]
struct OutcomeArgs {
    outcome: DispatchOutcome,
    /// Arm a task failover for the next dispatch after a failure.
    #[arg(long)]
    arm_failover: bool,
}

#[derive(Subcommand)]
enum FailoverCmd {
    Trigger,
    Consume,
    Clear,
}

#[derive(Subcommand)]
enum ModelCmd {
    Unhealthy {
        model: String,
        #[arg(long, default_value = "")]
        reason: String,
    },
    Healthy {
        model: String,
    },
}

#[derive(Args)]
struct ReadinessArgs {
    /// Workers registered in the host; missing ones fail the check.
    #[arg(long, value_delimiter = ',')]
    registered: Option<Vec<String>>,
}

#[derive(Subcommand)]
enum ConfigCmd {
    Show,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir()?;
    let ctx = CliContext {
        cwd,
        session: cli.session,
        json: cli.json,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::State { command } => run_state(&ctx, command),
        Commands::Event(args) => run_event(&ctx, args),
        Commands::Set { command } => run_set(&ctx, command),
        Commands::Failure { command } => run_failure(&ctx, command),
        Commands::Dispatch(args) => run_dispatch(&ctx, args),
        Commands::Outcome(args) => run_outcome(&ctx, args),
        Commands::Failover { command } => run_failover(&ctx, command),
        Commands::Model { command } => run_model(&ctx, command),
        Commands::Readiness(args) => run_readiness(&ctx, args),
        Commands::Config { command } => run_config(&ctx, command),
    }
}
