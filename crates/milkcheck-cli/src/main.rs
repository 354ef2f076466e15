mod display;

use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser};
use tokio_util::sync::CancellationToken;

use milkcheck_core::config;
use milkcheck_core::dispatcher::DEFAULT_FANOUT;
use milkcheck_core::engine::{Engine, EngineError, RunOptions, RunOutcome};
use milkcheck_core::entity::Status;
use milkcheck_core::nodeset::NodeSet;
use milkcheck_core::runner::ExecRunner;

use display::{ConsoleView, Summary};

/// Everything went fine.
const RC_OK: i32 = 0;
/// A classified error: configuration, unknown service, bad variable...
const RC_EXCEPTION: i32 = 3;
/// Anything unclassified.
const RC_UNKNOWN_EXCEPTION: i32 = 4;

#[derive(Parser)]
#[command(
    name = "milkcheck",
    version,
    about = "Run dependency-ordered service actions across cluster nodes"
)]
struct Cli {
    /// Increase verbosity (-v: service status, -vv: commands and delays,
    /// -vvv: full action output)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    /// Directory holding the YAML configuration tree
    #[arg(short = 'c', long = "config-dir", default_value = "/etc/milkcheck")]
    config_dir: PathBuf,

    /// Lower the log level to debug and show unexpected errors in full
    #[arg(short = 'd', long)]
    debug: bool,

    /// Print a summary of failed and warned services at the end
    #[arg(short = 's', long)]
    summary: bool,

    /// Restrict every action target to this node set
    #[arg(short = 'n', long = "nodes")]
    nodes: Option<String>,

    /// Remove these nodes from every action target
    #[arg(short = 'x', long = "exclude")]
    exclude: Option<String>,

    /// Evaluate the graph without dispatching any command
    #[arg(long)]
    dry_run: bool,

    /// Default concurrent-worker cap
    #[arg(long, default_value_t = DEFAULT_FANOUT)]
    fanout: usize,

    /// Services to drive, the last argument being the verb
    /// (e.g. `milkcheck nfs network start`)
    #[arg(required = true, value_name = "SERVICE|VERB")]
    args: Vec<String>,
}

/// Split positional arguments into `(services, verb)`. No services means
/// every top-level service.
fn split_args(args: &[String]) -> (Vec<String>, String) {
    let (verb, services) = args.split_last().expect("clap requires one argument");
    (services.to_vec(), verb.clone())
}

/// Map a terminal run status onto the fixed exit-code table.
fn rc_for_status(status: Status) -> i32 {
    match status {
        Status::Error => 1,
        Status::TooManyErrors => 2,
        Status::TimedOut => 5,
        _ => RC_OK,
    }
}

fn sigint_exit_code() -> i32 {
    #[cfg(unix)]
    {
        128 + libc::SIGINT
    }
    #[cfg(not(unix))]
    {
        130
    }
}

fn print_summary(summary: &Summary) {
    if summary.failed.is_empty() && summary.warned.is_empty() {
        println!("No service failed.");
        return;
    }
    for (name, status) in &summary.failed {
        println!("{name:<40} {status}");
    }
    for name in &summary.warned {
        println!("{name:<40} {}", Status::Warning);
    }
}

async fn run(cli: &Cli) -> Result<i32> {
    let (services, verb) = split_args(&cli.args);

    let graph = match config::load_dir(&cli.config_dir) {
        Ok(graph) => graph,
        Err(e) => {
            tracing::error!("{e}");
            return Ok(RC_EXCEPTION);
        }
    };

    let parse_filter = |expr: &Option<String>| -> Result<Option<NodeSet>, i32> {
        match expr {
            None => Ok(None),
            Some(expr) => match NodeSet::parse(expr) {
                Ok(set) => Ok(Some(set)),
                Err(e) => {
                    tracing::error!("invalid node set {expr:?}: {e}");
                    Err(RC_EXCEPTION)
                }
            },
        }
    };
    let restrict = match parse_filter(&cli.nodes) {
        Ok(set) => set,
        Err(rc) => return Ok(rc),
    };
    let exclude = match parse_filter(&cli.exclude) {
        Ok(set) => set,
        Err(rc) => return Ok(rc),
    };

    let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
    let runner = ExecRunner::new(events_tx, cli.fanout);
    let (view, summary) = ConsoleView::new(cli.verbose);
    let mut engine = Engine::new(graph, Box::new(runner), events_rx, Box::new(view))
        .with_default_fanout(cli.fanout)
        .with_options(RunOptions {
            restrict,
            exclude,
            dry_run: cli.dry_run,
        });

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    match engine.call_services(&services, &verb, &cancel).await {
        Ok(RunOutcome::Completed { status }) => {
            if cli.summary {
                print_summary(&summary.lock().unwrap());
            }
            Ok(rc_for_status(status))
        }
        Ok(RunOutcome::Interrupted) => {
            tracing::error!("Keyboard Interrupt");
            Ok(sigint_exit_code())
        }
        // The runner dropping its event channel mid-run is not a
        // classified failure; surface it through the unknown-exception
        // path.
        Err(e @ EngineError::RunnerClosed) => Err(e.into()),
        Err(e) => {
            tracing::error!("{e}");
            Ok(RC_EXCEPTION)
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = match run(&cli).await {
        Ok(code) => code,
        Err(e) => {
            if cli.debug {
                // Re-raise with the full error chain instead of
                // swallowing it into an exit code.
                panic!("unexpected error: {e:?}");
            }
            tracing::error!("Unexpected error: {e:#}");
            RC_UNKNOWN_EXCEPTION
        }
    };
    std::process::exit(code);
}
