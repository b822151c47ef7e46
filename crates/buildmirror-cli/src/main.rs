#![forbid(unsafe_code)]

mod cmd;
mod output;

use buildmirror_core::config;
use buildmirror_core::timing;
use clap::{Parser, Subcommand};
use cmd::GlobalOpts;
use output::{CliError, OutputMode};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "bmirror: local mirror of CI build history",
    long_about = None
)]
struct Cli {
    /// Emit command timing report to stderr.
    #[arg(long, global = true)]
    timing: bool,

    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Config file (default: <config dir>/buildmirror/config.toml).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Mirror database, overriding `[storage] path`.
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Configured server to use.
    #[arg(long, global = true, value_name = "ID")]
    server: Option<String>,

    /// Serve the CI server from a captured directory instead of the config.
    #[arg(long, global = true, value_name = "DIR")]
    replay: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn global_opts(&self) -> GlobalOpts {
        GlobalOpts {
            config: self.config.clone(),
            db: self.db.clone(),
            server: self.server.clone(),
            replay: self.replay.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Create the mirror database",
        after_help = "EXAMPLES:\n    # Create the database at the configured path\n    bmirror init\n\n    # Also write a config file with the defaults\n    bmirror init --write-config"
    )]
    Init(cmd::init::InitArgs),

    #[command(
        about = "Pull recent history from the CI server",
        long_about = "Walk the server's build history newest first, store changed references, \
                      and load full builds for everything that changed.",
        after_help = "EXAMPLES:\n    # Incremental sync\n    bmirror sync\n\n    # Walk the whole history\n    bmirror sync --full\n\n    # Mirror a captured server\n    bmirror --replay ./capture sync --full"
    )]
    Sync(cmd::sync::SyncArgs),

    #[command(
        about = "List stored builds",
        after_help = "EXAMPLES:\n    # Newest 20 builds of one build type on the default branch\n    bmirror history --build-type Ignite_Cache1 --branch '<default>' -n 20"
    )]
    History(cmd::history::HistoryArgs),

    #[command(
        about = "Show one full build",
        after_help = "EXAMPLES:\n    # Show build 4021 with its failed tests\n    bmirror show 4021\n\n    # Emit machine-readable output\n    bmirror show 4021 --json"
    )]
    Show(cmd::show::ShowArgs),

    #[command(
        about = "Get or set whether a build counts in reports",
        after_help = "EXAMPLES:\n    # Mark a build invalid\n    bmirror condition set 4021 --invalid --by alice --reason 'agent died'\n\n    # Read it back\n    bmirror condition get 4021"
    )]
    Condition(cmd::condition::ConditionArgs),

    #[command(about = "Reload builds stored by an older entity version")]
    Outdated(cmd::outdated::OutdatedArgs),

    #[command(
        about = "Find unstable tests of a build type",
        after_help = "EXAMPLES:\n    # Tests that changed status at least twice\n    bmirror history-tests Ignite_Cache1 --min-flips 2"
    )]
    HistoryTests(cmd::history_tests::HistoryTestsArgs),

    #[command(about = "Queue a build on the server and index it")]
    Trigger(cmd::trigger::TriggerArgs),

    #[command(
        about = "Keep the mirror current with periodic walks",
        long_about = "Walk recent history every --interval seconds while proactive loads and \
                      full reindexes run on background workers.",
        after_help = "EXAMPLES:\n    # Run until killed\n    bmirror watch\n\n    # Three walks a minute apart\n    bmirror watch --cycles 3 --interval 60"
    )]
    Watch(cmd::watch::WatchArgs),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("BMIRROR_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "buildmirror=debug,info"
        } else {
            "buildmirror=info,warn"
        })
    });

    let format = env::var("BMIRROR_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn run_command(cli: &Cli, opts: &GlobalOpts, output: OutputMode) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Init(args) => {
            timing::timed("cmd.init", || cmd::init::run_init(args, opts, output))
        }
        Commands::Sync(args) => {
            timing::timed("cmd.sync", || cmd::sync::run_sync(args, opts, output))
        }
        Commands::History(args) => timing::timed("cmd.history", || {
            cmd::history::run_history(args, opts, output)
        }),
        Commands::Show(args) => {
            timing::timed("cmd.show", || cmd::show::run_show(args, opts, output))
        }
        Commands::Condition(args) => timing::timed("cmd.condition", || {
            cmd::condition::run_condition(args, opts, output)
        }),
        Commands::Outdated(args) => timing::timed("cmd.outdated", || {
            cmd::outdated::run_outdated(args, opts, output)
        }),
        Commands::HistoryTests(args) => timing::timed("cmd.history_tests", || {
            cmd::history_tests::run_history_tests(args, opts, output)
        }),
        Commands::Trigger(args) => timing::timed("cmd.trigger", || {
            cmd::trigger::run_trigger(args, opts, output)
        }),
        Commands::Watch(args) => {
            timing::timed("cmd.watch", || cmd::watch::run_watch(args, opts, output))
        }
    }
}

fn print_timing_report() -> anyhow::Result<()> {
    let report = timing::collect_report();
    if report.is_empty() {
        eprintln!("timing report: no samples recorded");
    } else {
        eprintln!("timing report:");
        eprintln!("{}", report.display_table());
        eprintln!("timing report (json):");
        eprintln!("{}", serde_json::to_string_pretty(&report.to_json())?);
    }
    Ok(())
}

fn main() -> anyhow::Result<ExitCode> {
    init_tracing();

    let cli = Cli::parse();
    let timing_enabled = cli.timing || timing::timing_enabled_from_env();
    timing::set_timing_enabled(timing_enabled);
    timing::clear_timings();

    let opts = cli.global_opts();
    // A broken config file still gets reported in the requested format.
    let config_output = opts.load_config().ok().and_then(|c| c.output);
    let output = OutputMode::from_name(&config::resolve_output(cli.json, config_output.as_deref()));

    let command_result = run_command(&cli, &opts, output);

    if timing_enabled {
        print_timing_report()?;
    }

    match command_result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err) => {
            output::render_error(output, &CliError::from_anyhow(&err))?;
            Ok(ExitCode::FAILURE)
        }
    }
}
