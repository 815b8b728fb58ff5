/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::Context;
use colored::Colorize;
use std::{
    io::IsTerminal,
    path::{Path, PathBuf},
};
use thermal_bench::{
    abort_signal::{AbortSignal, InterruptGate, SentinelFile},
    clap_args::{self, Commands, RunArgs},
    config::RunConfig,
    handoff::CommandPlotter,
    orchestrator::Orchestrator,
    phase_timer::{SystemClock, TerminalKeys},
    process_control::OsSupervisor,
    report,
};
use tracing::{info, subscriber::set_global_default, Subscriber};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = clap_args::parse();
    init_subscriber(get_subscriber(if cli.verbose { "debug" } else { "info" }))?;

    let exit_code = match cli.command {
        Commands::Init => {
            RunConfig::write_example_to_file(&cli.config)?;
            println!("{} {}", "Wrote".green(), cli.config.display());
            0
        }

        Commands::Stop { abort_file } => stop(&cli.config, abort_file)?,

        Commands::Run(args) => run(&cli.config, args).await?,
    };

    std::process::exit(exit_code)
}

async fn run(config_path: &Path, args: RunArgs) -> anyhow::Result<i32> {
    let mut config = RunConfig::load_or_default(config_path)?;
    args.apply_to(&mut config)?;

    let abort = SentinelFile::new(&config.abort_file);
    let gate = InterruptGate::default();
    let (ctrlc_abort, ctrlc_gate) = (abort.clone(), gate.clone());
    ctrlc::set_handler(move || {
        ctrlc_gate.raise(&ctrlc_abort);
    })
    .context("Unable to install the Ctrl-C handler")?;

    let supervisor = OsSupervisor::new(
        config.supervisor.launch_grace(),
        config.supervisor.stop_grace(),
    );
    let plotter = CommandPlotter::from_command_line(&config.plot.command)?;
    let clock = SystemClock;
    let interactive = !args.non_interactive && std::io::stdin().is_terminal();

    let mut orchestrator = Orchestrator::new(&config, &supervisor, &clock, &abort, &plotter)
        .with_interrupt_gate(&gate)
        .with_markers(args.markers)
        .with_progress(interactive);
    if interactive {
        orchestrator = orchestrator.with_cancel_keys(Box::new(TerminalKeys));
    }

    let outcome = orchestrator.run().await;
    if args.json {
        println!("{}", report::to_json(&outcome)?);
    } else {
        report::print_summary(&config.case_name, &outcome);
    }

    Ok(outcome.exit_code())
}

/// Asks a running orchestration to abort and force-kills whatever load generators it left
/// behind.
fn stop(config_path: &Path, abort_file: Option<PathBuf>) -> anyhow::Result<i32> {
    let config = RunConfig::load_or_default(config_path)?;

    let abort = SentinelFile::new(abort_file.unwrap_or_else(|| config.abort_file.clone()));
    abort.signal();
    info!("Abort signal raised at {:?}", abort.path());

    let killed = OsSupervisor::sweep(&config.sweep_names());
    info!("Force-killed {killed} process(es)");

    Ok(0)
}

fn get_subscriber(default_filter: &str) -> impl Subscriber + Sync + Send {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish()
}

fn init_subscriber(subscriber: impl Subscriber + Sync + Send) -> anyhow::Result<()> {
    set_global_default(subscriber).context("Failed to set the tracing subscriber")
}
