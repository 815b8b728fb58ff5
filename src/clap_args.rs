/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::config::{RunConfig, DEFAULT_CONFIG_FILE};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the config file
    #[arg(
        short,
        long,
        global = true,
        env = "THERMAL_BENCH_CONFIG",
        default_value = DEFAULT_CONFIG_FILE
    )]
    pub config: PathBuf,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a single warm-up + logging window and hand the window to the plotting stage
    Run(RunArgs),

    /// Raise the abort signal and force-kill any load generators still running
    Stop {
        /// Location of the abort signal file
        #[arg(long)]
        abort_file: Option<PathBuf>,
    },

    /// Write an example config file
    Init,
}

#[derive(clap::Args, Debug, Default)]
pub struct RunArgs {
    /// Case name, runs are grouped in a directory per case
    #[arg(long = "case")]
    pub case_name: Option<String>,

    #[arg(long)]
    pub runs_root: Option<PathBuf>,

    /// Warm-up duration in seconds, negative values count as 0
    #[arg(long, allow_negative_numbers = true)]
    pub warmup_sec: Option<i64>,

    /// Logging window duration in seconds, negative values count as 0
    #[arg(long, allow_negative_numbers = true)]
    pub log_sec: Option<i64>,

    /// CSV written by the hardware telemetry logger
    #[arg(long)]
    pub telemetry_csv: Option<PathBuf>,

    #[arg(long)]
    pub stress_cpu: Option<bool>,

    #[arg(long)]
    pub stress_gpu: Option<bool>,

    #[arg(long)]
    pub cpu_exe: Option<PathBuf>,

    /// Arguments for the CPU load generator, split POSIX style
    #[arg(long, allow_hyphen_values = true)]
    pub cpu_args: Option<String>,

    #[arg(long)]
    pub gpu_exe: Option<PathBuf>,

    /// Arguments for the GPU load generator, split POSIX style
    #[arg(long, allow_hyphen_values = true)]
    pub gpu_args: Option<String>,

    #[arg(long)]
    pub ambient: Option<bool>,

    #[arg(long)]
    pub ambient_interval_sec: Option<f64>,

    #[arg(long)]
    pub ambient_csv: Option<PathBuf>,

    /// Temperature calibration offset forwarded to the ambient logger
    #[arg(long, allow_negative_numbers = true)]
    pub cal_offset_c: Option<f64>,

    /// Telemetry column pattern to plot, may be repeated
    #[arg(long = "pattern")]
    pub patterns: Vec<String>,

    /// Command line of the plotting stage
    #[arg(long)]
    pub plot_command: Option<String>,

    #[arg(long)]
    pub abort_file: Option<PathBuf>,

    /// Empty the telemetry CSV after plotting
    #[arg(long)]
    pub truncate_telemetry: bool,

    /// Keep the ambient CSV after the run
    #[arg(long)]
    pub keep_ambient_csv: bool,

    /// No cancel keys and no progress bars
    #[arg(long)]
    pub non_interactive: bool,

    /// Print @@ milestone lines on stdout
    #[arg(long)]
    pub markers: bool,

    /// Print the outcome as JSON instead of a summary table
    #[arg(long)]
    pub json: bool,
}
impl RunArgs {
    /// Layers the command line on top of the config file.
    pub fn apply_to(&self, config: &mut RunConfig) -> anyhow::Result<()> {
        if let Some(case_name) = &self.case_name {
            config.case_name = case_name.clone();
        }
        if let Some(runs_root) = &self.runs_root {
            config.runs_root = runs_root.clone();
        }
        if let Some(secs) = self.warmup_sec {
            config.warmup_sec = non_negative(secs);
        }
        if let Some(secs) = self.log_sec {
            config.log_sec = non_negative(secs);
        }
        if let Some(telemetry_csv) = &self.telemetry_csv {
            config.telemetry_csv = telemetry_csv.clone();
        }

        if let Some(enabled) = self.stress_cpu {
            config.cpu.enabled = enabled;
        }
        if let Some(path) = &self.cpu_exe {
            config.cpu.path = path.clone();
        }
        if let Some(args) = &self.cpu_args {
            config.cpu.args = split_args(args).context("Invalid --cpu-args")?;
        }
        if let Some(enabled) = self.stress_gpu {
            config.gpu.enabled = enabled;
        }
        if let Some(path) = &self.gpu_exe {
            config.gpu.path = path.clone();
        }
        if let Some(args) = &self.gpu_args {
            config.gpu.args = split_args(args).context("Invalid --gpu-args")?;
        }

        if let Some(enabled) = self.ambient {
            config.ambient.enabled = enabled;
        }
        if let Some(interval) = self.ambient_interval_sec {
            config.ambient.interval_sec = interval;
        }
        if let Some(csv) = &self.ambient_csv {
            config.ambient.csv = Some(csv.clone());
        }
        if let Some(offset) = self.cal_offset_c {
            config.ambient.cal_offset_c = Some(offset);
        }

        if !self.patterns.is_empty() {
            config.plot.patterns = self.patterns.clone();
        }
        if let Some(command) = &self.plot_command {
            config.plot.command = command.clone();
        }
        if let Some(abort_file) = &self.abort_file {
            config.abort_file = abort_file.clone();
        }
        if self.truncate_telemetry {
            config.cleanup.truncate_telemetry = true;
        }
        if self.keep_ambient_csv {
            config.cleanup.delete_ambient_csv = false;
        }

        Ok(())
    }
}

fn non_negative(secs: i64) -> u64 {
    u64::try_from(secs).unwrap_or(0)
}

fn split_args(args: &str) -> anyhow::Result<Vec<String>> {
    shlex::split(args).context(format!("Arguments are not POSIX compliant: {args}"))
}

pub fn parse() -> Cli {
    Cli::parse()
}
