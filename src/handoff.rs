/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The contract with the external plotting stage: which telemetry rows belong to a run and
//! where the plotting stage should write its artifacts.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use itertools::Itertools;
use serde::Serialize;
use std::{path::PathBuf, time::Duration};
use tracing::{debug, info};

/// Fixed, sortable timestamp format with millisecond precision, e.g.
/// `2026-10-18 14:03:07.250`.
pub const WINDOW_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// The CSV the plotting stage writes into the run directory when asked to export the window.
pub const WINDOW_CSV: &str = "run_window.csv";

pub fn format_timestamp(ts: &DateTime<Local>) -> String {
    ts.format(WINDOW_TIMESTAMP_FORMAT).to_string()
}

/// The interval whose telemetry belongs to a run. Start never lies after end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunWindow {
    start: DateTime<Local>,
    end: DateTime<Local>,
}
impl RunWindow {
    pub fn new(start: DateTime<Local>, end: DateTime<Local>) -> anyhow::Result<Self> {
        if end < start {
            return Err(anyhow!(
                "Window end {} is earlier than window start {}",
                format_timestamp(&end),
                format_timestamp(&start)
            ));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> DateTime<Local> {
        self.start
    }

    pub fn end(&self) -> DateTime<Local> {
        self.end
    }

    pub fn elapsed(&self) -> Duration {
        (self.end - self.start).to_std().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlotRequest {
    pub telemetry_csv: PathBuf,
    pub out_dir: PathBuf,
    pub patterns: Vec<String>,
    pub window: RunWindow,
    pub ambient_csv: Option<PathBuf>,
}
impl PlotRequest {
    /// The handoff flags, in the order the plotting stage documents them.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--csv".to_string(),
            self.telemetry_csv.to_string_lossy().to_string(),
            "--out".to_string(),
            self.out_dir.to_string_lossy().to_string(),
        ];

        if !self.patterns.is_empty() {
            args.push("--patterns".to_string());
            args.extend(self.patterns.iter().cloned());
        }

        args.extend([
            "--window-start".to_string(),
            format_timestamp(&self.window.start),
            "--window-end".to_string(),
            format_timestamp(&self.window.end),
            "--export-window-csv".to_string(),
        ]);

        if let Some(ambient_csv) = &self.ambient_csv {
            args.push("--ambient-csv".to_string());
            args.push(ambient_csv.to_string_lossy().to_string());
        }

        args
    }

    /// Where the plotting stage is expected to leave the exported window.
    pub fn expected_artifact(&self) -> PathBuf {
        self.out_dir.join(WINDOW_CSV)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum PlotStatus {
    Success,
    ExitCode(i32),
    /// Terminated without an exit code (e.g. by a signal).
    Terminated,
    LaunchFailed(String),
}
impl PlotStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, PlotStatus::Success)
    }

    /// The plotting stage's own code where it has one, otherwise 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            PlotStatus::Success => 0,
            PlotStatus::ExitCode(code) => *code,
            PlotStatus::Terminated | PlotStatus::LaunchFailed(_) => 1,
        }
    }
}

#[async_trait]
pub trait Plotter: Send + Sync {
    async fn plot(&self, request: &PlotRequest) -> PlotStatus;
}

/// Invokes the plotting stage as a subprocess: a program plus fixed leading arguments (e.g.
/// `python cli/plot_hwinfo.py`), followed by the handoff flags.
#[derive(Debug, Clone)]
pub struct CommandPlotter {
    program: String,
    base_args: Vec<String>,
}
impl CommandPlotter {
    pub fn new(program: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            base_args,
        }
    }

    /// Builds a plotter from a POSIX-style command line.
    pub fn from_command_line(command: &str) -> anyhow::Result<Self> {
        let words = shlex::split(command)
            .with_context(|| format!("Plot command is not POSIX compliant: {command}"))?;
        match &words[..] {
            [program, args @ ..] => Ok(Self::new(program.clone(), args.to_vec())),
            _ => Err(anyhow!("Plot command is empty")),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn base_args(&self) -> &[String] {
        &self.base_args
    }
}

#[async_trait]
impl Plotter for CommandPlotter {
    async fn plot(&self, request: &PlotRequest) -> PlotStatus {
        let args = self
            .base_args
            .iter()
            .cloned()
            .chain(request.to_args())
            .collect_vec();
        info!("Plotting: {} {}", self.program, args.iter().join(" "));

        let status = tokio::process::Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .status()
            .await;

        match status {
            Ok(status) if status.success() => PlotStatus::Success,
            Ok(status) => match status.code() {
                Some(code) => PlotStatus::ExitCode(code),
                None => PlotStatus::Terminated,
            },
            Err(err) => {
                debug!("Unable to spawn {}: {}", self.program, err);
                PlotStatus::LaunchFailed(format!("Unable to run {}: {}", self.program, err))
            }
        }
    }
}
