/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    abort_signal::{AbortSignal, InterruptGate},
    ambient,
    cleanup::{self, CleanupOutcome},
    config::RunConfig,
    handoff::{format_timestamp, PlotRequest, PlotStatus, Plotter, RunWindow},
    phase_timer::{Aborted, CancelKeys, Clock, PhaseTimer},
    process_control::{LaunchError, ProcessHandle, ProcessRole, Supervisor},
    run_namer::{self, RunIdentity},
};
use std::{
    fmt::Display,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const WARMUP_LABEL: &str = "Warm-up";
pub const LOGGING_LABEL: &str = "Logging window";

/// Exit code reported for a run cancelled by the operator.
pub const ABORTED_EXIT_CODE: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Validating,
    StartingAncillary,
    StartingLoad,
    Warmup,
    Naming,
    LoggingWindow,
    Teardown,
    Completing,
    Aborting,
    Failing,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Aborted(#[from] Aborted),

    #[error("unable to create run directory under {case_root:?}: {source}")]
    RunDirectory {
        case_root: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug)]
pub struct CompletedRun {
    pub identity: RunIdentity,
    pub window: RunWindow,
    pub output_dir: PathBuf,
    pub plot: PlotStatus,
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed(CompletedRun),
    Aborted(Aborted),
    Failed(RunError),
}
impl RunOutcome {
    /// `0` on success, the plotting stage's code when it failed, `1` for operational failures
    /// and [`ABORTED_EXIT_CODE`] when the operator cancelled the run.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed(run) => run.plot.exit_code(),
            RunOutcome::Aborted(_) => ABORTED_EXIT_CODE,
            RunOutcome::Failed(_) => 1,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed(_))
    }
}

/// One-line milestones printed on stdout for front-ends following a run.
#[derive(Debug, Clone, PartialEq)]
pub enum Marker {
    WarmupStart,
    LogStart,
    LogEnd,
    RunDir(PathBuf),
    AmbientCsv(PathBuf),
}
impl Display for Marker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Marker::WarmupStart => write!(f, "@@ WARMUP_START"),
            Marker::LogStart => write!(f, "@@ LOG_START"),
            Marker::LogEnd => write!(f, "@@ LOG_END"),
            Marker::RunDir(path) => write!(f, "@@ RUN_DIR {}", path.display()),
            Marker::AmbientCsv(path) => write!(f, "@@ AMBIENT_CSV {}", path.display()),
        }
    }
}

/// Everything a single orchestration accumulates and must hand back during teardown.
#[derive(Debug, Default)]
struct Session {
    load: Vec<ProcessHandle>,
    ambient: Option<ProcessHandle>,
    ambient_csv: Option<PathBuf>,
    identity: Option<RunIdentity>,
    run_dir: Option<PathBuf>,
}

/// Drives one thermal stress test run from validation through to the plotting stage.
pub struct Orchestrator<'a> {
    config: &'a RunConfig,
    supervisor: &'a dyn Supervisor,
    clock: &'a dyn Clock,
    abort: &'a dyn AbortSignal,
    plotter: &'a dyn Plotter,
    timer: PhaseTimer<'a>,
    interrupt: Option<&'a InterruptGate>,
    markers: bool,
    state: RunState,
}
impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a RunConfig,
        supervisor: &'a dyn Supervisor,
        clock: &'a dyn Clock,
        abort: &'a dyn AbortSignal,
        plotter: &'a dyn Plotter,
    ) -> Self {
        Self {
            config,
            supervisor,
            clock,
            abort,
            plotter,
            timer: PhaseTimer::new(clock, abort),
            interrupt: None,
            markers: false,
            state: RunState::Idle,
        }
    }

    /// Cancel phases on an interactive key-press too.
    pub fn with_cancel_keys(mut self, keys: Box<dyn CancelKeys + 'a>) -> Self {
        self.timer = self.timer.with_keys(keys);
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.timer = self.timer.with_progress(show_progress);
        self
    }

    /// Closed as soon as teardown starts.
    pub fn with_interrupt_gate(mut self, gate: &'a InterruptGate) -> Self {
        self.interrupt = Some(gate);
        self
    }

    /// Print [`Marker`] lines on stdout.
    pub fn with_markers(mut self, markers: bool) -> Self {
        self.markers = markers;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Runs the whole orchestration. Teardown runs exactly once no matter which phase completed,
    /// failed or was aborted, including a failed validation where nothing was started.
    pub async fn run(&mut self) -> RunOutcome {
        let mut session = Session::default();

        self.transition(RunState::Validating);
        let result = match self.validate() {
            Ok(()) => self.drive(&mut session).await,
            Err(err) => Err(err),
        };
        self.teardown(&mut session).await;

        match result {
            Ok(window) => self.complete(window, session).await,
            Err(RunError::Aborted(aborted)) => self.abort_run(aborted, session),
            Err(err) => self.fail(err, session),
        }
    }

    fn validate(&self) -> Result<(), RunError> {
        if !self.config.any_generator_enabled() {
            return Err(RunError::Precondition(
                "no load generator enabled, enable the CPU and/or GPU generator".to_string(),
            ));
        }

        if !self.config.telemetry_csv.is_file() {
            return Err(RunError::Precondition(format!(
                "telemetry source {:?} does not exist, start the telemetry logger first",
                self.config.telemetry_csv
            )));
        }

        Ok(())
    }

    async fn drive(&mut self, session: &mut Session) -> Result<RunWindow, RunError> {
        self.transition(RunState::StartingAncillary);
        self.start_ambient(session).await;

        self.transition(RunState::StartingLoad);
        for (role, generator) in self.config.enabled_generators() {
            // a handle that made it into the session is torn down even if a later start fails
            let handle = self.supervisor.start(&generator.launch(), role).await?;
            session.load.push(handle);
        }

        self.transition(RunState::Warmup);
        self.mark(Marker::WarmupStart);
        self.timer.run(WARMUP_LABEL, self.config.warmup_sec).await?;

        self.transition(RunState::Naming);
        let case_root = self.config.case_root();
        let identity = run_namer::allocate(
            &case_root,
            self.config.stress_label(),
            self.config.warmup_minutes(),
            self.config.log_minutes(),
        )?;
        let (identity, run_dir) = run_namer::create_run_dir(&case_root, identity)
            .map_err(|source| RunError::RunDirectory {
                case_root: case_root.clone(),
                source,
            })?;
        info!("Run {} -> {:?}", identity, run_dir);
        session.identity = Some(identity);
        session.run_dir = Some(run_dir.clone());
        self.mark(Marker::RunDir(run_dir));

        self.transition(RunState::LoggingWindow);
        let window_start = self.clock.now();
        self.mark(Marker::LogStart);
        self.timer.run(LOGGING_LABEL, self.config.log_sec).await?;
        let window_end = self.clock.now();
        self.mark(Marker::LogEnd);

        let window = RunWindow::new(window_start, window_end)?;
        info!(
            "Window {} -> {}",
            format_timestamp(&window.start()),
            format_timestamp(&window.end())
        );
        Ok(window)
    }

    /// Ambient data is optional enrichment, any failure here is logged and swallowed.
    async fn start_ambient(&self, session: &mut Session) {
        let cfg = &self.config.ambient;
        if !cfg.enabled {
            return;
        }

        let csv = ambient::csv_path(cfg, &self.config.case_name, &self.clock.now());
        let Some(launch) = ambient::launch(cfg, &csv) else {
            info!("Ambient logger not available, continuing without ambient data");
            return;
        };

        match self.supervisor.start(&launch, ProcessRole::AmbientLogger).await {
            Ok(handle) => {
                session.ambient = Some(handle);
                session.ambient_csv = Some(csv.clone());
                self.mark(Marker::AmbientCsv(csv));
            }
            Err(err) => warn!("Continuing without ambient data: {err}"),
        }
    }

    async fn teardown(&mut self, session: &mut Session) {
        self.transition(RunState::Teardown);
        if let Some(gate) = self.interrupt {
            gate.disarm();
        }

        let mut handles = std::mem::take(&mut session.load);
        handles.extend(session.ambient.take());
        self.supervisor
            .stop(handles, &self.config.sweep_names())
            .await;

        self.abort.clear();
    }

    async fn complete(&mut self, window: RunWindow, session: Session) -> RunOutcome {
        self.transition(RunState::Completing);

        let (Some(identity), Some(output_dir)) = (session.identity, session.run_dir) else {
            return self.fail(
                RunError::Other(anyhow::anyhow!("run finished without a run directory")),
                Session {
                    ambient_csv: session.ambient_csv,
                    ..Default::default()
                },
            );
        };
        if !output_dir.is_dir() {
            return self.fail(
                RunError::Other(anyhow::anyhow!(
                    "run directory {:?} disappeared before plotting",
                    output_dir
                )),
                Session {
                    ambient_csv: session.ambient_csv,
                    ..Default::default()
                },
            );
        }

        let ambient_csv = session
            .ambient_csv
            .clone()
            .filter(|path| has_content(path));
        let request = PlotRequest {
            telemetry_csv: self.config.telemetry_csv.clone(),
            out_dir: output_dir.clone(),
            patterns: self.config.plot.patterns.clone(),
            window,
            ambient_csv,
        };

        let plot = self.plotter.plot(&request).await;
        if !plot.is_success() {
            error!(
                "Plotting stage failed ({:?}), expected output: {:?}",
                plot,
                request.expected_artifact()
            );
        }

        // runs whatever the plotting stage did
        if self.config.cleanup.truncate_telemetry {
            cleanup::truncate_file(&self.config.telemetry_csv);
        }
        self.remove_ambient_csv(session.ambient_csv.as_deref());

        info!("Run {} complete", identity);
        RunOutcome::Completed(CompletedRun {
            identity,
            window,
            output_dir,
            plot,
        })
    }

    fn abort_run(&mut self, aborted: Aborted, session: Session) -> RunOutcome {
        self.transition(RunState::Aborting);
        warn!("{aborted}, no output produced");

        self.dispose_partial_output(&session);
        RunOutcome::Aborted(aborted)
    }

    fn fail(&mut self, err: RunError, session: Session) -> RunOutcome {
        self.transition(RunState::Failing);
        error!("Run failed: {err}");

        self.dispose_partial_output(&session);
        RunOutcome::Failed(err)
    }

    fn dispose_partial_output(&self, session: &Session) {
        if let Some(run_dir) = &session.run_dir {
            if let CleanupOutcome::Warning(msg) = cleanup::remove_dir_all(run_dir) {
                warn!("Partial run directory left behind: {msg}");
            }
        }
        self.remove_ambient_csv(session.ambient_csv.as_deref());
    }

    fn remove_ambient_csv(&self, csv: Option<&Path>) {
        if let (true, Some(csv)) = (self.config.cleanup.delete_ambient_csv, csv) {
            cleanup::remove_file(csv);
        }
    }

    fn transition(&mut self, next: RunState) {
        debug!("{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn mark(&self, marker: Marker) {
        if self.markers {
            println!("{marker}");
        }
    }
}

fn has_content(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.len() > 0)
        .unwrap_or(false)
}
