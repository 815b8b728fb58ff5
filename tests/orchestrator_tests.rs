use anyhow::{self, Context};
use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone};
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};
use tempfile::TempDir;
use thermal_bench::{
    abort_signal::{AbortSignal, InterruptGate},
    config::{LoadGenerator, RunConfig},
    handoff::{format_timestamp, PlotRequest, PlotStatus, Plotter},
    orchestrator::{Orchestrator, RunError, RunOutcome, LOGGING_LABEL, WARMUP_LABEL},
    phase_timer::{AbortSource, Clock},
    process_control::{Launch, LaunchError, ProcessHandle, ProcessRole, Supervisor},
};

// ******** ******** ********
// **        FAKES         **
// ******** ******** ********

#[derive(Default)]
struct RecordingSupervisor {
    next_pid: AtomicU32,
    fail_role: Option<ProcessRole>,
    starts: Mutex<Vec<(Launch, ProcessRole)>>,
    stops: Mutex<Vec<(Vec<ProcessHandle>, Vec<String>)>>,
}
impl RecordingSupervisor {
    fn failing(role: ProcessRole) -> Self {
        Self {
            fail_role: Some(role),
            ..Default::default()
        }
    }

    fn start_count(&self) -> usize {
        self.starts.lock().expect("poisoned").len()
    }

    fn stops(&self) -> Vec<(Vec<ProcessHandle>, Vec<String>)> {
        self.stops.lock().expect("poisoned").clone()
    }
}

#[async_trait]
impl Supervisor for RecordingSupervisor {
    async fn start(&self, launch: &Launch, role: ProcessRole) -> Result<ProcessHandle, LaunchError> {
        self.starts
            .lock()
            .expect("poisoned")
            .push((launch.clone(), role));

        if self.fail_role == Some(role) {
            return Err(LaunchError::ImmediateExit {
                role,
                program: launch.program.clone(),
                status: "exit code 1".to_string(),
            });
        }

        Ok(ProcessHandle {
            pid: 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst),
            role,
            name: launch
                .program
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default(),
        })
    }

    async fn stop(&self, handles: Vec<ProcessHandle>, sweep_names: &[String]) {
        self.stops
            .lock()
            .expect("poisoned")
            .push((handles, sweep_names.to_vec()));
    }
}

/// Time only moves when the orchestration sleeps.
struct ManualClock {
    now: Mutex<DateTime<Local>>,
}
impl ManualClock {
    fn starting_at(start: DateTime<Local>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Local> {
        *self.now.lock().expect("poisoned")
    }

    async fn sleep(&self, period: Duration) {
        let mut now = self.now.lock().expect("poisoned");
        *now += chrono::Duration::from_std(period).expect("small duration");
    }
}

/// Raises itself on the nth check.
#[derive(Default)]
struct ScriptedAbort {
    trip_after: Option<usize>,
    checks: AtomicUsize,
    raised: AtomicBool,
    clears: AtomicUsize,
}
impl ScriptedAbort {
    fn tripping_after(checks: usize) -> Self {
        Self {
            trip_after: Some(checks),
            ..Default::default()
        }
    }
}
impl AbortSignal for ScriptedAbort {
    fn signal(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    fn clear(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
        self.raised.store(false, Ordering::SeqCst);
    }

    fn is_set(&self) -> bool {
        let n = self.checks.fetch_add(1, Ordering::SeqCst);
        if self.trip_after.is_some_and(|trip| n >= trip) {
            self.raised.store(true, Ordering::SeqCst);
        }
        self.raised.load(Ordering::SeqCst)
    }
}

struct RecordingPlotter {
    status: PlotStatus,
    requests: Mutex<Vec<PlotRequest>>,
}
impl RecordingPlotter {
    fn returning(status: PlotStatus) -> Self {
        Self {
            status,
            requests: Mutex::new(vec![]),
        }
    }

    fn requests(&self) -> Vec<PlotRequest> {
        self.requests.lock().expect("poisoned").clone()
    }
}

#[async_trait]
impl Plotter for RecordingPlotter {
    async fn plot(&self, request: &PlotRequest) -> PlotStatus {
        self.requests.lock().expect("poisoned").push(request.clone());
        self.status.clone()
    }
}

// ******** ******** ********
// **       HELPERS        **
// ******** ******** ********

fn start_time() -> DateTime<Local> {
    Local
        .with_ymd_and_hms(2026, 10, 18, 12, 0, 0)
        .single()
        .expect("valid local time")
}

fn setup_config(tmp: &TempDir, warmup_sec: u64, log_sec: u64) -> anyhow::Result<RunConfig> {
    let telemetry_csv = tmp.path().join("hwinfo.csv");
    std::fs::write(&telemetry_csv, "Date,Time,CPU Package [°C]\n")
        .context("Error writing telemetry fixture")?;

    Ok(RunConfig {
        runs_root: tmp.path().join("runs"),
        warmup_sec,
        log_sec,
        telemetry_csv,
        abort_file: tmp.path().join("abort.flag"),
        cpu: LoadGenerator {
            enabled: true,
            path: PathBuf::from("cpu_load"),
            args: vec!["-t".to_string()],
        },
        ..Default::default()
    })
}

async fn run_once(
    config: &RunConfig,
    supervisor: &RecordingSupervisor,
    abort: &ScriptedAbort,
    plotter: &RecordingPlotter,
) -> RunOutcome {
    let clock = ManualClock::starting_at(start_time());
    let outcome = Orchestrator::new(config, supervisor, &clock, abort, plotter)
        .run()
        .await;
    outcome
}

fn case_dir_entries(config: &RunConfig) -> Vec<String> {
    std::fs::read_dir(config.case_root())
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().to_string())
                .collect()
        })
        .unwrap_or_default()
}

// ******** ******** ********
// **        TESTS         **
// ******** ******** ********

#[tokio::test]
async fn short_run_completes_and_hands_off_window() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let config = setup_config(&tmp, 0, 2)?;
    let supervisor = RecordingSupervisor::default();
    let abort = ScriptedAbort::default();
    let plotter = RecordingPlotter::returning(PlotStatus::Success);

    let outcome = run_once(&config, &supervisor, &abort, &plotter).await;
    assert_eq!(outcome.exit_code(), 0);

    let RunOutcome::Completed(run) = &outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(run.identity.to_string(), "CPU_W0_L0_V1");
    assert_eq!(run.output_dir, config.case_root().join("CPU_W0_L0_V1"));
    assert!(run.output_dir.is_dir());
    assert_eq!(run.window.elapsed(), Duration::from_secs(2));

    let requests = plotter.requests();
    assert_eq!(requests.len(), 1);
    let args = requests[0].to_args();
    assert!(args
        .windows(2)
        .any(|pair| pair == ["--window-start", "2026-10-18 12:00:00.000"]));
    assert!(args
        .windows(2)
        .any(|pair| pair == ["--window-end", "2026-10-18 12:00:02.000"]));

    // teardown happened exactly once and covered the load generator
    let stops = supervisor.stops();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].0.len(), 1);
    assert_eq!(stops[0].0[0].role, ProcessRole::CpuLoad);
    assert!(stops[0].1.contains(&"cpu_load".to_string()));
    assert_eq!(abort.clears.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
async fn no_generator_enabled_fails_before_starting_anything() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let mut config = setup_config(&tmp, 0, 2)?;
    config.cpu.enabled = false;
    config.gpu.enabled = false;

    let supervisor = RecordingSupervisor::default();
    let abort = ScriptedAbort::default();
    let plotter = RecordingPlotter::returning(PlotStatus::Success);

    let outcome = run_once(&config, &supervisor, &abort, &plotter).await;
    assert!(matches!(outcome, RunOutcome::Failed(RunError::Precondition(_))));
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(supervisor.start_count(), 0);
    assert!(!config.case_root().exists());

    // teardown still runs once: nothing to stop by handle, but orphans are swept and a stale
    // abort flag is cleared
    let stops = supervisor.stops();
    assert_eq!(stops.len(), 1);
    assert!(stops[0].0.is_empty());
    assert!(stops[0].1.contains(&"cpu_load".to_string()));
    assert_eq!(abort.clears.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
async fn missing_telemetry_source_fails_validation() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let mut config = setup_config(&tmp, 0, 2)?;
    config.telemetry_csv = tmp.path().join("not_there.csv");

    let supervisor = RecordingSupervisor::default();
    let abort = ScriptedAbort::default();
    let plotter = RecordingPlotter::returning(PlotStatus::Success);

    let outcome = run_once(&config, &supervisor, &abort, &plotter).await;
    assert!(matches!(outcome, RunOutcome::Failed(RunError::Precondition(_))));
    assert_eq!(supervisor.start_count(), 0);
    assert!(plotter.requests().is_empty());

    Ok(())
}

#[tokio::test]
async fn abort_during_warmup_leaves_no_run_directory() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let config = setup_config(&tmp, 1200, 900)?;
    let supervisor = RecordingSupervisor::default();
    let abort = ScriptedAbort::tripping_after(3);
    let plotter = RecordingPlotter::returning(PlotStatus::Success);

    let outcome = run_once(&config, &supervisor, &abort, &plotter).await;
    assert_eq!(outcome.exit_code(), 2);

    let RunOutcome::Aborted(aborted) = &outcome else {
        panic!("expected abort, got {outcome:?}");
    };
    assert_eq!(aborted.phase, WARMUP_LABEL);
    assert_eq!(aborted.by, AbortSource::Signal);
    assert_eq!(aborted.remaining_secs, 1197);

    assert!(!config.case_root().exists());
    assert_eq!(supervisor.stops().len(), 1);
    assert!(plotter.requests().is_empty());
    assert_eq!(abort.clears.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
async fn abort_during_logging_removes_partial_run_directory() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let config = setup_config(&tmp, 3, 5)?;
    let supervisor = RecordingSupervisor::default();
    // three warm-up checks, then one logging tick before the abort lands
    let abort = ScriptedAbort::tripping_after(4);
    let plotter = RecordingPlotter::returning(PlotStatus::Success);

    let outcome = run_once(&config, &supervisor, &abort, &plotter).await;
    let RunOutcome::Aborted(aborted) = &outcome else {
        panic!("expected abort, got {outcome:?}");
    };
    assert_eq!(aborted.phase, LOGGING_LABEL);
    assert_eq!(aborted.remaining_secs, 4);

    // the case directory was created for naming but holds no run
    assert!(case_dir_entries(&config).is_empty());
    assert_eq!(supervisor.stops().len(), 1);
    assert!(plotter.requests().is_empty());

    Ok(())
}

#[tokio::test]
async fn launch_failure_tears_down_generators_already_started() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let mut config = setup_config(&tmp, 10, 10)?;
    config.gpu = LoadGenerator {
        enabled: true,
        path: PathBuf::from("gpu_load"),
        args: vec![],
    };

    let supervisor = RecordingSupervisor::failing(ProcessRole::GpuLoad);
    let abort = ScriptedAbort::default();
    let plotter = RecordingPlotter::returning(PlotStatus::Success);

    let outcome = run_once(&config, &supervisor, &abort, &plotter).await;
    assert!(matches!(outcome, RunOutcome::Failed(RunError::Launch(_))));
    assert_eq!(outcome.exit_code(), 1);

    assert_eq!(supervisor.start_count(), 2);
    let stops = supervisor.stops();
    assert_eq!(stops.len(), 1);
    assert_eq!(
        stops[0].0.iter().map(|handle| handle.role).collect::<Vec<_>>(),
        vec![ProcessRole::CpuLoad]
    );
    assert_eq!(abort.clears.load(Ordering::SeqCst), 1);
    assert!(!config.case_root().exists());
    assert!(plotter.requests().is_empty());

    Ok(())
}

#[tokio::test]
async fn plot_failure_exit_code_passes_through_and_cleanup_still_runs() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let mut config = setup_config(&tmp, 0, 1)?;
    config.cleanup.truncate_telemetry = true;

    let supervisor = RecordingSupervisor::default();
    let abort = ScriptedAbort::default();
    let plotter = RecordingPlotter::returning(PlotStatus::ExitCode(3));

    let outcome = run_once(&config, &supervisor, &abort, &plotter).await;
    assert!(outcome.is_completed());
    assert_eq!(outcome.exit_code(), 3);
    assert_eq!(std::fs::metadata(&config.telemetry_csv)?.len(), 0);

    Ok(())
}

#[tokio::test]
async fn repeated_runs_get_increasing_versions() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let config = setup_config(&tmp, 0, 1)?;
    let supervisor = RecordingSupervisor::default();
    let abort = ScriptedAbort::default();
    let plotter = RecordingPlotter::returning(PlotStatus::Success);

    run_once(&config, &supervisor, &abort, &plotter).await;
    let outcome = run_once(&config, &supervisor, &abort, &plotter).await;

    let RunOutcome::Completed(run) = &outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(run.identity.version, 2);

    let mut entries = case_dir_entries(&config);
    entries.sort();
    assert_eq!(entries, vec!["CPU_W0_L0_V1", "CPU_W0_L0_V2"]);

    Ok(())
}

#[tokio::test]
async fn ambient_logger_is_supervised_and_its_csv_handed_off() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let mut config = setup_config(&tmp, 0, 1)?;
    let logger = tmp.path().join("ambient_logger");
    let ambient_csv = tmp.path().join("ambient.csv");
    std::fs::write(&logger, "")?;
    std::fs::write(&ambient_csv, "timestamp,temp_c\n")?;
    config.ambient.enabled = true;
    config.ambient.logger = Some(logger);
    config.ambient.csv = Some(ambient_csv.clone());

    let supervisor = RecordingSupervisor::default();
    let abort = ScriptedAbort::default();
    let plotter = RecordingPlotter::returning(PlotStatus::Success);

    let outcome = run_once(&config, &supervisor, &abort, &plotter).await;
    assert!(outcome.is_completed());

    let requests = plotter.requests();
    assert_eq!(requests[0].ambient_csv.as_deref(), Some(ambient_csv.as_path()));

    let stops = supervisor.stops();
    assert!(stops[0]
        .0
        .iter()
        .any(|handle| handle.role == ProcessRole::AmbientLogger));
    // ambient logger is stopped by handle, never swept by name
    assert!(!stops[0].1.contains(&"ambient_logger".to_string()));

    assert!(!ambient_csv.exists());

    Ok(())
}

#[tokio::test]
async fn ambient_launch_failure_does_not_stop_the_run() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let mut config = setup_config(&tmp, 0, 1)?;
    let logger = tmp.path().join("ambient_logger");
    std::fs::write(&logger, "")?;
    config.ambient.enabled = true;
    config.ambient.logger = Some(logger);
    config.ambient.csv = Some(tmp.path().join("ambient.csv"));

    let supervisor = RecordingSupervisor::failing(ProcessRole::AmbientLogger);
    let abort = ScriptedAbort::default();
    let plotter = RecordingPlotter::returning(PlotStatus::Success);

    let outcome = run_once(&config, &supervisor, &abort, &plotter).await;
    assert!(outcome.is_completed());
    assert!(plotter.requests()[0].ambient_csv.is_none());
    assert!(supervisor.stops()[0]
        .0
        .iter()
        .all(|handle| handle.role.is_load()));

    Ok(())
}

#[tokio::test]
async fn window_bounds_follow_the_clock() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let config = setup_config(&tmp, 60, 120)?;
    let supervisor = RecordingSupervisor::default();
    let abort = ScriptedAbort::default();
    let plotter = RecordingPlotter::returning(PlotStatus::Success);

    let outcome = run_once(&config, &supervisor, &abort, &plotter).await;
    let RunOutcome::Completed(run) = &outcome else {
        panic!("expected completion, got {outcome:?}");
    };

    assert_eq!(run.identity.to_string(), "CPU_W1_L2_V1");
    assert_eq!(
        format_timestamp(&run.window.start()),
        "2026-10-18 12:01:00.000"
    );
    assert_eq!(format_timestamp(&run.window.end()), "2026-10-18 12:03:00.000");
    assert!(Path::new(&run.output_dir).is_dir());

    Ok(())
}

#[tokio::test]
async fn interrupt_gate_closes_when_teardown_starts() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let config = setup_config(&tmp, 0, 1)?;
    let supervisor = RecordingSupervisor::default();
    let abort = ScriptedAbort::default();
    let plotter = RecordingPlotter::returning(PlotStatus::Success);
    let gate = InterruptGate::default();
    let clock = ManualClock::starting_at(start_time());

    let outcome = Orchestrator::new(&config, &supervisor, &clock, &abort, &plotter)
        .with_interrupt_gate(&gate)
        .run()
        .await;
    assert!(outcome.is_completed());
    assert!(!gate.is_armed());

    // a Ctrl-C after the run must not leave a raised flag for the next one
    assert!(!gate.raise(&abort));
    assert!(!abort.raised.load(Ordering::SeqCst));

    Ok(())
}

#[tokio::test]
async fn aborted_run_deletes_ambient_csv() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let mut config = setup_config(&tmp, 3, 5)?;
    let logger = tmp.path().join("ambient_logger");
    let ambient_csv = tmp.path().join("ambient.csv");
    std::fs::write(&logger, "")?;
    std::fs::write(&ambient_csv, "timestamp,temp_c\n")?;
    config.ambient.enabled = true;
    config.ambient.logger = Some(logger);
    config.ambient.csv = Some(ambient_csv.clone());

    let supervisor = RecordingSupervisor::default();
    let abort = ScriptedAbort::tripping_after(4);
    let plotter = RecordingPlotter::returning(PlotStatus::Success);

    let outcome = run_once(&config, &supervisor, &abort, &plotter).await;
    assert!(matches!(outcome, RunOutcome::Aborted(_)));
    assert!(!ambient_csv.exists());
    assert!(case_dir_entries(&config).is_empty());

    Ok(())
}

#[tokio::test]
async fn launch_failure_deletes_ambient_csv() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let mut config = setup_config(&tmp, 3, 5)?;
    let logger = tmp.path().join("ambient_logger");
    let ambient_csv = tmp.path().join("ambient.csv");
    std::fs::write(&logger, "")?;
    std::fs::write(&ambient_csv, "timestamp,temp_c\n")?;
    config.ambient.enabled = true;
    config.ambient.logger = Some(logger);
    config.ambient.csv = Some(ambient_csv.clone());

    let supervisor = RecordingSupervisor::failing(ProcessRole::CpuLoad);
    let abort = ScriptedAbort::default();
    let plotter = RecordingPlotter::returning(PlotStatus::Success);

    let outcome = run_once(&config, &supervisor, &abort, &plotter).await;
    assert!(matches!(outcome, RunOutcome::Failed(RunError::Launch(_))));
    // the ambient logger started before the failing generator and was stopped by handle
    assert!(supervisor.stops()[0]
        .0
        .iter()
        .any(|handle| handle.role == ProcessRole::AmbientLogger));
    assert!(!ambient_csv.exists());

    Ok(())
}
