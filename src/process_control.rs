/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use async_trait::async_trait;
use itertools::Itertools;
use serde::Serialize;
use std::{
    ffi::OsStr,
    fmt::Display,
    path::{Path, PathBuf},
    time::Duration,
};
use subprocess::{Exec, ExitStatus, NullFile};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, RefreshKind, Signal, System};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_LAUNCH_GRACE: Duration = Duration::from_secs(2);
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);
const MIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessRole {
    CpuLoad,
    GpuLoad,
    AmbientLogger,
}
impl ProcessRole {
    pub fn is_load(&self) -> bool {
        matches!(self, ProcessRole::CpuLoad | ProcessRole::GpuLoad)
    }
}
impl Display for ProcessRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ProcessRole::CpuLoad => "cpu load generator",
            ProcessRole::GpuLoad => "gpu load generator",
            ProcessRole::AmbientLogger => "ambient logger",
        })
    }
}

/// An OS process started by the supervisor. The pid is only an identifier, liveness is looked
/// up afresh every time it matters. A pid of zero means "not started".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
    pub role: ProcessRole,
    pub name: String,
}
impl ProcessHandle {
    pub fn not_started(role: ProcessRole) -> Self {
        Self {
            pid: 0,
            role,
            name: String::new(),
        }
    }

    pub fn is_started(&self) -> bool {
        self.pid != 0
    }
}

/// Everything needed to launch an external executable.
#[derive(Debug, Clone, PartialEq)]
pub struct Launch {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Defaults to the directory containing the resolved program.
    pub working_dir: Option<PathBuf>,
}
impl Launch {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("{role}: unable to launch {program:?}: {reason}")]
    LaunchFailure {
        role: ProcessRole,
        program: PathBuf,
        reason: String,
    },

    #[error("{role}: {program:?} exited immediately after launch ({status})")]
    ImmediateExit {
        role: ProcessRole,
        program: PathBuf,
        status: String,
    },
}

/// Starts and stops external processes. Nothing else in the crate touches process lifecycle.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Launches a process and verifies it is still running after a short grace delay.
    async fn start(&self, launch: &Launch, role: ProcessRole) -> Result<ProcessHandle, LaunchError>;

    /// Stops the given processes, gracefully first and then by force, and finally force-kills
    /// any process whose name matches one of `sweep_names`. Never fails.
    async fn stop(&self, handles: Vec<ProcessHandle>, sweep_names: &[String]);
}

/// Supervises real OS processes.
#[derive(Debug, Clone)]
pub struct OsSupervisor {
    launch_grace: Duration,
    stop_grace: Duration,
}
impl Default for OsSupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_LAUNCH_GRACE, DEFAULT_STOP_GRACE)
    }
}
impl OsSupervisor {
    /// Grace periods shorter than one second are raised to one second.
    pub fn new(launch_grace: Duration, stop_grace: Duration) -> Self {
        Self {
            launch_grace: launch_grace.max(MIN_GRACE),
            stop_grace: stop_grace.max(MIN_GRACE),
        }
    }

    /// Force-kills every running process whose name matches one of `names`.
    ///
    /// # Returns
    ///
    /// The number of processes a kill was delivered to.
    pub fn sweep(names: &[String]) -> usize {
        if names.is_empty() {
            return 0;
        }

        let system = process_snapshot();
        let mut killed = 0;
        for (pid, process) in system.processes() {
            if !is_live_status(process.status()) || !matches_any(process.name(), names) {
                continue;
            }

            if process.kill() {
                info!(
                    "Killed stray process {} ({})",
                    process.name().to_string_lossy(),
                    pid
                );
                killed += 1;
            } else {
                warn!(
                    "Failed to kill stray process {} ({})",
                    process.name().to_string_lossy(),
                    pid
                );
            }
        }
        killed
    }
}

#[async_trait]
impl Supervisor for OsSupervisor {
    async fn start(&self, launch: &Launch, role: ProcessRole) -> Result<ProcessHandle, LaunchError> {
        let program = resolve_program(&launch.program).map_err(|reason| {
            LaunchError::LaunchFailure {
                role,
                program: launch.program.clone(),
                reason,
            }
        })?;

        let working_dir = launch
            .working_dir
            .clone()
            .or_else(|| program.parent().map(Path::to_path_buf))
            .filter(|dir| !dir.as_os_str().is_empty());

        debug!(
            "Launching {} {:?} {} in {:?}",
            role,
            program,
            launch.args.iter().join(" "),
            working_dir
        );

        // Exec is not Send, only the Popen may live across the grace wait
        let mut popen = {
            let mut exec = Exec::cmd(&program)
                .args(launch.args.as_slice())
                .stdout(NullFile)
                .stderr(NullFile)
                .detached();
            if let Some(dir) = &working_dir {
                exec = exec.cwd(dir);
            }

            exec.popen().map_err(|err| LaunchError::LaunchFailure {
                role,
                program: program.clone(),
                reason: err.to_string(),
            })?
        };

        let pid = popen.pid();
        tokio::time::sleep(self.launch_grace).await;

        // crashed on launch, or an interactive first-run prompt that bailed out
        if let Some(status) = popen.poll() {
            return Err(LaunchError::ImmediateExit {
                role,
                program,
                status: describe_exit(&status),
            });
        }

        let pid = pid.ok_or_else(|| LaunchError::ImmediateExit {
            role,
            program: program.clone(),
            status: "no pid reported".to_string(),
        })?;

        let name = program
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        info!("Started {} {:?} ({})", role, program, pid);
        Ok(ProcessHandle { pid, role, name })
    }

    async fn stop(&self, handles: Vec<ProcessHandle>, sweep_names: &[String]) {
        let handles = handles
            .into_iter()
            .filter(ProcessHandle::is_started)
            .collect_vec();

        // ask nicely first
        let mut asked = vec![];
        {
            let system = process_snapshot();
            for handle in handles {
                match system.process(Pid::from_u32(handle.pid)) {
                    Some(process) if is_live_status(process.status()) => {
                        let delivered = process
                            .kill_with(Signal::Term)
                            .unwrap_or_else(|| process.kill());
                        if delivered {
                            info!("Stopping {} ({})", handle.role, handle.pid);
                        } else {
                            warn!("Failed to signal {} ({})", handle.role, handle.pid);
                        }
                        asked.push(handle);
                    }
                    _ => debug!("{} ({}) already gone", handle.role, handle.pid),
                }
            }
        }

        if !asked.is_empty() {
            tokio::time::sleep(self.stop_grace).await;

            let system = process_snapshot();
            for handle in asked {
                if let Some(process) = system.process(Pid::from_u32(handle.pid)) {
                    if is_live_status(process.status()) {
                        warn!(
                            "{} ({}) ignored termination, killing it",
                            handle.role, handle.pid
                        );
                        if !process.kill() {
                            warn!("Failed to kill {} ({})", handle.role, handle.pid);
                        }
                    }
                }
            }
        }

        OsSupervisor::sweep(sweep_names);
    }
}

/// Returns true if a process with the given pid exists and has not exited.
pub fn is_running(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    process_snapshot()
        .process(Pid::from_u32(pid))
        .map(|process| is_live_status(process.status()))
        .unwrap_or(false)
}

fn process_snapshot() -> System {
    System::new_with_specifics(RefreshKind::new().with_processes(ProcessRefreshKind::new()))
}

fn is_live_status(status: ProcessStatus) -> bool {
    !matches!(status, ProcessStatus::Zombie | ProcessStatus::Dead)
}

/// Matches a process name against sweep names, ignoring ASCII case and a trailing `.exe`.
fn matches_any(process_name: &OsStr, names: &[String]) -> bool {
    let process_name = process_name.to_string_lossy();
    let process_name = strip_exe(&process_name);
    names
        .iter()
        .any(|name| strip_exe(name).eq_ignore_ascii_case(process_name))
}

fn strip_exe(name: &str) -> &str {
    match name.len().checked_sub(4) {
        Some(idx) if name.is_char_boundary(idx) && name[idx..].eq_ignore_ascii_case(".exe") => {
            &name[..idx]
        }
        _ => name,
    }
}

/// Resolves the program to an existing path. Bare names (no directory component) are looked
/// up on `PATH`.
fn resolve_program(program: &Path) -> Result<PathBuf, String> {
    if program.as_os_str().is_empty() {
        return Err("no executable configured".to_string());
    }

    // absolute, since the child runs from the program's own directory
    if program.exists() {
        return std::path::absolute(program)
            .map_err(|err| format!("unable to resolve {:?}: {}", program, err));
    }

    let is_bare = program.components().count() == 1;
    if is_bare {
        return which::which(program)
            .map_err(|_| format!("{:?} does not exist and is not on PATH", program));
    }

    Err(format!("{:?} does not exist", program))
}

fn describe_exit(status: &ExitStatus) -> String {
    match status {
        ExitStatus::Exited(code) => format!("exit code {code}"),
        ExitStatus::Signaled(signal) => format!("killed by signal {signal}"),
        ExitStatus::Other(code) => format!("status {code}"),
        ExitStatus::Undetermined => "undetermined status".to_string(),
    }
}
