/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    process_control::{Launch, ProcessRole, DEFAULT_LAUNCH_GRACE, DEFAULT_STOP_GRACE},
    run_namer::{whole_minutes, StressLabel},
};
use anyhow::Context;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

#[cfg(not(windows))]
static EXAMPLE_CONFIG: &str = include_str!("templates/thermal-bench.unix.toml");
#[cfg(windows)]
static EXAMPLE_CONFIG: &str = include_str!("templates/thermal-bench.win.toml");

pub const DEFAULT_CONFIG_FILE: &str = "thermal-bench.toml";

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********

/// Immutable input to one orchestration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    pub case_name: String,
    /// Every case gets its own directory of runs under this root.
    pub runs_root: PathBuf,
    pub warmup_sec: u64,
    pub log_sec: u64,
    /// CSV maintained by the external hardware telemetry logger.
    pub telemetry_csv: PathBuf,
    pub abort_file: PathBuf,
    pub cpu: LoadGenerator,
    pub gpu: LoadGenerator,
    pub ambient: Ambient,
    pub plot: Plot,
    pub cleanup: Cleanup,
    pub supervisor: SupervisorTiming,
    /// Extra process names force-killed on teardown and by `stop`.
    pub sweep_names: Vec<String>,
}
impl Default for RunConfig {
    fn default() -> Self {
        Self {
            case_name: "TEST".to_string(),
            runs_root: PathBuf::from("runs"),
            warmup_sec: 20 * 60,
            log_sec: 15 * 60,
            telemetry_csv: PathBuf::new(),
            abort_file: default_abort_file(),
            cpu: LoadGenerator {
                enabled: true,
                ..Default::default()
            },
            gpu: LoadGenerator::default(),
            ambient: Ambient::default(),
            plot: Plot::default(),
            cleanup: Cleanup::default(),
            supervisor: SupervisorTiming::default(),
            sweep_names: vec![],
        }
    }
}
impl RunConfig {
    pub fn write_example_to_file(path: &Path) -> anyhow::Result<File> {
        let mut file = File::create_new(path)
            .context(format!("Unable to create config file {:?}", path))?;
        File::write_all(&mut file, EXAMPLE_CONFIG.as_bytes())?;
        Ok(file)
    }

    pub fn try_from_path(path: &Path) -> anyhow::Result<RunConfig> {
        let mut config_str = String::new();
        fs::File::open(path)
            .context(format!("Unable to open config file {:?}", path))?
            .read_to_string(&mut config_str)?;
        RunConfig::try_from_str(&config_str)
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<RunConfig> {
        toml::from_str::<RunConfig>(conf_str).map_err(|e| anyhow::anyhow!("TOML parsing error: {}", e))
    }

    /// Loads the config file if it exists, otherwise falls back to the defaults.
    pub fn load_or_default(path: &Path) -> anyhow::Result<RunConfig> {
        if path.exists() {
            RunConfig::try_from_path(path)
        } else {
            tracing::debug!("No config file at {:?}, using defaults", path);
            Ok(RunConfig::default())
        }
    }

    pub fn stress_label(&self) -> StressLabel {
        StressLabel::from_enabled(self.cpu.enabled, self.gpu.enabled)
    }

    pub fn any_generator_enabled(&self) -> bool {
        self.cpu.enabled || self.gpu.enabled
    }

    pub fn case_root(&self) -> PathBuf {
        self.runs_root.join(&self.case_name)
    }

    pub fn warmup_minutes(&self) -> u64 {
        whole_minutes(self.warmup_sec)
    }

    pub fn log_minutes(&self) -> u64 {
        whole_minutes(self.log_sec)
    }

    /// The enabled load generators with the role they play.
    pub fn enabled_generators(&self) -> Vec<(ProcessRole, &LoadGenerator)> {
        [(ProcessRole::CpuLoad, &self.cpu), (ProcessRole::GpuLoad, &self.gpu)]
            .into_iter()
            .filter(|(_, generator)| generator.enabled)
            .collect()
    }

    /// Process names to force-kill during teardown: the configured generator executables plus
    /// any extra names.
    pub fn sweep_names(&self) -> Vec<String> {
        [&self.cpu, &self.gpu]
            .into_iter()
            .filter_map(|generator| generator.executable_name())
            .chain(self.sweep_names.iter().cloned())
            .unique_by(|name| name.to_ascii_lowercase())
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LoadGenerator {
    pub enabled: bool,
    pub path: PathBuf,
    pub args: Vec<String>,
}
impl LoadGenerator {
    /// Launched from the directory containing the executable.
    pub fn launch(&self) -> Launch {
        Launch::new(&self.path, self.args.clone())
    }

    fn executable_name(&self) -> Option<String> {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Ambient {
    pub enabled: bool,
    pub interval_sec: f64,
    /// Packaged native logger, preferred when it exists.
    pub logger: Option<PathBuf>,
    /// Interpreted fallback, run as `interpreter script`.
    pub script: Option<PathBuf>,
    pub interpreter: String,
    /// Where the ambient logger writes its CSV. Defaults to a timestamped file in the temp
    /// directory.
    pub csv: Option<PathBuf>,
    pub cal_offset_c: Option<f64>,
}
impl Default for Ambient {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_sec: 1.0,
            logger: None,
            script: None,
            interpreter: "python".to_string(),
            csv: None,
            cal_offset_c: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Plot {
    /// Command line of the plotting stage; the handoff flags are appended.
    pub command: String,
    /// Telemetry column patterns to plot.
    pub patterns: Vec<String>,
}
impl Default for Plot {
    fn default() -> Self {
        Self {
            command: "python cli/plot_hwinfo.py".to_string(),
            patterns: vec![],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Cleanup {
    pub truncate_telemetry: bool,
    pub delete_ambient_csv: bool,
}
impl Default for Cleanup {
    fn default() -> Self {
        Self {
            truncate_telemetry: false,
            delete_ambient_csv: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SupervisorTiming {
    pub launch_grace_sec: u64,
    pub stop_grace_sec: u64,
}
impl Default for SupervisorTiming {
    fn default() -> Self {
        Self {
            launch_grace_sec: DEFAULT_LAUNCH_GRACE.as_secs(),
            stop_grace_sec: DEFAULT_STOP_GRACE.as_secs(),
        }
    }
}
impl SupervisorTiming {
    pub fn launch_grace(&self) -> Duration {
        Duration::from_secs(self.launch_grace_sec)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_sec)
    }
}

pub fn default_abort_file() -> PathBuf {
    std::env::temp_dir().join("thermal-bench").join("abort.flag")
}
