/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::Context;
use serde::Serialize;
use std::{
    fmt::Display,
    fs,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// Upper bound on collisions tolerated while creating a run directory.
const MAX_CREATE_ATTEMPTS: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StressLabel {
    #[serde(rename = "CPU")]
    Cpu,
    #[serde(rename = "GPU")]
    Gpu,
    #[serde(rename = "CPUGPU")]
    CpuGpu,
}
impl StressLabel {
    /// Derives the label from the enabled load generators. Falls back to `Cpu` when neither is
    /// enabled, a configuration the orchestrator rejects before naming anything.
    pub fn from_enabled(cpu: bool, gpu: bool) -> Self {
        match (cpu, gpu) {
            (true, true) => StressLabel::CpuGpu,
            (false, true) => StressLabel::Gpu,
            _ => StressLabel::Cpu,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StressLabel::Cpu => "CPU",
            StressLabel::Gpu => "GPU",
            StressLabel::CpuGpu => "CPUGPU",
        }
    }
}
impl Display for StressLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The versioned name of a single run's output directory,
/// e.g. `CPUGPU_W20_L15_V3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunIdentity {
    pub label: StressLabel,
    pub warmup_minutes: u64,
    pub log_minutes: u64,
    pub version: u32,
}
impl RunIdentity {
    fn prefix(label: StressLabel, warmup_minutes: u64, log_minutes: u64) -> String {
        format!("{label}_W{warmup_minutes}_L{log_minutes}_V")
    }

    fn next_version(self) -> Self {
        Self {
            version: self.version + 1,
            ..self
        }
    }
}
impl Display for RunIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}",
            Self::prefix(self.label, self.warmup_minutes, self.log_minutes),
            self.version
        )
    }
}

/// Rounds a duration in seconds to the nearest whole minute (half rounds up).
pub fn whole_minutes(secs: u64) -> u64 {
    (secs + 30) / 60
}

/// Extracts the version from a sibling directory name if it belongs to the same
/// label/durations family. Matching ignores ASCII case.
fn parse_version(dir_name: &str, prefix: &str) -> Option<u32> {
    if dir_name.len() <= prefix.len() || !dir_name.is_char_boundary(prefix.len()) {
        return None;
    }

    let (head, tail) = dir_name.split_at(prefix.len());
    if !head.eq_ignore_ascii_case(prefix) || !tail.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    tail.parse::<u32>().ok()
}

/// Picks the next version for a run by scanning the sibling directories of `case_root`.
///
/// The scan is not atomic with directory creation, callers must go through
/// [`create_run_dir`] which re-verifies at creation time.
///
/// # Arguments
///
/// * `case_root` - Directory holding all the runs of one test case. It need not exist yet.
/// * `label` - Which load generators were enabled.
/// * `warmup_minutes` - Warm-up duration rounded to whole minutes.
/// * `log_minutes` - Logging duration rounded to whole minutes.
///
/// # Returns
///
/// A run identity whose version is one greater than the highest existing version.
pub fn allocate(
    case_root: &Path,
    label: StressLabel,
    warmup_minutes: u64,
    log_minutes: u64,
) -> anyhow::Result<RunIdentity> {
    let prefix = RunIdentity::prefix(label, warmup_minutes, log_minutes);

    let mut highest = 0;
    match fs::read_dir(case_root) {
        Ok(entries) => {
            for entry in entries {
                let entry = entry.context(format!("Failed to read entry in {:?}", case_root))?;
                if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    continue;
                }

                let name = entry.file_name();
                if let Some(version) = parse_version(&name.to_string_lossy(), &prefix) {
                    highest = highest.max(version);
                }
            }
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).context(format!("Failed to scan case directory {:?}", case_root))
        }
    }

    Ok(RunIdentity {
        label,
        warmup_minutes,
        log_minutes,
        version: highest + 1,
    })
}

/// Creates the directory for `identity` under `case_root`, bumping the version until a free
/// name is found. Never reuses an existing directory.
///
/// # Returns
///
/// The identity that was actually created (which may differ from the one passed in) and the
/// path of the new directory.
pub fn create_run_dir(
    case_root: &Path,
    identity: RunIdentity,
) -> io::Result<(RunIdentity, PathBuf)> {
    fs::create_dir_all(case_root)?;

    let mut identity = identity;
    for _ in 0..MAX_CREATE_ATTEMPTS {
        let path = case_root.join(identity.to_string());
        match fs::create_dir(&path) {
            Ok(()) => {
                debug!("Created run directory {:?}", path);
                return Ok((identity, path));
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                warn!("Run directory {:?} appeared after allocation, trying next version", path);
                identity = identity.next_version();
            }
            Err(err) => return Err(err),
        }
    }

    Err(io::Error::new(
        ErrorKind::AlreadyExists,
        format!(
            "No free run directory under {:?} after {} attempts",
            case_root, MAX_CREATE_ATTEMPTS
        ),
    ))
}
