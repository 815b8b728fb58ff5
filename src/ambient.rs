/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{config::Ambient, process_control::Launch};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where the ambient logger should write its CSV for this run.
pub fn csv_path(cfg: &Ambient, case_name: &str, started: &DateTime<Local>) -> PathBuf {
    cfg.csv.clone().unwrap_or_else(|| {
        std::env::temp_dir().join("thermal-bench").join(format!(
            "ambient_{}_{}.csv",
            sanitize(case_name),
            started.format("%Y%m%d_%H%M%S")
        ))
    })
}

/// Works out how to launch the ambient logger, preferring the packaged native logger over the
/// interpreted script.
///
/// # Returns
///
/// `None` when neither is available, ambient logging is then silently skipped.
pub fn launch(cfg: &Ambient, csv: &Path) -> Option<Launch> {
    let mut logger_args = vec![
        "--out".to_string(),
        csv.to_string_lossy().to_string(),
        "--interval".to_string(),
        format_interval(cfg.interval_sec),
    ];
    if let Some(offset) = cfg.cal_offset_c {
        logger_args.push("--cal-offset-c".to_string());
        logger_args.push(offset.to_string());
    }

    if let Some(logger) = cfg.logger.as_ref().filter(|path| path.is_file()) {
        debug!("Using native ambient logger {:?}", logger);
        return Some(Launch::new(logger, logger_args));
    }

    // absolute, since the interpreter runs from the script's directory
    let script = cfg
        .script
        .as_ref()
        .filter(|path| path.is_file())
        .and_then(|path| std::path::absolute(path).ok())?;
    let interpreter = match which::which(&cfg.interpreter) {
        Ok(interpreter) => interpreter,
        Err(_) => {
            debug!("Interpreter {} not found on PATH", cfg.interpreter);
            return None;
        }
    };
    debug!("Using ambient logger script {:?} via {:?}", script, interpreter);

    let mut args = vec![script.to_string_lossy().to_string()];
    args.extend(logger_args);

    let launch = Launch::new(interpreter, args);
    match script.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        Some(dir) => Some(launch.in_dir(dir)),
        None => Some(launch),
    }
}

fn format_interval(secs: f64) -> String {
    if secs > 0.0 {
        secs.to_string()
    } else {
        "1".to_string()
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
