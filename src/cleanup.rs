/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Best-effort cleanup steps. Every step reports a [`CleanupOutcome`] instead of an error so a
//! sequence of steps can never be cut short by one failing.

use std::{
    fs::{self, OpenOptions},
    io::{self, ErrorKind},
    path::Path,
};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Done,
    /// Nothing to clean up, the target was already gone.
    Skipped,
    Warning(String),
}
impl CleanupOutcome {
    pub fn is_warning(&self) -> bool {
        matches!(self, CleanupOutcome::Warning(_))
    }
}

/// Attempt a cleanup action, capture the outcome and never propagate.
///
/// # Arguments
///
/// * `what` - Human readable description of the action, used in log messages.
/// * `action` - The action to attempt.
///
/// # Returns
///
/// `Done` on success, `Skipped` if the action failed because the target no longer exists and
/// `Warning` for any other failure (e.g. a file locked by another process).
pub fn attempt<F>(what: &str, action: F) -> CleanupOutcome
where
    F: FnOnce() -> io::Result<()>,
{
    match action() {
        Ok(()) => {
            debug!("{what}: done");
            CleanupOutcome::Done
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!("{what}: nothing to do");
            CleanupOutcome::Skipped
        }
        Err(err) => {
            warn!("{what} failed: {err}");
            CleanupOutcome::Warning(format!("{what} failed: {err}"))
        }
    }
}

/// Empties a file without removing it.
pub fn truncate_file(path: &Path) -> CleanupOutcome {
    attempt(&format!("truncate {}", path.display()), || {
        OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(path)
            .map(|_| ())
    })
}

pub fn remove_file(path: &Path) -> CleanupOutcome {
    attempt(&format!("remove file {}", path.display()), || {
        fs::remove_file(path)
    })
}

/// Recursively removes a directory. Removing a directory that no longer exists is `Skipped`.
pub fn remove_dir_all(path: &Path) -> CleanupOutcome {
    attempt(&format!("remove directory {}", path.display()), || {
        fs::remove_dir_all(path)
    })
}
