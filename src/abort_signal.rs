/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use chrono::Local;
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, warn};

/// A cross-process cancellation flag.
///
/// Implementations are advisory: none of the methods can fail. A separate invocation of the
/// binary (e.g. `thermal-bench stop`) may call `signal` while another invocation is polling
/// `is_set` in the middle of a phase.
pub trait AbortSignal: Send + Sync {
    /// Raise the flag.
    fn signal(&self);

    /// Lower the flag. Lowering an already lowered flag is a no-op.
    fn clear(&self);

    /// Returns true iff the flag is currently raised.
    fn is_set(&self) -> bool;
}

/// An abort flag backed by the presence of a file. The file contents are irrelevant, only its
/// existence is observed.
#[derive(Debug, Clone)]
pub struct SentinelFile {
    path: PathBuf,
}
impl SentinelFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AbortSignal for SentinelFile {
    fn signal(&self) {
        if let Some(parent) = self.path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                warn!("Unable to create abort flag directory {:?}: {}", parent, err);
            }
        }

        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string();
        match fs::write(&self.path, stamp) {
            Ok(()) => debug!("Abort flag raised at {:?}", self.path),
            Err(err) => warn!("Unable to raise abort flag {:?}: {}", self.path, err),
        }
    }

    fn clear(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Abort flag cleared at {:?}", self.path),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!("Unable to clear abort flag {:?}: {}", self.path, err),
        }
    }

    fn is_set(&self) -> bool {
        self.path.exists()
    }
}

/// Lets an interrupt handler raise the abort signal only while a run can still react to it.
///
/// Once teardown has started the gate is closed, a later interrupt must not leave a raised flag
/// behind for the next run.
#[derive(Debug, Clone)]
pub struct InterruptGate {
    armed: Arc<AtomicBool>,
}
impl Default for InterruptGate {
    fn default() -> Self {
        Self {
            armed: Arc::new(AtomicBool::new(true)),
        }
    }
}
impl InterruptGate {
    /// Raises `signal` if the gate is still armed. Returns whether it did.
    pub fn raise(&self, signal: &dyn AbortSignal) -> bool {
        if !self.is_armed() {
            debug!("Interrupt ignored, run is already tearing down");
            return false;
        }
        signal.signal();
        true
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }
}
