/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::abort_signal::AbortSignal;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use indicatif::{ProgressBar, ProgressStyle};
use std::{fmt::Display, time::Duration};
use thiserror::Error;
use tracing::{debug, info, trace};

const TICK: Duration = Duration::from_secs(1);

/// Source of wall-clock time and of the one-second wait between ticks.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
    async fn sleep(&self, period: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }

    async fn sleep(&self, period: Duration) {
        tokio::time::sleep(period).await
    }
}

/// Non-blocking check for an interactive cancel key-press.
pub trait CancelKeys: Send {
    fn cancel_requested(&mut self) -> bool;
}

/// Watches the controlling terminal for `q`, `Esc` or `Ctrl-C`.
#[derive(Debug, Default)]
pub struct TerminalKeys;

impl CancelKeys for TerminalKeys {
    fn cancel_requested(&mut self) -> bool {
        // raw mode only for the duration of the poll so log output is unaffected
        if enable_raw_mode().is_err() {
            return false;
        }

        let mut cancel = false;
        while let Ok(true) = event::poll(Duration::ZERO) {
            match event::read() {
                Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => {
                    match (key.modifiers, key.code) {
                        (_, KeyCode::Char('q'))
                        | (_, KeyCode::Char('Q'))
                        | (_, KeyCode::Esc)
                        | (KeyModifiers::CONTROL, KeyCode::Char('c')) => cancel = true,
                        _ => {}
                    }
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }

        disable_raw_mode().ok();
        cancel
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortSource {
    Signal,
    Key,
}
impl Display for AbortSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AbortSource::Signal => "abort signal",
            AbortSource::Key => "cancel key",
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{phase} aborted by {by} with {remaining_secs}s remaining")]
pub struct Aborted {
    pub phase: String,
    pub by: AbortSource,
    pub remaining_secs: u64,
}

/// A cooperative, polled countdown. Not resumable: once a run has been aborted the caller must
/// treat the whole orchestration as finished.
pub struct PhaseTimer<'a> {
    clock: &'a dyn Clock,
    abort: &'a dyn AbortSignal,
    keys: Option<Box<dyn CancelKeys + 'a>>,
    show_progress: bool,
}
impl<'a> PhaseTimer<'a> {
    pub fn new(clock: &'a dyn Clock, abort: &'a dyn AbortSignal) -> Self {
        Self {
            clock,
            abort,
            keys: None,
            show_progress: false,
        }
    }

    /// Also cancel on an interactive key-press.
    pub fn with_keys(mut self, keys: Box<dyn CancelKeys + 'a>) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Draw a progress bar on the terminal while counting down.
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Counts down `duration_secs` one second at a time.
    ///
    /// Before every tick the abort signal and, if interactive, the cancel keys are checked.
    /// A duration of zero completes immediately without polling.
    ///
    /// # Returns
    ///
    /// `Ok(())` once the full duration has elapsed, `Err(Aborted)` as soon as a cancellation
    /// is observed.
    pub async fn run(&mut self, label: &str, duration_secs: u64) -> Result<(), Aborted> {
        if duration_secs == 0 {
            debug!("{label}: nothing to wait for");
            return Ok(());
        }

        info!("{label}: {} remaining", format_remaining(duration_secs));
        let bar = self.progress_bar(label, duration_secs);

        let mut remaining = duration_secs;
        let mut first_tick = true;
        while remaining > 0 {
            if let Some(by) = self.cancellation() {
                bar.abandon_with_message(format!("{label} aborted"));
                return Err(Aborted {
                    phase: label.to_string(),
                    by,
                    remaining_secs: remaining,
                });
            }

            if should_report(remaining, first_tick) {
                info!("{label}: {} remaining", format_remaining(remaining));
            }
            trace!("{label}: {remaining}s remaining");
            first_tick = false;

            bar.set_message(format!("{label} {}", format_remaining(remaining)));
            self.clock.sleep(TICK).await;
            remaining -= 1;
            bar.set_position(duration_secs - remaining);
        }

        bar.finish_and_clear();
        info!("{label}: complete");
        Ok(())
    }

    fn cancellation(&mut self) -> Option<AbortSource> {
        if self.abort.is_set() {
            return Some(AbortSource::Signal);
        }

        match self.keys.as_mut() {
            Some(keys) => keys.cancel_requested().then_some(AbortSource::Key),
            None => None,
        }
    }

    fn progress_bar(&self, label: &str, duration_secs: u64) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }

        let bar = ProgressBar::new(duration_secs);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} {msg:24} [{wide_bar:.cyan/blue}] {pos}/{len}s",
        ) {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_message(label.to_string());
        bar
    }
}

/// Coarse progress: once per full minute remaining, never on the first tick.
fn should_report(remaining_secs: u64, first_tick: bool) -> bool {
    !first_tick && remaining_secs % 60 == 0
}

pub fn format_remaining(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}
