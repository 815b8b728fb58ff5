/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod abort_signal;
pub mod ambient;
pub mod clap_args;
pub mod cleanup;
pub mod config;
pub mod handoff;
pub mod orchestrator;
pub mod phase_timer;
pub mod process_control;
pub mod report;
pub mod run_namer;
