/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    handoff::{format_timestamp, PlotStatus},
    orchestrator::RunOutcome,
    phase_timer::format_remaining,
};
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;
use term_table::{row, row::Row, rows, table_cell::*, Table, TableStyle};

/// Machine readable summary of a finished orchestration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct OutcomeReport {
    pub outcome: &'static str,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_end: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plot: Option<PlotStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
impl From<&RunOutcome> for OutcomeReport {
    fn from(outcome: &RunOutcome) -> Self {
        let base = OutcomeReport {
            outcome: "",
            exit_code: outcome.exit_code(),
            run_id: None,
            output_dir: None,
            window_start: None,
            window_end: None,
            plot: None,
            message: None,
        };

        match outcome {
            RunOutcome::Completed(run) => OutcomeReport {
                outcome: "completed",
                run_id: Some(run.identity.to_string()),
                output_dir: Some(run.output_dir.clone()),
                window_start: Some(format_timestamp(&run.window.start())),
                window_end: Some(format_timestamp(&run.window.end())),
                plot: Some(run.plot.clone()),
                ..base
            },
            RunOutcome::Aborted(aborted) => OutcomeReport {
                outcome: "aborted",
                message: Some(aborted.to_string()),
                ..base
            },
            RunOutcome::Failed(err) => OutcomeReport {
                outcome: "failed",
                message: Some(err.to_string()),
                ..base
            },
        }
    }
}

pub fn to_json(outcome: &RunOutcome) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(&OutcomeReport::from(outcome))?)
}

pub fn print_summary(case_name: &str, outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Completed(run) => {
            let plot = match &run.plot {
                PlotStatus::Success => "ok".green(),
                status => format!("exit {}", status.exit_code()).red(),
            };

            println!("{} / {}:", case_name.bold(), run.identity.to_string().green());
            let table = Table::builder()
                .rows(rows![
                    row![
                        TableCell::builder("Window start".bold()).build(),
                        TableCell::builder("Window end".bold()).build(),
                        TableCell::builder("Duration".bold()).build(),
                        TableCell::builder("Plot".bold()).build(),
                        TableCell::builder("Output".bold()).build()
                    ],
                    row![
                        TableCell::new(format_timestamp(&run.window.start())),
                        TableCell::new(format_timestamp(&run.window.end())),
                        TableCell::new(format_remaining(run.window.elapsed().as_secs())),
                        TableCell::new(plot),
                        TableCell::new(run.output_dir.display())
                    ]
                ])
                .style(TableStyle::rounded())
                .build();

            println!("{}", table.render())
        }

        RunOutcome::Aborted(aborted) => {
            println!("{} {}", "Aborted:".yellow(), aborted);
        }

        RunOutcome::Failed(err) => {
            println!("{} {}", "Failed:".red(), err);
        }
    }
}
