// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Presentation Layer
//!
//! Rendering of engine state for the command line. Everything here turns
//! structures into strings; printing stays in the binary.

use tidal_domain::{FieldValue, StatisticsSnapshot};

use crate::application::use_cases::run_benchmark::BenchmarkReport;

/// One line per query with its counters.
pub fn render_statistics(snapshots: &[StatisticsSnapshot]) -> String {
    if snapshots.is_empty() {
        return "no queries registered".to_string();
    }
    let mut out = String::from("query      buffers      tasks       tuples      started\n");
    for snapshot in snapshots {
        let started = snapshot
            .started_at_utc()
            .map(|ts| ts.format("%H:%M:%S%.3f").to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{:<10} {:<12} {:<11} {:<11} {}\n",
            snapshot.query_id,
            snapshot.processed_buffers,
            snapshot.processed_tasks,
            snapshot.processed_tuples,
            started,
        ));
    }
    out
}

/// Human-readable benchmark summary with a sample of the window results.
pub fn render_benchmark_report(report: &BenchmarkReport) -> String {
    let mut out = format!(
        "processed {} buffers / {} tuples in {:?}; {} window rows\n",
        report.produced_buffers,
        report.produced_tuples,
        report.elapsed,
        report.window_rows.len(),
    );
    for row in report.window_rows.iter().take(10) {
        out.push_str("  ");
        out.push_str(&render_row(row));
        out.push('\n');
    }
    if report.window_rows.len() > 10 {
        out.push_str(&format!("  ... {} more\n", report.window_rows.len() - 10));
    }
    out
}

fn render_row(row: &[FieldValue]) -> String {
    row.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(" | ")
}
