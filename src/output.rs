use std::fmt::Write as _;
use std::io::{self, Write};

use serde::Serialize;

use crate::domain::{InstallState, TitleId};
use crate::orchestrator::BatchResult;
use crate::progress::{KEEP_PERCENT, ProgressEvent, ProgressSink};
use crate::scanner::ScanReport;

pub const FAILURE_DISPLAY_LIMIT: usize = 30;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_batch(result: &BatchResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_scan(report: &ScanReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn event(&self, event: ProgressEvent) {
        if event.percent == KEEP_PERCENT {
            eprintln!("       {}", event.message);
        } else {
            eprintln!("[{:>3}%] {}", event.percent, event.message);
        }
    }
}

pub fn batch_summary(result: &BatchResult) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} succeeded, {} failed, {} total in {:.1}s ({})",
        result.succeeded(),
        result.failed(),
        result.total(),
        result.elapsed_secs,
        result.strategy
    );
    if result.repaired > 0 {
        let _ = writeln!(out, "repair pass retried {} titles", result.repaired);
    }
    if let Some(remaining) = result.api_remaining {
        let _ = writeln!(out, "API quota remaining: {remaining}");
    }
    if result.cancelled {
        let _ = writeln!(out, "batch cancelled");
    }
    for outcome in result.failures(FAILURE_DISPLAY_LIMIT) {
        let _ = writeln!(out, "  {}: {}", outcome.title, outcome.message());
    }
    let hidden = result.failed().saturating_sub(FAILURE_DISPLAY_LIMIT);
    if hidden > 0 {
        let _ = writeln!(out, "  ... and {hidden} more failures");
    }
    out
}

pub fn scan_lines(batch: &[(TitleId, InstallState)]) -> String {
    let mut out = String::new();
    for (title, state) in batch {
        let _ = writeln!(out, "{title}\t{state}");
    }
    out
}

pub fn scan_totals(report: &ScanReport) -> String {
    format!(
        "{} active, {} disabled",
        report.count(InstallState::Active),
        report.count(InstallState::Disabled)
    )
}
