use std::fmt::Write as _;
use std::io::{self, Write};

use serde::Serialize;

use crate::app::{FailuresReport, GroupsReport, ProgressEvent, ProgressSink, RunReport, StatusReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print<T: Serialize>(value: &T) -> io::Result<()> {
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

/// Progress lines on stderr, leaving stdout for the report.
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn event(&self, event: ProgressEvent) {
        let mut stderr = io::stderr();
        let _ = match event.elapsed {
            Some(elapsed) => writeln!(stderr, "{} ({:.1}s)", event.message, elapsed.as_secs_f64()),
            None => writeln!(stderr, "{}", event.message),
        };
    }
}

pub struct HumanOutput;

impl HumanOutput {
    pub fn print(text: &str) -> io::Result<()> {
        let mut stdout = io::stdout();
        stdout.write_all(text.as_bytes())?;
        Ok(())
    }

    pub fn render_run(report: &RunReport) -> String {
        let mut out = String::new();
        if report.dry_run {
            let _ = writeln!(out, "dry run: no side effects were executed");
        }
        for cleared in &report.cleared {
            let _ = writeln!(out, "cleared {}: {} rows", cleared.stage, cleared.rows);
        }
        for summary in &report.stages {
            let _ = writeln!(
                out,
                "{:<10} candidates={} processed={} skipped-already-done={} succeeded={} failed={} cancelled={}",
                summary.stage.as_str(),
                summary.candidates,
                summary.processed,
                summary.skipped_already_done,
                summary.succeeded,
                summary.failed,
                summary.cancelled,
            );
            for key in &summary.planned {
                let _ = writeln!(out, "  would process {key}");
            }
            for failure in summary.failures.iter().chain(&summary.enumeration_errors) {
                let _ = writeln!(out, "  FAILED {}: {}", failure.key, failure.diagnostic);
            }
            for group in &summary.stale_groups {
                let _ = writeln!(out, "  STALE {group}: membership changed since it was merged");
            }
        }
        if report.interrupted {
            let _ = writeln!(out, "interrupted: rerun to continue from the stage log");
        }
        let _ = writeln!(out, "finished in {:.1}s", report.elapsed_ms as f64 / 1000.0);
        out
    }

    pub fn render_status(report: &StatusReport) -> String {
        let mut out = String::new();
        for counts in &report.stages {
            let _ = writeln!(
                out,
                "{:<10} completed={} failure-rows={}",
                counts.stage.as_str(),
                counts.completed,
                counts.failure_rows
            );
        }
        let _ = writeln!(out, "discovered products: {}", report.discovered_products);
        let _ = writeln!(out, "groups: {}", report.groups);
        out
    }

    pub fn render_failures(report: &FailuresReport) -> String {
        if report.failures.is_empty() {
            return "no outstanding failures\n".to_string();
        }
        let mut out = String::new();
        for entry in &report.failures {
            let _ = writeln!(
                out,
                "{} {:<10} {} {}",
                entry.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                entry.stage.as_str(),
                entry.item_key,
                entry.diagnostic.as_deref().unwrap_or("")
            );
        }
        out
    }

    pub fn render_groups(report: &GroupsReport) -> String {
        let mut out = String::new();
        for group in &report.groups {
            let merged = match group.merged_source_count {
                Some(count) if group.stale => format!("merged from {count} (stale)"),
                Some(count) => format!("merged from {count}"),
                None => "not merged".to_string(),
            };
            let _ = writeln!(out, "{:<32} members={:<5} {merged}", group.group, group.members);
        }
        out
    }
}
