use std::io::{self, Write};

use serde::Serialize;

use crate::report::{RunReport, SkipKind};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Text,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &RunReport) -> io::Result<()> {
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

pub struct TextOutput;

impl TextOutput {
    pub fn print_report(report: &RunReport) -> io::Result<()> {
        let mut stdout = io::stdout();
        stdout.write_all(Self::summary(report).as_bytes())
    }

    /// End-of-run summary: work done, then skip counts by kind.
    pub fn summary(report: &RunReport) -> String {
        let mut out = String::new();
        if report.all_complete() {
            out.push_str("all stages already complete\n");
        }
        for stage in &report.stages {
            let state = if stage.already_complete {
                "complete".to_string()
            } else {
                format!("{} produced", stage.produced)
            };
            out.push_str(&format!("{:<9} {:<4} {state}\n", stage.stage, stage.variable));
        }
        out.push_str(&format!("fetched: {}\n", report.fetched));
        out.push_str(&format!("deleted (already published): {}\n", report.deleted.len()));
        if !report.samples_written.is_empty() {
            out.push_str(&format!("point series written: {}\n", report.samples_written.len()));
        }
        for kind in [
            SkipKind::MissingInput,
            SkipKind::FetchFailed,
            SkipKind::NonConformingName,
            SkipKind::GeoTransform,
            SkipKind::CatalogUnavailable,
            SkipKind::Failed,
        ] {
            let count = report.count(kind);
            if count > 0 {
                out.push_str(&format!("skipped ({kind}): {count}\n"));
            }
        }
        out
    }
}
