use std::fmt;

use serde::Serialize;

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipKind {
    MissingInput,
    FetchFailed,
    GeoTransform,
    CatalogUnavailable,
    NonConformingName,
    Failed,
}

impl fmt::Display for SkipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SkipKind::MissingInput => "missing input",
            SkipKind::FetchFailed => "failed fetch",
            SkipKind::GeoTransform => "georeference error",
            SkipKind::CatalogUnavailable => "catalog unavailable",
            SkipKind::NonConformingName => "non-conforming filename",
            SkipKind::Failed => "other failure",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkipEntry {
    pub context: String,
    pub kind: SkipKind,
    pub message: String,
}

/// What a stage did for one variable.
#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    pub stage: String,
    pub variable: String,
    pub already_complete: bool,
    pub produced: usize,
}

/// Accumulates everything a run skipped or produced so callers can assert on it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub skipped: Vec<SkipEntry>,
    pub stages: Vec<StageOutcome>,
    pub fetched: usize,
    pub deleted: Vec<String>,
    pub samples_written: Vec<String>,
}

impl RunReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip(&mut self, context: impl Into<String>, kind: SkipKind, message: impl Into<String>) {
        self.skipped.push(SkipEntry {
            context: context.into(),
            kind,
            message: message.into(),
        });
    }

    pub fn record_error(&mut self, context: impl Into<String>, error: &PipelineError) {
        self.skip(context, error.kind(), error.to_string());
    }

    pub fn stage(&mut self, stage: &str, variable: &str, already_complete: bool, produced: usize) {
        self.stages.push(StageOutcome {
            stage: stage.to_string(),
            variable: variable.to_string(),
            already_complete,
            produced,
        });
    }

    pub fn count(&self, kind: SkipKind) -> usize {
        self.skipped.iter().filter(|entry| entry.kind == kind).count()
    }

    /// True when every stage of the run found its output already on disk.
    pub fn all_complete(&self) -> bool {
        self.fetched == 0 && self.stages.iter().all(|stage| stage.already_complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_by_kind() {
        let mut report = RunReport::new();
        report.skip("PREC 2024-05-01", SkipKind::MissingInput, "absent");
        report.skip("PREC 2024-05-02", SkipKind::MissingInput, "absent");
        report.skip("notes.txt", SkipKind::NonConformingName, "no date");
        assert_eq!(report.count(SkipKind::MissingInput), 2);
        assert_eq!(report.count(SkipKind::NonConformingName), 1);
        assert_eq!(report.count(SkipKind::FetchFailed), 0);
    }

    #[test]
    fn error_kind_routes_to_bucket() {
        let mut report = RunReport::new();
        let err = PipelineError::Fetch {
            locator: "https://example.org/a.gz".to_string(),
            message: "timeout".to_string(),
        };
        report.record_error("PREC", &err);
        assert_eq!(report.count(SkipKind::FetchFailed), 1);
    }
}
