//! Per-stage completeness checks over a date range.
//!
//! Presence of a file is the "done" signal for `(variable, date, stage)`. This
//! module is the only place that interprets it: the pipeline asks here before
//! doing work and never probes paths on its own. Content is not validated, so a
//! corrupt file that passes the store's size floor counts as complete.
//!
//! A day the catalog already publishes is done for every stage even though its
//! clipped file was deleted, so it is never fetched again.

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info};

use crate::calendar::DateRange;
use crate::catalog::LayerDates;
use crate::domain::{Stage, Variable, VariableTable};
use crate::store::{ArtifactKey, ArtifactStore};

/// Furthest lifecycle stage present on disk for one variable and day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactState {
    Pending,
    Fetched,
    Normalized,
    Clipped,
    /// Published by the catalog; the local clipped file is gone or about to go.
    Reconciled,
}

pub struct CompletionIndex<'a, S: ArtifactStore + ?Sized> {
    store: &'a S,
    table: &'a VariableTable,
    published: Option<&'a LayerDates>,
}

impl<S: ArtifactStore + ?Sized> Clone for CompletionIndex<'_, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S: ArtifactStore + ?Sized> Copy for CompletionIndex<'_, S> {}

impl<'a, S: ArtifactStore + ?Sized> CompletionIndex<'a, S> {
    pub fn new(store: &'a S, table: &'a VariableTable) -> Self {
        Self {
            store,
            table,
            published: None,
        }
    }

    /// Dates the catalog publishes, keyed by layer (the variable's directory name).
    pub fn with_published(mut self, published: &'a LayerDates) -> Self {
        self.published = Some(published);
        self
    }

    pub fn store(&self) -> &'a S {
        self.store
    }

    pub fn table(&self) -> &'a VariableTable {
        self.table
    }

    pub fn is_published(&self, variable: Variable, day: NaiveDate) -> bool {
        self.published
            .and_then(|layers| layers.get(variable.dir_name()))
            .is_some_and(|dates| dates.contains(&day))
    }

    /// True when every day of `range` has its `stage` artifact or is already
    /// published. Stops at the first missing file. A stage that does not apply
    /// to the variable is never complete.
    pub fn is_complete(&self, variable: Variable, range: &DateRange, stage: Stage) -> bool {
        if !self.table.get(variable).has_stage(stage) {
            return false;
        }
        for day in range.days() {
            let key = ArtifactKey::new(variable, stage, day);
            if !self.store.exists(&key) && !self.is_published(variable, day) {
                let name = self
                    .store
                    .path(&key)
                    .map(|path| path.file_name().unwrap_or(path.as_str()).to_string())
                    .unwrap_or_default();
                info!(%variable, %stage, "missing file: {name}");
                return false;
            }
        }
        debug!(%variable, %stage, days = range.day_count(), "stage complete");
        true
    }

    pub fn has(&self, variable: Variable, stage: Stage, day: NaiveDate) -> bool {
        self.store.exists(&ArtifactKey::new(variable, stage, day))
    }

    pub fn state(&self, variable: Variable, day: NaiveDate) -> ArtifactState {
        if self.has(variable, Stage::Clipped, day) {
            ArtifactState::Clipped
        } else if self.is_published(variable, day) {
            ArtifactState::Reconciled
        } else if self.has(variable, Stage::Normalized, day) {
            ArtifactState::Normalized
        } else if self.has(variable, Stage::Raw, day) {
            ArtifactState::Fetched
        } else {
            ArtifactState::Pending
        }
    }

    /// True when `day` already has `stage` or any later stage.
    pub fn reached(&self, variable: Variable, stage: Stage, day: NaiveDate) -> bool {
        let needed = match stage {
            Stage::Raw => ArtifactState::Fetched,
            Stage::Normalized => ArtifactState::Normalized,
            Stage::Clipped => ArtifactState::Clipped,
        };
        self.state(variable, day) >= needed
    }
}
