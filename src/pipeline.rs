//! Orchestration of one run: fetch, normalize, clip, sample, reconcile.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::boundary::Boundary;
use crate::calendar::DateRange;
use crate::catalog::{CatalogClient, CatalogReconciler, LayerDates, local_layers, reconcile};
use crate::clip::SpatialClipper;
use crate::completion::CompletionIndex;
use crate::config::ResolvedConfig;
use crate::domain::{Archive, Stage, Variable, VariableTable};
use crate::error::PipelineError;
use crate::fetch::{BundleRequest, FetchOutcome, FetchRequest, Fetcher, SourceClient};
use crate::normalize::{GridReader, RasterNormalizer};
use crate::report::{RunReport, SkipKind};
use crate::sample::{PointSampler, read_points, write_series};
use crate::store::{ArtifactKey, FsStore};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub range: DateRange,
    pub country: String,
    pub workspace: Option<String>,
    pub points: Option<PathBuf>,
    pub variables: Vec<Variable>,
}

impl RunOptions {
    pub fn new(range: DateRange, country: impl Into<String>) -> Self {
        Self {
            range,
            country: country.into(),
            workspace: None,
            points: None,
            variables: Variable::ALL.to_vec(),
        }
    }
}

pub fn stage_label(stage: Stage) -> &'static str {
    match stage {
        Stage::Raw => "fetch",
        Stage::Normalized => "normalize",
        Stage::Clipped => "clip",
    }
}

pub struct Pipeline<C: SourceClient, G: GridReader, K: CatalogClient> {
    store: FsStore,
    config: ResolvedConfig,
    source: C,
    grids: G,
    catalog: Option<K>,
}

impl<C: SourceClient, G: GridReader, K: CatalogClient> Pipeline<C, G, K> {
    pub fn new(store: FsStore, config: ResolvedConfig, source: C, grids: G) -> Self {
        Self {
            store,
            config,
            source,
            grids,
            catalog: None,
        }
    }

    pub fn with_catalog(mut self, catalog: K) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn store(&self) -> &FsStore {
        &self.store
    }

    fn table(&self) -> &VariableTable {
        self.store.table()
    }

    /// Runs every stage. Only setup failures are returned as errors; per-file
    /// problems are collected in the report.
    pub fn run(&self, options: &RunOptions) -> Result<RunReport, PipelineError> {
        let mut report = RunReport::new();
        let range = &options.range;
        let published = match &options.workspace {
            Some(workspace) => self.published_dates(workspace, &options.variables, &mut report),
            None => LayerDates::new(),
        };
        let index = CompletionIndex::new(&self.store, self.table()).with_published(&published);

        let mut pending = Vec::new();
        for &variable in &options.variables {
            let spec = self.table().get(variable);
            if index.is_complete(variable, range, Stage::Clipped) {
                info!(%variable, "output already complete");
                for stage in spec.stages() {
                    report.stage(stage_label(*stage), variable.dir_name(), true, 0);
                }
                continue;
            }
            pending.push(variable);
        }

        if !self.grids.supports_netcdf() {
            self.drop_bundle_variables(&mut pending, &mut report);
        }
        pending.retain(|variable| match self.store.ensure_dirs(*variable) {
            Ok(()) => true,
            Err(err) => {
                report.record_error(variable.to_string(), &err);
                false
            }
        });

        if !pending.is_empty() {
            self.fetch(&index, &pending, range, &mut report)?;
            self.normalize(&published, &pending, range, &mut report);
            self.clip(&index, &pending, options, &mut report);
        }

        if let Some(points) = &options.points {
            self.sample(points, range, &mut report);
        }

        if options.workspace.is_some() && self.catalog.is_some() {
            self.reconcile(&published, &mut report);
        }

        info!(
            fetched = report.fetched,
            skipped = report.skipped.len(),
            deleted = report.deleted.len(),
            "run finished"
        );
        Ok(report)
    }

    /// AgERA5 bundles hold NetCDF; without a reader for them the download
    /// would be wasted, so those variables are dropped with one report entry.
    fn drop_bundle_variables(&self, pending: &mut Vec<Variable>, report: &mut RunReport) {
        let dropped: Vec<&str> = pending
            .iter()
            .filter(|variable| self.table().get(**variable).archive == Archive::AgEra5)
            .map(|variable| variable.dir_name())
            .collect();
        if dropped.is_empty() {
            return;
        }
        warn!(variables = ?dropped, "no NetCDF reader available; skipping bundle variables");
        report.skip(
            dropped.join(","),
            SkipKind::Failed,
            "built without the `netcdf` feature; bundle variables cannot be normalized",
        );
        pending.retain(|variable| self.table().get(*variable).archive != Archive::AgEra5);
    }

    /// Fetch work still needed for `variable`: one compressed file per
    /// missing CHIRPS day, one bundle per AgERA5 year with a missing day.
    /// Days the index counts as published are not missing.
    fn fetch_requests(
        &self,
        index: &CompletionIndex<'_, FsStore>,
        variable: Variable,
        range: &DateRange,
    ) -> Vec<FetchRequest> {
        let spec = self.table().get(variable);
        match spec.archive {
            Archive::Chirps => range
                .days()
                .filter(|day| !index.reached(variable, Stage::Raw, *day))
                .map(|day| FetchRequest::Compressed {
                    url: self.config.chirps_url(day),
                    key: ArtifactKey::new(variable, Stage::Raw, day),
                })
                .collect(),
            Archive::AgEra5 => range
                .split_by_year()
                .into_iter()
                .filter(|year_range| {
                    !year_range
                        .days()
                        .all(|day| index.reached(variable, Stage::Raw, day))
                })
                .map(|year_range| {
                    let year = year_range.start().year();
                    FetchRequest::Bundle {
                        request: BundleRequest::new(
                            spec,
                            year,
                            &range.months_in_year(year),
                            &self.config.bundle_dataset,
                            &self.config.bundle_version,
                        ),
                        variable,
                        range: year_range,
                        archive_path: self.store.bundle_path(variable, year),
                        target_dir: self.store.stage_dir(variable, Stage::Raw),
                    }
                })
                .collect(),
        }
    }

    fn fetch(
        &self,
        index: &CompletionIndex<'_, FsStore>,
        variables: &[Variable],
        range: &DateRange,
        report: &mut RunReport,
    ) -> Result<(), PipelineError> {
        let fetcher = Fetcher::new(&self.store, &self.source, self.config.concurrency)?;
        let mut requested = Vec::new();
        let mut requests = Vec::new();
        for &variable in variables {
            let needed = self.fetch_requests(index, variable, range);
            requested.push((variable, needed.len()));
            requests.extend(needed);
        }

        let mut fetched_per_variable = vec![0usize; variables.len()];
        for (request, result) in fetcher.fetch_all(requests) {
            let variable = match &request {
                FetchRequest::Compressed { key, .. } => key.variable,
                FetchRequest::Bundle { variable, .. } => *variable,
            };
            match result {
                Ok(FetchOutcome::Fetched { .. }) => {
                    report.fetched += 1;
                    if let Some(slot) = variables.iter().position(|v| *v == variable) {
                        fetched_per_variable[slot] += 1;
                    }
                }
                Ok(FetchOutcome::Present) => {}
                Err(err) => {
                    warn!(%variable, "fetch failed: {err}");
                    report.record_error(request.locator(), &err);
                }
            }
        }

        for ((variable, needed), fetched) in requested.into_iter().zip(fetched_per_variable) {
            report.stage(stage_label(Stage::Raw), variable.dir_name(), needed == 0, fetched);
        }
        Ok(())
    }

    fn normalize(
        &self,
        published: &LayerDates,
        variables: &[Variable],
        range: &DateRange,
        report: &mut RunReport,
    ) {
        let index = CompletionIndex::new(&self.store, self.table()).with_published(published);
        let normalizer = RasterNormalizer::new(&self.store, &self.grids, self.table())
            .with_published(published)
            .keep_intermediates(self.config.keep_intermediates);
        for &variable in variables {
            if !self.table().get(variable).has_stage(Stage::Normalized) {
                continue;
            }
            let done = range
                .days()
                .all(|day| index.reached(variable, Stage::Normalized, day));
            let produced = if done {
                0
            } else {
                normalizer.run(variable, range, report)
            };
            report.stage(stage_label(Stage::Normalized), variable.dir_name(), done, produced);
        }
    }

    fn clip(
        &self,
        index: &CompletionIndex<'_, FsStore>,
        variables: &[Variable],
        options: &RunOptions,
        report: &mut RunReport,
    ) {
        let boundary = Boundary::locate(&self.config.boundaries_dir, &options.country)
            .and_then(|path| Boundary::load(&path));
        let mut clipper = match boundary {
            Ok(boundary) => {
                SpatialClipper::new(boundary).keep_intermediates(self.config.keep_intermediates)
            }
            Err(err) => {
                warn!(country = %options.country, "clipping skipped: {err}");
                report.record_error(format!("boundary {}", options.country), &err);
                return;
            }
        };
        for &variable in variables {
            let produced = clipper.run(index, variable, &options.range, report);
            report.stage(stage_label(Stage::Clipped), variable.dir_name(), false, produced);
        }
    }

    fn sample(&self, points: &Path, range: &DateRange, report: &mut RunReport) {
        let points = match read_points(points) {
            Ok(points) => points,
            Err(err) => {
                warn!("point table unreadable: {err}");
                report.record_error(points.display().to_string(), &err);
                return;
            }
        };
        let sampler = PointSampler::new(&self.store);
        let series = sampler.sample_many(&points, range, report);
        for (point, rows) in points.iter().zip(series) {
            match write_series(self.store.output_root().as_std_path(), &point.id, &rows) {
                Ok(path) => report.samples_written.push(path.display().to_string()),
                Err(err) => report.record_error(format!("point {}", point.id), &err),
            }
        }
    }

    /// Dates already published for every requested layer and every layer
    /// present locally. Asked once, before the completion gate.
    fn published_dates(
        &self,
        workspace: &str,
        variables: &[Variable],
        report: &mut RunReport,
    ) -> LayerDates {
        let Some(catalog) = &self.catalog else {
            warn!("no catalog configured; nothing reconciled");
            report.skip(
                "catalog",
                SkipKind::CatalogUnavailable,
                "no catalog url configured",
            );
            return LayerDates::new();
        };
        let mut layers: BTreeSet<String> = variables
            .iter()
            .map(|variable| variable.dir_name().to_string())
            .collect();
        match local_layers(self.store.output_root().as_std_path()) {
            Ok(local) => layers.extend(local),
            Err(err) => report.record_error("catalog", &err),
        }
        let layers: Vec<String> = layers.into_iter().collect();
        CatalogReconciler::new(catalog).layer_dates(workspace, &layers, report)
    }

    fn reconcile(&self, published: &LayerDates, report: &mut RunReport) {
        let output_root = self.store.output_root().as_std_path();
        match reconcile(published, output_root, report) {
            Ok(deleted) => info!(deleted, "reconciliation finished"),
            Err(err) => {
                warn!("reconciliation stopped: {err}");
                report.record_error("catalog", &err);
            }
        }
    }
}
