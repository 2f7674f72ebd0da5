//! Masking rasters to a country boundary.

use std::path::Path;

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::boundary::Boundary;
use crate::calendar::DateRange;
use crate::completion::CompletionIndex;
use crate::crs::Crs;
use crate::domain::{Stage, Variable, VariableSpec};
use crate::error::PipelineError;
use crate::raster::{MISSING_VALUE, Raster, RasterArtifact};
use crate::report::{RunReport, SkipKind};
use crate::store::{ArtifactKey, ArtifactStore};

/// Value some sources write for missing data regardless of their declared nodata.
pub const SENTINEL_NODATA: f32 = -9999.0;

/// Output name for a clip input: the source prefix is swapped for the
/// output prefix and the dots of the date are dropped.
///
/// `chirps-v2.0.2024.05.01.tif` with `chirps-v2.0.` / `PREC_` becomes `PREC_20240501.tif`.
pub fn derive_output_name(
    file_name: &str,
    source_prefix: &str,
    output_prefix: &str,
) -> Option<String> {
    let rest = file_name.strip_prefix(source_prefix)?;
    let (stem, extension) = rest.rsplit_once('.')?;
    Some(format!(
        "{output_prefix}{}.{extension}",
        stem.replace('.', "")
    ))
}

/// Clips rasters one at a time against a single boundary.
///
/// Takes `&mut self` because the boundary is reprojected lazily on the
/// first raster whose reference system differs.
pub struct SpatialClipper {
    boundary: Boundary,
    keep_intermediates: bool,
}

impl SpatialClipper {
    pub fn new(boundary: Boundary) -> Self {
        Self {
            boundary,
            keep_intermediates: false,
        }
    }

    pub fn keep_intermediates(mut self, keep: bool) -> Self {
        self.keep_intermediates = keep;
        self
    }

    pub fn boundary(&self) -> &Boundary {
        &self.boundary
    }

    /// Crops `raster` to the boundary's extent. Pixels whose centers fall
    /// outside the polygons, pixels equal to the declared nodata and pixels
    /// equal to -9999 all become the missing-value marker.
    pub fn clip(&mut self, raster: &Raster, path: &Path) -> Result<Raster, PipelineError> {
        let crs = raster.crs.unwrap_or(Crs::Wgs84);
        self.boundary
            .align_to(crs)
            .map_err(|reason| PipelineError::geo(path, reason))?;

        let rect = self
            .boundary
            .bounds()
            .ok_or_else(|| PipelineError::geo(path, "boundary has no extent"))?;
        let t = raster.transform;
        let col_start = ((rect.min().x - t.origin_x) / t.pixel_width).floor();
        let col_end = ((rect.max().x - t.origin_x) / t.pixel_width).ceil();
        let row_start = ((t.origin_y - rect.max().y) / t.pixel_height).floor();
        let row_end = ((t.origin_y - rect.min().y) / t.pixel_height).ceil();

        let clamp = |value: f64, limit: u32| value.clamp(0.0, f64::from(limit)) as usize;
        let (col_start, col_end) = (clamp(col_start, raster.width), clamp(col_end, raster.width));
        let (row_start, row_end) = (clamp(row_start, raster.height), clamp(row_end, raster.height));
        if col_end <= col_start || row_end <= row_start {
            return Err(PipelineError::geo(path, "boundary does not overlap the raster"));
        }

        let mut sentinels = 0usize;
        let mut data = Vec::with_capacity((col_end - col_start) * (row_end - row_start));
        for row in row_start..row_end {
            for col in col_start..col_end {
                let value = raster.get(col, row).unwrap_or(MISSING_VALUE);
                let (x, y) = t.pixel_center(col, row);
                let declared = raster
                    .nodata
                    .is_some_and(|nodata| value == nodata || (nodata.is_nan() && value.is_nan()));
                if value == SENTINEL_NODATA {
                    sentinels += 1;
                }
                if declared || value == SENTINEL_NODATA || !self.boundary.contains(x, y) {
                    data.push(MISSING_VALUE);
                } else {
                    data.push(value);
                }
            }
        }
        if sentinels > 0 {
            debug!(path = %path.display(), sentinels, "rewrote -9999 pixels");
        }

        let width = (col_end - col_start) as u32;
        let height = (row_end - row_start) as u32;
        Ok(
            Raster::new(width, height, t.shifted(col_start, row_start), data)?
                .with_nodata(Some(MISSING_VALUE))
                .with_crs(Some(crs)),
        )
    }

    /// Clips every day of `range` the index does not consider clipped (or
    /// published), one file at a time. Failures are recorded per file and
    /// never stop the loop.
    pub fn run<S: ArtifactStore + ?Sized>(
        &mut self,
        index: &CompletionIndex<'_, S>,
        variable: Variable,
        range: &DateRange,
        report: &mut RunReport,
    ) -> usize {
        let spec = index.table().get(variable);
        let mut produced = 0;
        for day in range.days() {
            if index.reached(variable, Stage::Clipped, day) {
                continue;
            }
            match self.clip_day(index.store(), spec, day) {
                Ok(_) => produced += 1,
                Err(PipelineError::MissingInput(path)) => {
                    warn!(%variable, %day, "clip input not found: {}", path.display());
                    report.skip(
                        format!("{variable} {day}"),
                        SkipKind::MissingInput,
                        format!("clip input not found: {}", path.display()),
                    );
                }
                Err(err) => {
                    warn!(%variable, %day, "clip failed: {err}");
                    report.record_error(format!("{variable} {day}"), &err);
                }
            }
        }
        info!(%variable, produced, "clipping finished");
        produced
    }

    fn clip_day<S: ArtifactStore + ?Sized>(
        &mut self,
        store: &S,
        spec: &VariableSpec,
        day: NaiveDate,
    ) -> Result<RasterArtifact, PipelineError> {
        let input = ArtifactKey::new(spec.variable, spec.clip_input_stage(), day);
        let output = ArtifactKey::new(spec.variable, Stage::Clipped, day);
        let (Some(input_path), Some(output_path)) = (store.path(&input), store.path(&output))
        else {
            return Err(PipelineError::Config(format!(
                "{} has no clip stages",
                spec.variable
            )));
        };
        if !store.exists(&input) {
            return Err(PipelineError::MissingInput(input_path.into_std_path_buf()));
        }

        let input_name = input_path.file_name().unwrap_or_default();
        let derived = derive_output_name(
            input_name,
            &spec.clip_source_prefix(),
            &spec.clip_output_prefix(),
        );
        if derived.as_deref() != output_path.file_name() {
            return Err(PipelineError::Filesystem(format!(
                "{input_name} does not map onto {output_path}"
            )));
        }

        let raster = Raster::read(input_path.as_std_path())?;
        let clipped = self.clip(&raster, input_path.as_std_path())?;
        let written = store.put(&output, &clipped.encode()?)?;
        let artifact = RasterArtifact::new(&output, written.into_std_path_buf(), &clipped);
        debug!(?artifact, "clipped raster written");

        if !self.keep_intermediates {
            store.remove(&input)?;
        }
        Ok(artifact)
    }
}
