//! Per-point daily time series extracted from the clipped rasters.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::calendar::{DateRange, ymd};
use crate::crs::Crs;
use crate::domain::{SamplePoint, Stage, Variable};
use crate::error::PipelineError;
use crate::raster::Raster;
use crate::report::{RunReport, SkipKind};
use crate::store::{ArtifactKey, ArtifactStore};

/// One CSV row. Absent values serialize as empty cells.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyRow {
    pub day: u32,
    pub month: u32,
    pub year: i32,
    pub t_max: Option<f32>,
    pub t_min: Option<f32>,
    pub prec: Option<f32>,
    pub sol_rad: Option<f32>,
}

impl DailyRow {
    fn empty(year: i32, month: u32, day: u32) -> Self {
        Self {
            day,
            month,
            year,
            t_max: None,
            t_min: None,
            prec: None,
            sol_rad: None,
        }
    }

    fn slot(&mut self, variable: Variable) -> &mut Option<f32> {
        match variable {
            Variable::TMax => &mut self.t_max,
            Variable::TMin => &mut self.t_min,
            Variable::Prec => &mut self.prec,
            Variable::SRad => &mut self.sol_rad,
        }
    }
}

pub fn read_points(path: &Path) -> Result<Vec<SamplePoint>, PipelineError> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|err| PipelineError::Csv(format!("{}: {err}", path.display())))?;
    reader
        .deserialize()
        .map(|record| record.map_err(|err| PipelineError::Csv(err.to_string())))
        .collect()
}

/// Writes `{dir}/{id}_daily.csv`.
pub fn write_series(dir: &Path, id: &str, rows: &[DailyRow]) -> Result<PathBuf, PipelineError> {
    let path = dir.join(format!("{id}_daily.csv"));
    let mut writer = csv::Writer::from_path(&path)
        .map_err(|err| PipelineError::Csv(format!("{}: {err}", path.display())))?;
    for row in rows {
        writer
            .serialize(row)
            .map_err(|err| PipelineError::Csv(err.to_string()))?;
    }
    writer
        .flush()
        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    Ok(path)
}

pub struct PointSampler<'a, S: ArtifactStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: ArtifactStore + ?Sized> PointSampler<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    pub fn sample(&self, point: &SamplePoint, range: &DateRange, report: &mut RunReport) -> Vec<DailyRow> {
        self.sample_many(std::slice::from_ref(point), range, report)
            .pop()
            .unwrap_or_default()
    }

    /// One row per day of `range` for every point, in point order. Each
    /// raster is read once and sampled for all points.
    pub fn sample_many(
        &self,
        points: &[SamplePoint],
        range: &DateRange,
        report: &mut RunReport,
    ) -> Vec<Vec<DailyRow>> {
        let mut series: Vec<Vec<DailyRow>> = vec![Vec::with_capacity(range.day_count()); points.len()];
        for day in range.days() {
            let (year, month, dom) = ymd(day);
            let mut rows = vec![DailyRow::empty(year, month, dom); points.len()];
            for variable in Variable::ALL {
                let key = ArtifactKey::new(variable, Stage::Clipped, day);
                let Some(path) = self.store.path(&key) else {
                    continue;
                };
                if !self.store.exists(&key) {
                    debug!(%variable, %day, "no clipped raster to sample");
                    report.skip(
                        format!("{variable} {day}"),
                        SkipKind::MissingInput,
                        format!("file not found: {path}"),
                    );
                    continue;
                }
                let raster = match Raster::read(path.as_std_path()) {
                    Ok(raster) => raster,
                    Err(err) => {
                        report.record_error(format!("{variable} {day}"), &err);
                        continue;
                    }
                };
                for (point, row) in points.iter().zip(rows.iter_mut()) {
                    *row.slot(variable) = pixel_value(&raster, point);
                }
            }
            for (rows_of_point, row) in series.iter_mut().zip(rows) {
                rows_of_point.push(row);
            }
        }
        info!(points = points.len(), days = range.day_count(), "sampling finished");
        series
    }
}

/// Value of the pixel nearest to the point, `None` outside the grid or on missing data.
pub fn pixel_value(raster: &Raster, point: &SamplePoint) -> Option<f32> {
    let (x, y) = match raster.crs {
        Some(crs) if crs != Crs::Wgs84 => Crs::Wgs84
            .transform(crs, point.longitude, point.latitude)
            .ok()?,
        _ => (point.longitude, point.latitude),
    };
    let (row, col) = raster.transform.nearest_pixel(x, y);
    let row = usize::try_from(row).ok()?;
    let col = usize::try_from(col).ok()?;
    let value = raster.get(col, row)?;
    let is_nodata = raster.nodata.is_some_and(|nodata| nodata == value);
    (!value.is_nan() && !is_nodata).then_some(value)
}
