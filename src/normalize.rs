//! Conversion of per-day source grids into normalized GeoTIFFs.
//!
//! The unit transform from the variable table is applied to every valid
//! sample and the result is labelled WGS84. That label is an assignment, not
//! a reprojection: the archives read here are defined on that datum.

use std::path::Path;

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::calendar::DateRange;
use crate::catalog::LayerDates;
use crate::completion::CompletionIndex;
use crate::crs::Crs;
use crate::domain::{Stage, Variable, VariableSpec, VariableTable};
use crate::error::PipelineError;
use crate::raster::{GeoTransform, MISSING_VALUE, Raster, RasterArtifact};
use crate::report::{RunReport, SkipKind};
use crate::store::{ArtifactKey, ArtifactStore};

/// One 2-D slice of a source dataset, rows ordered north to south.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceGrid {
    pub width: usize,
    pub height: usize,
    pub transform: GeoTransform,
    pub values: Vec<f32>,
    pub fill_value: Option<f32>,
}

impl SourceGrid {
    /// Builds a grid from cell-center coordinate axes and row-major values
    /// laid out as `values[lat_index * lon.len() + lon_index]`.
    ///
    /// Latitudes may run either way; south-to-north grids are flipped.
    pub fn from_axes(
        lon: &[f64],
        lat: &[f64],
        mut values: Vec<f32>,
        fill_value: Option<f32>,
    ) -> Result<Self, String> {
        let (width, height) = (lon.len(), lat.len());
        if width < 2 || height < 2 {
            return Err(format!("grid of {width}x{height} is too small to georeference"));
        }
        if values.len() != width * height {
            return Err(format!(
                "{} values do not fill a {width}x{height} grid",
                values.len()
            ));
        }
        let pixel_width = (lon[width - 1] - lon[0]) / (width - 1) as f64;
        let lat_step = (lat[height - 1] - lat[0]) / (height - 1) as f64;
        if pixel_width <= 0.0 || lat_step == 0.0 {
            return Err("coordinate axes are not monotonic".to_string());
        }
        if lat_step > 0.0 {
            let flipped: Vec<f32> = values
                .chunks_exact(width)
                .rev()
                .flatten()
                .copied()
                .collect();
            values = flipped;
        }
        let pixel_height = lat_step.abs();
        let north = lat[0].max(lat[height - 1]);
        let transform = GeoTransform::new(
            lon[0] - pixel_width / 2.0,
            north + pixel_height / 2.0,
            pixel_width,
            pixel_height,
        );
        Ok(Self {
            width,
            height,
            transform,
            values,
            fill_value,
        })
    }
}

/// Reads the daily slice out of a raw source file.
pub trait GridReader: Send + Sync {
    fn read_grid(&self, path: &Path) -> Result<SourceGrid, PipelineError>;

    /// Whether NetCDF sources (the AgERA5 bundles) can be read at all.
    fn supports_netcdf(&self) -> bool {
        true
    }
}

/// Applies the variable's unit transform and assigns WGS84.
///
/// Fill values and non-finite samples become the missing-value marker.
pub fn normalize(grid: &SourceGrid, spec: &VariableSpec) -> Result<Raster, PipelineError> {
    let data = grid
        .values
        .iter()
        .map(|&value| {
            let is_fill = grid.fill_value.is_some_and(|fill| value == fill);
            if is_fill || !value.is_finite() {
                MISSING_VALUE
            } else {
                spec.unit_transform.apply(value)
            }
        })
        .collect();
    let width = u32::try_from(grid.width)
        .map_err(|_| PipelineError::Config(format!("grid width {} too large", grid.width)))?;
    let height = u32::try_from(grid.height)
        .map_err(|_| PipelineError::Config(format!("grid height {} too large", grid.height)))?;
    Ok(Raster::new(width, height, grid.transform, data)?
        .with_nodata(Some(MISSING_VALUE))
        .with_crs(Some(Crs::Wgs84)))
}

pub struct RasterNormalizer<'a, S: ArtifactStore + ?Sized, R: GridReader + ?Sized> {
    store: &'a S,
    reader: &'a R,
    table: &'a VariableTable,
    published: Option<&'a LayerDates>,
    keep_intermediates: bool,
}

impl<'a, S: ArtifactStore + ?Sized, R: GridReader + ?Sized> RasterNormalizer<'a, S, R> {
    pub fn new(store: &'a S, reader: &'a R, table: &'a VariableTable) -> Self {
        Self {
            store,
            reader,
            table,
            published: None,
            keep_intermediates: false,
        }
    }

    /// Days the catalog already publishes are left alone.
    pub fn with_published(mut self, published: &'a LayerDates) -> Self {
        self.published = Some(published);
        self
    }

    pub fn keep_intermediates(mut self, keep: bool) -> Self {
        self.keep_intermediates = keep;
        self
    }

    /// Normalizes every day of `range` not yet normalized (or clipped).
    /// Returns the number of files written; skips land in `report`.
    pub fn run(&self, variable: Variable, range: &DateRange, report: &mut RunReport) -> usize {
        let spec = self.table.get(variable);
        if !spec.has_stage(Stage::Normalized) {
            return 0;
        }
        let mut index = CompletionIndex::new(self.store, self.table);
        if let Some(published) = self.published {
            index = index.with_published(published);
        }
        let mut produced = 0;
        for day in range.days() {
            if index.reached(variable, Stage::Normalized, day) {
                continue;
            }
            match self.normalize_day(spec, day) {
                Ok(_) => produced += 1,
                Err(PipelineError::MissingInput(path)) => {
                    warn!(%variable, %day, "source file not found: {}", path.display());
                    report.skip(
                        format!("{variable} {day}"),
                        SkipKind::MissingInput,
                        format!("source file not found: {}", path.display()),
                    );
                }
                Err(err) => {
                    warn!(%variable, %day, "normalization failed: {err}");
                    report.record_error(format!("{variable} {day}"), &err);
                }
            }
        }
        info!(%variable, produced, "normalization finished");
        produced
    }

    fn normalize_day(
        &self,
        spec: &VariableSpec,
        day: NaiveDate,
    ) -> Result<RasterArtifact, PipelineError> {
        let raw = ArtifactKey::new(spec.variable, Stage::Raw, day);
        let raw_path = self
            .store
            .path(&raw)
            .ok_or_else(|| PipelineError::Config(format!("{} has no raw stage", spec.variable)))?;
        if !self.store.exists(&raw) {
            return Err(PipelineError::MissingInput(raw_path.into_std_path_buf()));
        }

        let grid = self.reader.read_grid(raw_path.as_std_path())?;
        let raster = normalize(&grid, spec)?;
        let target = ArtifactKey::new(spec.variable, Stage::Normalized, day);
        let written = self.store.put(&target, &raster.encode()?)?;
        let artifact = RasterArtifact::new(&target, written.into_std_path_buf(), &raster);
        debug!(?artifact, "normalized raster written");

        if !self.keep_intermediates {
            self.store.remove(&raw)?;
        }
        Ok(artifact)
    }
}

/// Stand-in used when the crate is built without NetCDF support.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedGridReader;

impl GridReader for UnsupportedGridReader {
    fn read_grid(&self, path: &Path) -> Result<SourceGrid, PipelineError> {
        Err(PipelineError::Config(format!(
            "cannot read {}: built without the `netcdf` feature",
            path.display()
        )))
    }

    fn supports_netcdf(&self) -> bool {
        false
    }
}

#[cfg(feature = "netcdf")]
pub use netcdf_reader::NetcdfGridReader;

#[cfg(feature = "netcdf")]
mod netcdf_reader {
    use std::path::Path;

    use super::{GridReader, SourceGrid};
    use crate::error::PipelineError;

    const LON_NAMES: [&str; 3] = ["lon", "longitude", "x"];
    const LAT_NAMES: [&str; 3] = ["lat", "latitude", "y"];

    /// Reads the first data variable of a NetCDF file. Only the first time
    /// step is used; daily archives hold one.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct NetcdfGridReader;

    impl GridReader for NetcdfGridReader {
        fn read_grid(&self, path: &Path) -> Result<SourceGrid, PipelineError> {
            let geo_err = |reason: String| PipelineError::geo(path, reason);
            let file = netcdf::open(path).map_err(|err| geo_err(err.to_string()))?;

            let lon = read_axis(&file, &LON_NAMES).ok_or_else(|| geo_err("no longitude axis".into()))?;
            let lat = read_axis(&file, &LAT_NAMES).ok_or_else(|| geo_err("no latitude axis".into()))?;

            let var = file
                .variables()
                .find(|var| {
                    let name = var.name();
                    var.dimensions().len() >= 2
                        && !LON_NAMES.contains(&name.as_str())
                        && !LAT_NAMES.contains(&name.as_str())
                        && name != "time"
                })
                .ok_or_else(|| geo_err("no gridded data variable".into()))?;

            let dims: Vec<String> = var.dimensions().iter().map(|dim| dim.name()).collect();
            let (width, height) = (lon.len(), lat.len());
            let raw: Vec<f32> = var
                .get_values::<f32, _>(..)
                .map_err(|err| geo_err(err.to_string()))?;
            if raw.len() < width * height {
                return Err(geo_err(format!(
                    "{} values for a {width}x{height} grid",
                    raw.len()
                )));
            }

            let scale = numeric_attribute(&var, "scale_factor").unwrap_or(1.0);
            let offset = numeric_attribute(&var, "add_offset").unwrap_or(0.0);
            let fill = numeric_attribute(&var, "_FillValue")
                .or_else(|| numeric_attribute(&var, "missing_value"))
                .map(|value| value as f32);

            let lon_last = dims
                .last()
                .is_some_and(|name| LON_NAMES.contains(&name.as_str()));
            let slice = &raw[..width * height];
            let ordered: Vec<f32> = if lon_last {
                slice.to_vec()
            } else {
                // stored (lon, lat): transpose to (lat, lon)
                (0..height)
                    .flat_map(|row| (0..width).map(move |col| slice[col * height + row]))
                    .collect()
            };
            let unpacked = ordered
                .into_iter()
                .map(|value| {
                    if fill.is_some_and(|fill| value == fill) {
                        value
                    } else {
                        (f64::from(value) * scale + offset) as f32
                    }
                })
                .collect();

            SourceGrid::from_axes(&lon, &lat, unpacked, fill).map_err(geo_err)
        }
    }

    fn read_axis(file: &netcdf::File, names: &[&str]) -> Option<Vec<f64>> {
        names
            .iter()
            .find_map(|name| file.variable(name))
            .and_then(|var| var.get_values::<f64, _>(..).ok())
    }

    fn numeric_attribute(var: &netcdf::Variable, name: &str) -> Option<f64> {
        match var.attribute_value(name)?.ok()? {
            netcdf::AttributeValue::Double(value) => Some(value),
            netcdf::AttributeValue::Float(value) => Some(f64::from(value)),
            netcdf::AttributeValue::Short(value) => Some(f64::from(value)),
            netcdf::AttributeValue::Int(value) => Some(f64::from(value)),
            _ => None,
        }
    }
}
