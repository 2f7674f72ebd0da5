//! Single-band GeoTIFF grids.
//!
//! Georeferencing is read from ModelTiepoint + ModelPixelScale (or a
//! ModelTransformation matrix), the reference system from the GeoKey
//! directory and nodata from the GDAL_NODATA ASCII tag.

use std::fs::File;
use std::io::{Cursor, Read, Seek};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::Serialize;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{TiffEncoder, colortype};
use tiff::tags::Tag;

use crate::crs::Crs;
use crate::domain::{Stage, Variable};
use crate::error::PipelineError;
use crate::store::ArtifactKey;

/// Marker written for pixels without a valid measurement.
pub const MISSING_VALUE: f32 = f32::NAN;

const GT_MODEL_TYPE: u16 = 1024;
const GT_RASTER_TYPE: u16 = 1025;
const GEOGRAPHIC_TYPE: u16 = 2048;
const PROJECTED_CS_TYPE: u16 = 3072;
const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;

/// North-up affine transform. `pixel_height` is positive; rows run southward.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn new(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            origin_x,
            origin_y,
            pixel_width,
            pixel_height,
        }
    }

    pub fn pixel_center(&self, col: usize, row: usize) -> (f64, f64) {
        (
            self.origin_x + (col as f64 + 0.5) * self.pixel_width,
            self.origin_y - (row as f64 + 0.5) * self.pixel_height,
        )
    }

    /// Nearest pixel to a coordinate as `(row, col)`; may fall outside the grid.
    pub fn nearest_pixel(&self, x: f64, y: f64) -> (i64, i64) {
        let row = ((self.origin_y - y) / self.pixel_height).round() as i64;
        let col = ((x - self.origin_x) / self.pixel_width).round() as i64;
        (row, col)
    }

    /// Transform of a window starting at `(col_off, row_off)`.
    pub fn shifted(&self, col_off: usize, row_off: usize) -> Self {
        Self {
            origin_x: self.origin_x + col_off as f64 * self.pixel_width,
            origin_y: self.origin_y - row_off as f64 * self.pixel_height,
            ..*self
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pub width: u32,
    pub height: u32,
    pub transform: GeoTransform,
    /// Row-major, north to south, west to east.
    pub data: Vec<f32>,
    pub nodata: Option<f32>,
    pub crs: Option<Crs>,
}

impl Raster {
    pub fn new(
        width: u32,
        height: u32,
        transform: GeoTransform,
        data: Vec<f32>,
    ) -> Result<Self, PipelineError> {
        if data.len() != width as usize * height as usize {
            return Err(PipelineError::geo(
                PathBuf::new(),
                format!(
                    "grid of {width}x{height} cannot hold {} samples",
                    data.len()
                ),
            ));
        }
        Ok(Self {
            width,
            height,
            transform,
            data,
            nodata: None,
            crs: None,
        })
    }

    pub fn with_nodata(mut self, nodata: Option<f32>) -> Self {
        self.nodata = nodata;
        self
    }

    pub fn with_crs(mut self, crs: Option<Crs>) -> Self {
        self.crs = crs;
        self
    }

    pub fn get(&self, col: usize, row: usize) -> Option<f32> {
        if col >= self.width as usize || row >= self.height as usize {
            return None;
        }
        self.data.get(row * self.width as usize + col).copied()
    }

    /// `(min_x, min_y, max_x, max_y)` of the grid's outer edges.
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        let t = &self.transform;
        (
            t.origin_x,
            t.origin_y - self.height as f64 * t.pixel_height,
            t.origin_x + self.width as f64 * t.pixel_width,
            t.origin_y,
        )
    }

    pub fn read(path: &Path) -> Result<Self, PipelineError> {
        let file = File::open(path).map_err(|err| PipelineError::geo(path, err.to_string()))?;
        Self::decode(file, path)
    }

    fn decode<R: Read + Seek>(reader: R, path: &Path) -> Result<Self, PipelineError> {
        let tiff_err = |err: tiff::TiffError| PipelineError::geo(path, err.to_string());
        let mut limits = Limits::default();
        limits.decoding_buffer_size = 1024 * 1024 * 1024;
        limits.intermediate_buffer_size = 1024 * 1024 * 1024;
        limits.ifd_value_size = 1024 * 1024 * 1024;
        let mut decoder = Decoder::new(reader).map_err(tiff_err)?.with_limits(limits);

        let (width, height) = decoder.dimensions().map_err(tiff_err)?;
        let transform = read_transform(&mut decoder)
            .ok_or_else(|| PipelineError::geo(path, "raster is not georeferenced"))?;
        let crs = read_crs(&mut decoder);
        let nodata = decoder
            .get_tag_ascii_string(Tag::GdalNodata)
            .ok()
            .and_then(|text| parse_nodata(&text));

        let samples = decode_samples(decoder.read_image().map_err(tiff_err)?);
        let pixels = width as usize * height as usize;
        if pixels == 0 || samples.len() < pixels || samples.len() % pixels != 0 {
            return Err(PipelineError::geo(
                path,
                format!("{} samples for a {width}x{height} grid", samples.len()),
            ));
        }
        let bands = samples.len() / pixels;
        let data = if bands == 1 {
            samples
        } else {
            samples.into_iter().step_by(bands).collect()
        };

        Ok(Self {
            width,
            height,
            transform,
            data,
            nodata,
            crs,
        })
    }

    /// Encodes the grid as a 32-bit float GeoTIFF.
    pub fn encode(&self) -> Result<Vec<u8>, PipelineError> {
        let encode_err = |err: tiff::TiffError| PipelineError::Filesystem(err.to_string());
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut encoder = TiffEncoder::new(&mut cursor).map_err(encode_err)?;
            let mut image = encoder
                .new_image::<colortype::Gray32Float>(self.width, self.height)
                .map_err(encode_err)?;
            let t = self.transform;
            let scale = [t.pixel_width, t.pixel_height, 0.0];
            let tiepoint = [0.0, 0.0, 0.0, t.origin_x, t.origin_y, 0.0];
            image
                .encoder()
                .write_tag(Tag::ModelPixelScaleTag, &scale[..])
                .map_err(encode_err)?;
            image
                .encoder()
                .write_tag(Tag::ModelTiepointTag, &tiepoint[..])
                .map_err(encode_err)?;
            if let Some(crs) = self.crs {
                let keys = geo_key_directory(crs);
                image
                    .encoder()
                    .write_tag(Tag::GeoKeyDirectoryTag, &keys[..])
                    .map_err(encode_err)?;
            }
            if let Some(nodata) = self.nodata {
                let text = format_nodata(nodata);
                image
                    .encoder()
                    .write_tag(Tag::GdalNodata, text.as_str())
                    .map_err(encode_err)?;
            }
            image.write_data(&self.data).map_err(encode_err)?;
        }
        Ok(cursor.into_inner())
    }
}

/// A raster file tagged with where it sits in the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RasterArtifact {
    pub variable: Variable,
    pub date: NaiveDate,
    pub stage: Stage,
    pub path: PathBuf,
    pub crs: Option<Crs>,
    pub nodata: Option<f32>,
}

impl RasterArtifact {
    pub fn new(key: &ArtifactKey, path: impl Into<PathBuf>, raster: &Raster) -> Self {
        Self {
            variable: key.variable,
            date: key.date,
            stage: key.stage,
            path: path.into(),
            crs: raster.crs,
            nodata: raster.nodata,
        }
    }
}

fn read_transform<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<GeoTransform> {
    let tiepoint = decoder.get_tag_f64_vec(Tag::ModelTiepointTag).ok();
    let scale = decoder.get_tag_f64_vec(Tag::ModelPixelScaleTag).ok();
    if let (Some(tiepoint), Some(scale)) = (tiepoint, scale) {
        if tiepoint.len() >= 6 && scale.len() >= 2 && scale[0] > 0.0 && scale[1] > 0.0 {
            // tiepoint maps raster (i, j) to model (x, y)
            let origin_x = tiepoint[3] - tiepoint[0] * scale[0];
            let origin_y = tiepoint[4] + tiepoint[1] * scale[1];
            return Some(GeoTransform::new(origin_x, origin_y, scale[0], scale[1]));
        }
    }

    let matrix = decoder.get_tag_f64_vec(Tag::ModelTransformationTag).ok()?;
    if matrix.len() < 16 || matrix[1] != 0.0 || matrix[4] != 0.0 {
        // rotated grids are not supported
        return None;
    }
    let (pixel_width, pixel_height) = (matrix[0], -matrix[5]);
    if pixel_width <= 0.0 || pixel_height <= 0.0 {
        return None;
    }
    Some(GeoTransform::new(
        matrix[3],
        matrix[7],
        pixel_width,
        pixel_height,
    ))
}

fn read_crs<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<Crs> {
    let keys = decoder.get_tag_u16_vec(Tag::GeoKeyDirectoryTag).ok()?;
    let count = *keys.get(3)? as usize;
    let entries: Vec<&[u16]> = keys[4..].chunks_exact(4).take(count).collect();
    let inline = |id: u16| {
        entries
            .iter()
            .find(|entry| entry[0] == id && entry[1] == 0)
            .map(|entry| entry[3])
    };
    // 32767 is "user-defined", which we cannot interpret
    inline(PROJECTED_CS_TYPE)
        .or_else(|| inline(GEOGRAPHIC_TYPE))
        .filter(|code| *code != 32767)
        .map(Crs::from_epsg)
}

fn geo_key_directory(crs: Crs) -> Vec<u16> {
    let (model, key) = if crs.is_geographic() {
        (MODEL_TYPE_GEOGRAPHIC, GEOGRAPHIC_TYPE)
    } else {
        (MODEL_TYPE_PROJECTED, PROJECTED_CS_TYPE)
    };
    vec![
        1, 1, 0, 3, // header: version, revision, minor, key count
        GT_MODEL_TYPE, 0, 1, model,
        GT_RASTER_TYPE, 0, 1, RASTER_PIXEL_IS_AREA,
        key, 0, 1, crs.epsg(),
    ]
}

fn parse_nodata(text: &str) -> Option<f32> {
    text.trim_matches(|ch: char| ch == '\0' || ch.is_whitespace())
        .parse()
        .ok()
}

fn format_nodata(value: f32) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else {
        value.to_string()
    }
}

fn decode_samples(result: DecodingResult) -> Vec<f32> {
    match result {
        DecodingResult::F32(data) => data,
        DecodingResult::F64(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I16(data) => data.into_iter().map(f32::from).collect(),
        DecodingResult::I32(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U16(data) => data.into_iter().map(f32::from).collect(),
        DecodingResult::U32(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U8(data) => data.into_iter().map(f32::from).collect(),
        DecodingResult::I8(data) => data.into_iter().map(f32::from).collect(),
        DecodingResult::U64(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I64(data) => data.into_iter().map(|v| v as f32).collect(),
    }
}
