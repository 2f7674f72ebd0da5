//! Coordinate reference systems known to the pipeline.
//!
//! Any EPSG code with a proj definition can be transformed; the lookup table
//! comes from `crs-definitions` and the math from `proj4rs`.

use std::fmt;

use proj4rs::proj::Proj;
use proj4rs::transform::transform;
use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Crs {
    Wgs84,
    WebMercator,
    Epsg(u16),
}

impl Crs {
    pub fn from_epsg(code: u16) -> Self {
        match code {
            4326 => Crs::Wgs84,
            3857 => Crs::WebMercator,
            other => Crs::Epsg(other),
        }
    }

    pub fn epsg(&self) -> u16 {
        match self {
            Crs::Wgs84 => 4326,
            Crs::WebMercator => 3857,
            Crs::Epsg(code) => *code,
        }
    }

    /// The proj4 definition for this code, if one is known.
    pub fn proj_string(&self) -> Option<&'static str> {
        crs_definitions::from_code(self.epsg()).map(|def| def.proj4)
    }

    /// Longitude/latitude systems, whose coordinates are degrees.
    pub fn is_geographic(&self) -> bool {
        match self {
            Crs::Wgs84 => true,
            Crs::WebMercator => false,
            Crs::Epsg(_) => self
                .proj_string()
                .is_some_and(|proj| proj.contains("+proj=longlat")),
        }
    }

    /// Parses `EPSG:4326`, `urn:ogc:def:crs:EPSG::3857`, OGC CRS84 and the
    /// `+proj=longlat +datum=WGS84` proj string.
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.ends_with("crs84") || (lower.starts_with("+proj=longlat") && lower.contains("wgs84")) {
            return Some(Crs::Wgs84);
        }
        let code = trimmed
            .rsplit(':')
            .next()
            .filter(|_| lower.contains("epsg"))?;
        code.parse().ok().map(Crs::from_epsg)
    }

    /// Reads the CRS out of an ESRI `.prj` (WKT1) document.
    ///
    /// The outermost `AUTHORITY["EPSG", ...]` wins; a bare WGS84 `GEOGCS`
    /// without one is taken as EPSG:4326.
    pub fn from_wkt(wkt: &str) -> Option<Self> {
        let authority = Regex::new(r#"AUTHORITY\[\s*"EPSG"\s*,\s*"?(\d+)"?\s*\]"#).ok()?;
        if let Some(code) = authority
            .captures_iter(wkt)
            .last()
            .and_then(|caps| caps[1].parse().ok())
        {
            return Some(Crs::from_epsg(code));
        }
        let normalized = wkt.trim_start().to_ascii_uppercase().replace(' ', "_");
        if normalized.starts_with("GEOGCS") && normalized.contains("WGS_1984") {
            return Some(Crs::Wgs84);
        }
        if normalized.contains("MERCATOR_AUXILIARY_SPHERE") {
            return Some(Crs::WebMercator);
        }
        None
    }

    /// Builds a reusable transformer from `self` to `target`.
    pub fn transformer(&self, target: Crs) -> Result<Transformer, String> {
        Transformer::new(*self, target)
    }

    /// Transforms one coordinate from `self` to `target`.
    pub fn transform(&self, target: Crs, x: f64, y: f64) -> Result<(f64, f64), String> {
        if *self == target {
            return Ok((x, y));
        }
        self.transformer(target)?.transform(x, y)
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.epsg())
    }
}

/// Source and target projections resolved once, applied per coordinate.
pub struct Transformer {
    source: Proj,
    target: Proj,
    source_is_geographic: bool,
    target_is_geographic: bool,
}

impl Transformer {
    pub fn new(source: Crs, target: Crs) -> Result<Self, String> {
        Ok(Self {
            source: projection(source)?,
            target: projection(target)?,
            source_is_geographic: source.is_geographic(),
            target_is_geographic: target.is_geographic(),
        })
    }

    /// proj4rs works in radians for geographic systems; callers use degrees.
    pub fn transform(&self, x: f64, y: f64) -> Result<(f64, f64), String> {
        let mut point = if self.source_is_geographic {
            (x.to_radians(), y.to_radians(), 0.0)
        } else {
            (x, y, 0.0)
        };
        transform(&self.source, &self.target, &mut point)
            .map_err(|err| format!("transform failed: {err:?}"))?;
        if self.target_is_geographic {
            Ok((point.0.to_degrees(), point.1.to_degrees()))
        } else {
            Ok((point.0, point.1))
        }
    }
}

fn projection(crs: Crs) -> Result<Proj, String> {
    let definition = crs
        .proj_string()
        .ok_or_else(|| format!("no projection definition for {crs}"))?;
    Proj::from_proj_string(definition).map_err(|err| format!("invalid projection {crs}: {err:?}"))
}
