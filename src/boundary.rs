//! Country boundaries used as clip masks.

use std::fs;
use std::path::{Path, PathBuf};

use geo::{BoundingRect, Contains, Coord, LineString, MapCoordsInPlace, MultiPolygon, Point, Rect};
use geojson::GeoJson;
use shapefile::PolygonRing;
use tracing::info;

use crate::crs::Crs;
use crate::error::PipelineError;

/// Polygons of one country plus the reference system they are expressed in.
///
/// The geometry is reprojected in place at most once per run. A second,
/// different target is refused instead of re-projecting again.
#[derive(Debug, Clone)]
pub struct Boundary {
    polygons: MultiPolygon<f64>,
    crs: Crs,
    reprojected: bool,
}

impl Boundary {
    pub fn new(polygons: MultiPolygon<f64>, crs: Crs) -> Self {
        Self {
            polygons,
            crs,
            reprojected: false,
        }
    }

    /// Finds `{dir}/{country}.geojson` or `{dir}/{country}.shp`, else the
    /// first boundary file inside `{dir}/{country}/`.
    pub fn locate(dir: &Path, country: &str) -> Result<PathBuf, PipelineError> {
        for extension in BOUNDARY_EXTENSIONS {
            let direct = dir.join(format!("{country}.{extension}"));
            if direct.is_file() {
                return Ok(direct);
            }
        }
        let nested = dir.join(country);
        if let Ok(entries) = fs::read_dir(&nested) {
            let mut candidates: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok().map(|entry| entry.path()))
                .filter(|path| {
                    path.extension()
                        .is_some_and(|ext| BOUNDARY_EXTENSIONS.iter().any(|known| ext == *known))
                })
                .collect();
            candidates.sort();
            if let Some(first) = candidates.into_iter().next() {
                return Ok(first);
            }
        }
        Err(PipelineError::Boundary(format!(
            "no boundary for '{country}' under {}",
            dir.display()
        )))
    }

    /// Reads a GeoJSON document or an ESRI shapefile, picked by extension.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let boundary = if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("shp")) {
            Self::from_shapefile(path)?
        } else {
            let text = fs::read_to_string(path).map_err(|err| {
                PipelineError::Boundary(format!("read {}: {err}", path.display()))
            })?;
            Self::from_geojson(&text)?
        };
        info!(
            path = %path.display(),
            crs = %boundary.crs,
            polygons = boundary.polygons.0.len(),
            "boundary loaded"
        );
        Ok(boundary)
    }

    /// Parses a Geometry, Feature or FeatureCollection. Every polygonal
    /// geometry is collected; the legacy `crs` member selects the reference
    /// system and WGS84 is assumed without one.
    pub fn from_geojson(text: &str) -> Result<Self, PipelineError> {
        let invalid = |reason: String| PipelineError::Boundary(reason);
        let raw: serde_json::Value =
            serde_json::from_str(text).map_err(|err| invalid(err.to_string()))?;
        let crs = match declared_crs(&raw) {
            Some(name) => Crs::parse(name)
                .ok_or_else(|| invalid(format!("unrecognised crs '{name}'")))?,
            None => Crs::Wgs84,
        };

        let geojson: GeoJson = text.parse().map_err(|err: geojson::Error| invalid(err.to_string()))?;
        let geometries: Vec<geojson::Geometry> = match geojson {
            GeoJson::Geometry(geometry) => vec![geometry],
            GeoJson::Feature(feature) => feature.geometry.into_iter().collect(),
            GeoJson::FeatureCollection(collection) => collection
                .features
                .into_iter()
                .filter_map(|feature| feature.geometry)
                .collect(),
        };

        let mut polygons = Vec::new();
        for geometry in geometries {
            let converted: geo::Geometry<f64> = geometry
                .try_into()
                .map_err(|err: geojson::Error| invalid(err.to_string()))?;
            collect_polygons(converted, &mut polygons);
        }
        if polygons.is_empty() {
            return Err(invalid("no polygon geometries".to_string()));
        }
        Ok(Self::new(MultiPolygon(polygons), crs))
    }

    /// Reads every polygon record of a `.shp`. The CRS comes from the
    /// sibling `.prj`; WGS84 is assumed when there is none.
    pub fn from_shapefile(path: &Path) -> Result<Self, PipelineError> {
        let invalid = |reason: String| PipelineError::Boundary(format!("{}: {reason}", path.display()));
        let shapes = shapefile::read_shapes_as::<_, shapefile::Polygon>(path)
            .map_err(|err| invalid(err.to_string()))?;

        let prj = path.with_extension("prj");
        let crs = if prj.is_file() {
            let wkt = fs::read_to_string(&prj).map_err(|err| invalid(err.to_string()))?;
            Crs::from_wkt(&wkt).ok_or_else(|| invalid("unrecognised .prj".to_string()))?
        } else {
            Crs::Wgs84
        };

        let mut polygons: Vec<geo::Polygon<f64>> = Vec::new();
        for shape in &shapes {
            for ring in shape.rings() {
                let line: LineString<f64> = ring
                    .points()
                    .iter()
                    .map(|point| Coord { x: point.x, y: point.y })
                    .collect();
                match ring {
                    PolygonRing::Outer(_) => polygons.push(geo::Polygon::new(line, vec![])),
                    PolygonRing::Inner(_) => match polygons.last_mut() {
                        Some(outer) => outer.interiors_push(line),
                        None => return Err(invalid("hole before any outer ring".to_string())),
                    },
                }
            }
        }
        if polygons.is_empty() {
            return Err(invalid("no polygon records".to_string()));
        }
        Ok(Self::new(MultiPolygon(polygons), crs))
    }

    pub fn crs(&self) -> Crs {
        self.crs
    }

    pub fn polygons(&self) -> &MultiPolygon<f64> {
        &self.polygons
    }

    pub fn is_reprojected(&self) -> bool {
        self.reprojected
    }

    pub fn bounds(&self) -> Option<Rect<f64>> {
        self.polygons.bounding_rect()
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.polygons.contains(&Point::new(x, y))
    }

    /// Brings the boundary into `target`. Returns true when this call reprojected.
    pub fn align_to(&mut self, target: Crs) -> Result<bool, String> {
        if self.crs == target {
            return Ok(false);
        }
        if self.reprojected {
            return Err(format!(
                "boundary was already reprojected to {} and cannot follow a raster in {target}",
                self.crs
            ));
        }
        let from = self.crs;
        let transformer = from.transformer(target)?;
        self.polygons
            .try_map_coords_in_place(|coord| {
                transformer
                    .transform(coord.x, coord.y)
                    .map(|(x, y)| Coord { x, y })
            })?;
        info!(from = %from, to = %target, "boundary reprojected");
        self.crs = target;
        self.reprojected = true;
        Ok(true)
    }
}

const BOUNDARY_EXTENSIONS: [&str; 2] = ["geojson", "shp"];

fn declared_crs(raw: &serde_json::Value) -> Option<&str> {
    let crs = raw.get("crs")?;
    crs.pointer("/properties/name")
        .or_else(|| crs.pointer("/properties/code"))
        .and_then(|value| value.as_str())
}

fn collect_polygons(geometry: geo::Geometry<f64>, out: &mut Vec<geo::Polygon<f64>>) {
    match geometry {
        geo::Geometry::Polygon(polygon) => out.push(polygon),
        geo::Geometry::MultiPolygon(multi) => out.extend(multi.0),
        geo::Geometry::GeometryCollection(collection) => {
            for inner in collection.0 {
                collect_polygons(inner, out);
            }
        }
        _ => {}
    }
}
