use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

use approx::assert_relative_eq;
use camino::Utf8PathBuf;
use chrono::NaiveDate;
use flate2::Compression;
use flate2::write::GzEncoder;
use zip::write::SimpleFileOptions;

use agroclim::calendar::DateRange;
use agroclim::catalog::CatalogClient;
use agroclim::config::{Config, ConfigLoader};
use agroclim::crs::Crs;
use agroclim::domain::{Stage, Variable, VariableTable};
use agroclim::error::PipelineError;
use agroclim::fetch::{BundleRequest, SourceClient};
use agroclim::normalize::{GridReader, SourceGrid, UnsupportedGridReader};
use agroclim::pipeline::{Pipeline, RunOptions};
use agroclim::raster::{GeoTransform, Raster};
use agroclim::report::SkipKind;
use agroclim::store::{ArtifactKey, ArtifactStore, FsStore};

const SQUARE: &str = r#"{
    "type": "Feature",
    "properties": {"name": "test"},
    "geometry": {
        "type": "Polygon",
        "coordinates": [[[1.0, 1.0], [3.0, 1.0], [3.0, 3.0], [1.0, 3.0], [1.0, 1.0]]]
    }
}"#;

/// Serves a constant 4x4 CHIRPS day and zip bundles of one-number source files.
#[derive(Clone, Default)]
struct FakeArchive {
    urls: Arc<AtomicUsize>,
    bundles: Arc<AtomicUsize>,
}

impl SourceClient for FakeArchive {
    fn fetch_url(&self, _url: &str) -> Result<Vec<u8>, PipelineError> {
        self.urls.fetch_add(1, Ordering::SeqCst);
        let tiff = Raster::new(4, 4, GeoTransform::new(0.0, 4.0, 1.0, 1.0), vec![4.5; 16])?
            .with_nodata(Some(-9999.0))
            .with_crs(Some(Crs::Wgs84))
            .encode()?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tiff).unwrap();
        Ok(encoder.finish().unwrap())
    }

    fn retrieve_bundle(
        &self,
        request: &BundleRequest,
        destination: &Path,
    ) -> Result<(), PipelineError> {
        self.bundles.fetch_add(1, Ordering::SeqCst);
        let table = VariableTable::standard();
        let spec = table
            .iter()
            .find(|spec| {
                spec.source_name == request.variable
                    && spec.statistic == request.statistic.as_deref()
            })
            .expect("bundle for a known variable");
        let value = match spec.variable {
            Variable::SRad => "2000000",
            _ => "300",
        };
        let year: i32 = request.year.parse().unwrap();

        let mut writer = zip::ZipWriter::new(fs::File::create(destination).unwrap());
        for month in &request.month {
            for day in &request.day {
                let Some(date) =
                    NaiveDate::from_ymd_opt(year, month.parse().unwrap(), day.parse().unwrap())
                else {
                    continue;
                };
                let name = spec.file_name(Stage::Raw, date).unwrap();
                writer.start_file(name, SimpleFileOptions::default()).unwrap();
                writer.write_all(value.as_bytes()).unwrap();
            }
        }
        writer.finish().unwrap();
        Ok(())
    }
}

/// Reads the single number of a source file onto a 4x4 one-degree grid.
struct NumberGrids;

impl GridReader for NumberGrids {
    fn read_grid(&self, path: &Path) -> Result<SourceGrid, PipelineError> {
        let text = fs::read_to_string(path).map_err(|err| PipelineError::geo(path, err.to_string()))?;
        let value: f32 = text
            .trim()
            .parse()
            .map_err(|_| PipelineError::geo(path, "not a number"))?;
        SourceGrid::from_axes(
            &[0.5, 1.5, 2.5, 3.5],
            &[3.5, 2.5, 1.5, 0.5],
            vec![value; 16],
            None,
        )
        .map_err(|reason| PipelineError::geo(path, reason))
    }
}

struct PublishedFirstOfMay;

impl CatalogClient for PublishedFirstOfMay {
    fn published_dates(
        &self,
        _workspace: &str,
        layer: &str,
    ) -> Result<BTreeSet<NaiveDate>, PipelineError> {
        Ok(match layer {
            "PREC" => BTreeSet::from([NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()]),
            _ => BTreeSet::new(),
        })
    }
}

struct Harness<G: GridReader = NumberGrids> {
    _temp: tempfile::TempDir,
    root: PathBuf,
    archive: FakeArchive,
    pipeline: Pipeline<FakeArchive, G, PublishedFirstOfMay>,
}

fn harness() -> Harness {
    harness_with(NumberGrids)
}

fn harness_with<G: GridReader>(grids: G) -> Harness<G> {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path().to_path_buf();
    let boundaries = root.join("boundaries");
    fs::create_dir_all(&boundaries).unwrap();
    fs::write(boundaries.join("XX.geojson"), SQUARE).unwrap();

    let config = ConfigLoader::resolve_with_env(
        Config {
            boundaries_dir: Some(boundaries),
            concurrency: Some(3),
            ..Config::default()
        },
        |_| None,
    )
    .unwrap();
    let utf8_root = Utf8PathBuf::from_path_buf(root.clone()).unwrap();
    let store = FsStore::new_with_paths(
        utf8_root.join("staging"),
        utf8_root.join("outputs"),
        VariableTable::standard(),
    );
    let archive = FakeArchive::default();
    let pipeline = Pipeline::new(store, config, archive.clone(), grids)
        .with_catalog(PublishedFirstOfMay);
    Harness {
        _temp: temp,
        root,
        archive,
        pipeline,
    }
}

fn may() -> DateRange {
    DateRange::parse("2024-05", "2024-05").unwrap()
}

fn files_under(dir: &Path) -> BTreeMap<PathBuf, SystemTime> {
    let mut files = BTreeMap::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return files;
    };
    for entry in entries {
        let path = entry.unwrap().path();
        if path.is_dir() {
            files.extend(files_under(&path));
        } else {
            let modified = fs::metadata(&path).unwrap().modified().unwrap();
            files.insert(path, modified);
        }
    }
    files
}

#[test]
fn first_run_produces_every_output_and_second_is_a_noop() {
    let h = harness();
    let points = h.root.join("points.csv");
    fs::write(&points, "id,lat,long\nfield,2.8,1.2\n").unwrap();

    let mut options = RunOptions::new(may(), "XX");
    options.points = Some(points);
    let report = h.pipeline.run(&options).unwrap();

    assert!(report.skipped.is_empty(), "{:?}", report.skipped);
    assert_eq!(report.fetched, 31 + 3);
    assert_eq!(h.archive.urls.load(Ordering::SeqCst), 31);
    assert_eq!(h.archive.bundles.load(Ordering::SeqCst), 3);

    let store = h.pipeline.store();
    for variable in Variable::ALL {
        for day in may().days() {
            assert!(store.exists(&ArtifactKey::new(variable, Stage::Clipped, day)));
        }
    }
    assert!(files_under(&h.root.join("staging")).is_empty());

    let first = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
    let tmax = store
        .path(&ArtifactKey::new(Variable::TMax, Stage::Clipped, first))
        .unwrap();
    let tmax = Raster::read(tmax.as_std_path()).unwrap();
    assert_eq!((tmax.width, tmax.height), (2, 2));
    assert_relative_eq!(tmax.data[0], 26.85, epsilon = 1e-4);

    assert_eq!(report.samples_written.len(), 1);
    let series = fs::read_to_string(h.root.join("outputs").join("field_daily.csv")).unwrap();
    let first_row: Vec<f32> = series
        .lines()
        .nth(1)
        .unwrap()
        .split(',')
        .map(|cell| cell.parse().unwrap())
        .collect();
    assert_eq!(first_row[..3], [1.0f32, 5.0, 2024.0]);
    assert_relative_eq!(first_row[3], 26.85, epsilon = 1e-4);
    assert_relative_eq!(first_row[4], 26.85, epsilon = 1e-4);
    assert_relative_eq!(first_row[5], 4.5);
    assert_relative_eq!(first_row[6], 2.0);
    assert_eq!(series.lines().count(), 32);

    let before = files_under(&h.root.join("outputs"));
    let again = h.pipeline.run(&RunOptions::new(may(), "XX")).unwrap();
    assert_eq!(again.fetched, 0);
    assert!(again.all_complete());
    assert!(again.skipped.is_empty());
    assert_eq!(h.archive.urls.load(Ordering::SeqCst), 31);
    assert_eq!(h.archive.bundles.load(Ordering::SeqCst), 3);
    assert_eq!(files_under(&h.root.join("outputs")), before);
}

#[test]
fn reconciliation_removes_published_days_only() {
    let h = harness();
    let mut options = RunOptions::new(may(), "XX");
    options.variables = vec![Variable::Prec, Variable::SRad];
    h.pipeline.run(&options).unwrap();

    options.workspace = Some("agro".to_string());
    let report = h.pipeline.run(&options).unwrap();
    assert_eq!(report.deleted.len(), 1);
    assert!(report.deleted[0].ends_with("PREC_20240501.tif"));

    let prec = h.root.join("outputs").join("PREC");
    assert!(!prec.join("PREC_20240501.tif").exists());
    assert!(prec.join("PREC_20240502.tif").exists());
    assert!(h.root.join("outputs").join("SRAD").join("SRAD_20240501.tif").exists());

    let again = h.pipeline.run(&options).unwrap();
    assert_eq!(again.fetched, 0);
    assert!(again.deleted.is_empty());
    assert!(again.all_complete());
    assert!(!prec.join("PREC_20240501.tif").exists());
    assert_eq!(h.archive.urls.load(Ordering::SeqCst), 31);
}

#[test]
fn published_days_are_never_fetched() {
    let h = harness();
    let mut options = RunOptions::new(may(), "XX");
    options.variables = vec![Variable::Prec];
    options.workspace = Some("agro".to_string());

    let report = h.pipeline.run(&options).unwrap();
    assert_eq!(report.fetched, 30);
    assert!(report.skipped.is_empty(), "{:?}", report.skipped);
    assert!(report.deleted.is_empty());
    let prec = h.root.join("outputs").join("PREC");
    assert!(!prec.join("PREC_20240501.tif").exists());
    assert!(prec.join("PREC_20240531.tif").exists());

    let again = h.pipeline.run(&options).unwrap();
    assert_eq!(again.fetched, 0);
    assert!(again.all_complete());
    assert_eq!(h.archive.urls.load(Ordering::SeqCst), 30);
}

#[test]
fn bundle_variables_are_skipped_without_netcdf_support() {
    let h = harness_with(UnsupportedGridReader);
    let report = h.pipeline.run(&RunOptions::new(may(), "XX")).unwrap();

    assert_eq!(h.archive.bundles.load(Ordering::SeqCst), 0);
    assert_eq!(report.fetched, 31);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].kind, SkipKind::Failed);
    assert_eq!(report.skipped[0].context, "TMAX,TMIN,SRAD");
    assert!(!h.root.join("staging").join("ERA5").exists());

    let store = h.pipeline.store();
    for day in may().days() {
        assert!(store.exists(&ArtifactKey::new(Variable::Prec, Stage::Clipped, day)));
    }
}

#[test]
fn only_requested_variables_are_processed() {
    let h = harness();
    let mut options = RunOptions::new(may(), "XX");
    options.variables = vec![Variable::Prec];
    let report = h.pipeline.run(&options).unwrap();

    assert_eq!(report.fetched, 31);
    assert_eq!(h.archive.bundles.load(Ordering::SeqCst), 0);
    assert!(!h.root.join("outputs").join("TMAX").exists());
}

#[test]
fn missing_boundary_skips_clipping_but_keeps_inputs() {
    let h = harness();
    let mut options = RunOptions::new(may(), "ZZ");
    options.variables = vec![Variable::TMin];
    let report = h.pipeline.run(&options).unwrap();

    assert_eq!(report.fetched, 1);
    assert_eq!(report.skipped.len(), 1);
    let store = h.pipeline.store();
    for day in may().days() {
        assert!(store.exists(&ArtifactKey::new(Variable::TMin, Stage::Normalized, day)));
        assert!(!store.exists(&ArtifactKey::new(Variable::TMin, Stage::Clipped, day)));
    }
}
