use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use chrono::NaiveDate;

use agroclim::catalog::{CatalogClient, CatalogReconciler, LayerDates, local_layers, reconcile};
use agroclim::error::PipelineError;
use agroclim::report::{RunReport, SkipKind};

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
}

struct PublishedCatalog;

impl CatalogClient for PublishedCatalog {
    fn published_dates(
        &self,
        _workspace: &str,
        layer: &str,
    ) -> Result<BTreeSet<NaiveDate>, PipelineError> {
        Ok(match layer {
            "PREC" => BTreeSet::from([day(1)]),
            _ => BTreeSet::new(),
        })
    }
}

struct UnreachableCatalog;

impl CatalogClient for UnreachableCatalog {
    fn published_dates(
        &self,
        _workspace: &str,
        _layer: &str,
    ) -> Result<BTreeSet<NaiveDate>, PipelineError> {
        Err(PipelineError::CatalogUnavailable(
            "connection refused".to_string(),
        ))
    }
}

fn outputs(root: &Path) {
    let prec = root.join("PREC");
    fs::create_dir_all(&prec).unwrap();
    fs::write(prec.join("PREC_20240501.tif"), b"tif").unwrap();
    fs::write(prec.join("PREC_20240502.tif"), b"tif").unwrap();
    fs::write(prec.join("notes.txt"), b"hand written").unwrap();
    let tmax = root.join("TMAX");
    fs::create_dir_all(&tmax).unwrap();
    fs::write(tmax.join("TMAX_20240501.tif"), b"tif").unwrap();
}

#[test]
fn deletes_only_published_dates() {
    let temp = tempfile::tempdir().unwrap();
    outputs(temp.path());
    let mut report = RunReport::new();

    let layers = local_layers(temp.path()).unwrap();
    assert_eq!(layers, ["PREC", "TMAX"]);
    let dates = CatalogReconciler::new(&PublishedCatalog).layer_dates("ws", &layers, &mut report);
    let deleted = reconcile(&dates, temp.path(), &mut report).unwrap();

    assert_eq!(deleted, 1);
    let prec = temp.path().join("PREC");
    assert!(!prec.join("PREC_20240501.tif").exists());
    assert!(prec.join("PREC_20240502.tif").exists());
    assert!(prec.join("notes.txt").exists());
    assert!(temp.path().join("TMAX").join("TMAX_20240501.tif").exists());

    assert_eq!(report.deleted.len(), 1);
    assert!(report.deleted[0].ends_with("PREC_20240501.tif"));
    assert_eq!(report.count(SkipKind::NonConformingName), 1);
}

#[test]
fn unavailable_catalog_deletes_nothing() {
    let temp = tempfile::tempdir().unwrap();
    outputs(temp.path());
    let mut report = RunReport::new();

    let layers = local_layers(temp.path()).unwrap();
    let dates =
        CatalogReconciler::new(&UnreachableCatalog).layer_dates("ws", &layers, &mut report);
    assert!(dates.values().all(BTreeSet::is_empty));
    assert_eq!(report.count(SkipKind::CatalogUnavailable), 2);

    assert_eq!(reconcile(&dates, temp.path(), &mut report).unwrap(), 0);
    assert!(temp.path().join("PREC").join("PREC_20240501.tif").exists());
    assert_eq!(report.count(SkipKind::NonConformingName), 1);
}

#[test]
fn stray_names_are_flagged_when_nothing_is_published() {
    let temp = tempfile::tempdir().unwrap();
    let tmin = temp.path().join("TMIN");
    fs::create_dir_all(&tmin).unwrap();
    fs::write(tmin.join("TMIN_20240501.tif"), b"tif").unwrap();
    fs::write(tmin.join("TMIN_2024-05-02.tif"), b"tif").unwrap();

    let mut dates = LayerDates::new();
    dates.insert("TMIN".to_string(), BTreeSet::new());
    let mut report = RunReport::new();
    assert_eq!(reconcile(&dates, temp.path(), &mut report).unwrap(), 0);
    assert_eq!(report.count(SkipKind::NonConformingName), 1);
    assert!(report.skipped[0].context.ends_with("TMIN_2024-05-02.tif"));
    assert!(tmin.join("TMIN_20240501.tif").exists());
}

#[test]
fn layer_without_local_directory_is_ignored() {
    let temp = tempfile::tempdir().unwrap();
    let mut dates = LayerDates::new();
    dates.insert("SRAD".to_string(), BTreeSet::from([day(3)]));
    let mut report = RunReport::new();
    assert_eq!(reconcile(&dates, temp.path(), &mut report).unwrap(), 0);
    assert!(report.skipped.is_empty());
}

#[test]
fn missing_output_root_has_no_layers() {
    let temp = tempfile::tempdir().unwrap();
    assert!(local_layers(&temp.path().join("absent")).unwrap().is_empty());
}
