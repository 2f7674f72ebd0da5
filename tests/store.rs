use std::collections::BTreeSet;
use std::fs;

use camino::Utf8PathBuf;
use chrono::NaiveDate;

use agroclim::calendar::DateRange;
use agroclim::catalog::LayerDates;
use agroclim::completion::{ArtifactState, CompletionIndex};
use agroclim::domain::{Stage, Variable, VariableTable};
use agroclim::store::{ArtifactKey, ArtifactStore, FsStore};

fn temp_store() -> (tempfile::TempDir, FsStore) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let store = FsStore::new_with_paths(
        root.join("staging"),
        root.join("outputs"),
        VariableTable::standard(),
    );
    (temp, store)
}

fn fill(store: &FsStore, variable: Variable, stage: Stage, range: &DateRange) {
    for day in range.days() {
        store
            .put(&ArtifactKey::new(variable, stage, day), b"II*\0raster")
            .unwrap();
    }
}

#[test]
fn removing_one_file_breaks_completion() {
    let (_temp, store) = temp_store();
    let table = VariableTable::standard();
    let range = DateRange::parse("2024-01", "2024-02").unwrap();
    fill(&store, Variable::Prec, Stage::Clipped, &range);

    let index = CompletionIndex::new(&store, &table);
    assert!(index.is_complete(Variable::Prec, &range, Stage::Clipped));

    let gap = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
    let path = store
        .path(&ArtifactKey::new(Variable::Prec, Stage::Clipped, gap))
        .unwrap();
    assert!(path.ends_with("PREC/PREC_20240229.tif"));
    fs::remove_file(&path).unwrap();

    assert!(!index.is_complete(Variable::Prec, &range, Stage::Clipped));
    assert_eq!(index.state(Variable::Prec, gap), ArtifactState::Pending);
}

#[test]
fn deleted_after_publication_stays_complete() {
    let (_temp, store) = temp_store();
    let table = VariableTable::standard();
    let range = DateRange::parse("2024-03", "2024-03").unwrap();
    fill(&store, Variable::Prec, Stage::Clipped, &range);

    let published_day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
    let key = ArtifactKey::new(Variable::Prec, Stage::Clipped, published_day);
    assert!(store.remove(&key).unwrap());
    let published = LayerDates::from([("PREC".to_string(), BTreeSet::from([published_day]))]);

    let index = CompletionIndex::new(&store, &table).with_published(&published);
    assert!(index.is_complete(Variable::Prec, &range, Stage::Clipped));
    assert_eq!(index.state(Variable::Prec, published_day), ArtifactState::Reconciled);
    assert!(index.reached(Variable::Prec, Stage::Raw, published_day));
}

#[test]
fn variables_are_tracked_independently() {
    let (_temp, store) = temp_store();
    let table = VariableTable::standard();
    let range = DateRange::parse("2024-06", "2024-06").unwrap();
    fill(&store, Variable::TMax, Stage::Clipped, &range);

    let index = CompletionIndex::new(&store, &table);
    assert!(index.is_complete(Variable::TMax, &range, Stage::Clipped));
    assert!(!index.is_complete(Variable::TMin, &range, Stage::Clipped));
}

#[test]
fn size_floor_hides_truncated_files() {
    let (_temp, store) = temp_store();
    let store = store.with_min_bytes(8);
    let day = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
    let key = ArtifactKey::new(Variable::SRad, Stage::Normalized, day);

    store.put(&key, b"II*").unwrap();
    assert!(!store.exists(&key));
    store.put(&key, b"II*\0raster").unwrap();
    assert!(store.exists(&key));
}

#[test]
fn state_follows_lifecycle() {
    let (_temp, store) = temp_store();
    let table = VariableTable::standard();
    let day = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
    let index = CompletionIndex::new(&store, &table);

    assert_eq!(index.state(Variable::Prec, day), ArtifactState::Pending);
    store
        .put(&ArtifactKey::new(Variable::Prec, Stage::Raw, day), b"raw")
        .unwrap();
    assert_eq!(index.state(Variable::Prec, day), ArtifactState::Fetched);
    store
        .put(&ArtifactKey::new(Variable::Prec, Stage::Clipped, day), b"clipped")
        .unwrap();
    store
        .remove(&ArtifactKey::new(Variable::Prec, Stage::Raw, day))
        .unwrap();
    assert_eq!(index.state(Variable::Prec, day), ArtifactState::Clipped);
    assert!(index.reached(Variable::Prec, Stage::Raw, day));
}

#[test]
fn ensure_dirs_creates_stage_directories() {
    let (_temp, store) = temp_store();
    store.ensure_dirs(Variable::TMin).unwrap();
    for stage in [Stage::Raw, Stage::Normalized, Stage::Clipped] {
        assert!(store.stage_dir(Variable::TMin, stage).is_dir());
    }
    assert!(
        store
            .bundle_path(Variable::TMin, 2024)
            .ends_with("ERA5/TMIN/2024_t_min.zip")
    );
}
