use std::fs;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDate;
use directories::BaseDirs;

use crate::domain::{Archive, Stage, Variable, VariableTable};
use crate::error::PipelineError;
use crate::fs_util::write_atomic;

/// Identifies one artifact: a variable's file for one day at one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub variable: Variable,
    pub stage: Stage,
    pub date: NaiveDate,
}

impl ArtifactKey {
    pub fn new(variable: Variable, stage: Stage, date: NaiveDate) -> Self {
        Self {
            variable,
            stage,
            date,
        }
    }
}

/// The single authority on where artifacts live and whether they are present.
/// Both the per-file fetch check and the range-wide completion check go through it.
pub trait ArtifactStore: Send + Sync {
    /// Location of the artifact, `None` when the stage does not apply to the variable.
    fn path(&self, key: &ArtifactKey) -> Option<Utf8PathBuf>;
    fn exists(&self, key: &ArtifactKey) -> bool;
    fn put(&self, key: &ArtifactKey, content: &[u8]) -> Result<Utf8PathBuf, PipelineError>;
    fn remove(&self, key: &ArtifactKey) -> Result<bool, PipelineError>;
}

#[derive(Debug, Clone)]
pub struct FsStore {
    staging_root: Utf8PathBuf,
    output_root: Utf8PathBuf,
    table: VariableTable,
    min_bytes: u64,
}

impl FsStore {
    /// Store with the staging area under the user cache directory.
    pub fn new(output_root: Utf8PathBuf, table: VariableTable) -> Result<Self, PipelineError> {
        let staging_root = BaseDirs::new()
            .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.cache_dir().join("agroclim")).ok())
            .ok_or_else(|| {
                PipelineError::Filesystem("unable to resolve cache directory".to_string())
            })?;
        Ok(Self::new_with_paths(staging_root, output_root, table))
    }

    pub fn new_with_paths(
        staging_root: Utf8PathBuf,
        output_root: Utf8PathBuf,
        table: VariableTable,
    ) -> Self {
        Self {
            staging_root,
            output_root,
            table,
            min_bytes: 1,
        }
    }

    /// Files shorter than this are treated as absent.
    pub fn with_min_bytes(mut self, min_bytes: u64) -> Self {
        self.min_bytes = min_bytes;
        self
    }

    pub fn staging_root(&self) -> &Utf8Path {
        &self.staging_root
    }

    pub fn output_root(&self) -> &Utf8Path {
        &self.output_root
    }

    pub fn table(&self) -> &VariableTable {
        &self.table
    }

    pub fn stage_dir(&self, variable: Variable, stage: Stage) -> Utf8PathBuf {
        let spec = self.table.get(variable);
        match (stage, spec.archive) {
            (Stage::Raw, Archive::Chirps) => self
                .staging_root
                .join("CHIRPS")
                .join(variable.dir_name()),
            (Stage::Raw, Archive::AgEra5) => {
                self.staging_root.join("ERA5").join(variable.dir_name())
            }
            (Stage::Normalized, _) => self
                .staging_root
                .join("ERA5")
                .join("rasters")
                .join(variable.dir_name()),
            (Stage::Clipped, _) => self.output_root.join(variable.dir_name()),
        }
    }

    /// Temporary per-year bundle downloaded before extraction.
    pub fn bundle_path(&self, variable: Variable, year: i32) -> Utf8PathBuf {
        self.stage_dir(variable, Stage::Raw)
            .join(format!("{year}_{}.zip", variable.column()))
    }

    pub fn ensure_dirs(&self, variable: Variable) -> Result<(), PipelineError> {
        for stage in self.table.get(variable).stages() {
            fs::create_dir_all(self.stage_dir(variable, *stage).as_std_path())
                .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    fn is_present(&self, path: &Utf8Path) -> bool {
        fs::metadata(path.as_std_path())
            .map(|meta| meta.is_file() && meta.len() >= self.min_bytes)
            .unwrap_or(false)
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), PipelineError> {
        write_atomic(path.as_std_path(), &mut &content[..])
    }
}

impl ArtifactStore for FsStore {
    fn path(&self, key: &ArtifactKey) -> Option<Utf8PathBuf> {
        let name = self.table.get(key.variable).file_name(key.stage, key.date)?;
        Some(self.stage_dir(key.variable, key.stage).join(name))
    }

    fn exists(&self, key: &ArtifactKey) -> bool {
        self.path(key)
            .map(|path| self.is_present(&path))
            .unwrap_or(false)
    }

    fn put(&self, key: &ArtifactKey, content: &[u8]) -> Result<Utf8PathBuf, PipelineError> {
        let path = self.path(key).ok_or_else(|| {
            PipelineError::Filesystem(format!(
                "stage {} does not apply to {}",
                key.stage, key.variable
            ))
        })?;
        Self::write_bytes_atomic(&path, content)?;
        Ok(path)
    }

    fn remove(&self, key: &ArtifactKey) -> Result<bool, PipelineError> {
        let Some(path) = self.path(key) else {
            return Ok(false);
        };
        remove_if_exists(path.as_std_path())
    }
}

pub fn remove_if_exists(path: &Path) -> Result<bool, PipelineError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(PipelineError::Filesystem(format!(
            "remove {}: {err}",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, FsStore) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let store = FsStore::new_with_paths(
            root.join("staging"),
            root.join("output"),
            VariableTable::standard(),
        );
        (temp, store)
    }

    #[test]
    fn layout_paths() {
        let (_temp, store) = temp_store();
        let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();

        let raw = store
            .path(&ArtifactKey::new(Variable::Prec, Stage::Raw, day))
            .unwrap();
        assert!(raw.ends_with("staging/CHIRPS/PREC/chirps-v2.0.2024.05.01.tif"));

        let normalized = store
            .path(&ArtifactKey::new(Variable::SRad, Stage::Normalized, day))
            .unwrap();
        assert!(normalized.ends_with("staging/ERA5/rasters/SRAD/SRAD_20240501.tif"));

        let clipped = store
            .path(&ArtifactKey::new(Variable::TMin, Stage::Clipped, day))
            .unwrap();
        assert!(clipped.ends_with("output/TMIN/TMIN_20240501.tif"));

        assert!(
            store
                .path(&ArtifactKey::new(Variable::Prec, Stage::Normalized, day))
                .is_none()
        );
    }

    #[test]
    fn empty_file_is_not_present() {
        let (_temp, store) = temp_store();
        let key = ArtifactKey::new(
            Variable::TMax,
            Stage::Clipped,
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
        );
        let path = store.path(&key).unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"").unwrap();
        assert!(!store.exists(&key));

        store.put(&key, b"raster").unwrap();
        assert!(store.exists(&key));
        assert!(store.remove(&key).unwrap());
        assert!(!store.exists(&key));
        assert!(!store.remove(&key).unwrap());
    }
}
