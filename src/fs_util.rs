use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tempfile::Builder;
use zip::ZipArchive;

use crate::error::PipelineError;

/// Streams `content` into a temporary sibling of `path` and renames it into
/// place, so `path` is either absent or complete.
pub fn write_atomic<R: Read + ?Sized>(path: &Path, content: &mut R) -> Result<(), PipelineError> {
    let parent = path
        .parent()
        .ok_or_else(|| PipelineError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent).map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix(".agroclim")
        .tempfile_in(parent)
        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    io::copy(content, temp.as_file_mut()).map_err(|err| {
        PipelineError::Filesystem(format!("write {}: {err}", path.display()))
    })?;
    temp.persist(path)
        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    Ok(())
}

/// Unpacks every file entry of `zip_path` into `target_dir`, returning the written paths.
pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let file = fs::File::open(zip_path).map_err(|err| {
        PipelineError::Filesystem(format!("open zip {}: {err}", zip_path.display()))
    })?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| PipelineError::Filesystem(err.to_string()))?;

    let mut written = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(PipelineError::Filesystem(
                    "zip entry path traversal detected".to_string(),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
            continue;
        }

        write_atomic(&entry_path, &mut entry)?;
        written.push(entry_path);
    }
    Ok(written)
}

pub fn gunzip(compressed: &[u8]) -> Result<Vec<u8>, PipelineError> {
    let mut decoder = GzDecoder::new(compressed);
    let mut content = Vec::new();
    decoder
        .read_to_end(&mut content)
        .map_err(|err| PipelineError::Filesystem(format!("gzip decode: {err}")))?;
    Ok(content)
}
