//! ZIP packaging of a study directory before upload.
//!
//! Grounded in `original_source/dicom_receiver/core/uploader.py`'s
//! `ApiUploader.zip_study`/`cleanup_files`: walk the study directory, store
//! each file under an archive name relative to the study directory's
//! *parent* (so the archive's top-level entry is the study directory
//! itself), then optionally remove the zip and/or the source directory
//! after a successful upload. `walkdir` + `zip` follow the same pairing the
//! teacher uses for directory traversal and archiving.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;
use zip::write::FileOptions;

#[derive(Debug, Error)]
pub enum ZipError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("study directory {0} has no parent to derive an archive root from")]
    NoParent(PathBuf),

    #[error("path {0} is not valid UTF-8")]
    NonUtf8Path(PathBuf),
}

/// Archive every file under `study_dir`, storing each entry's path relative
/// to `study_dir`'s parent. Writes to `output_zip` if given, else
/// `<study_dir>.zip` alongside it.
pub fn zip_study(study_dir: &Path, output_zip: Option<&Path>) -> Result<PathBuf, ZipError> {
    let parent = study_dir
        .parent()
        .ok_or_else(|| ZipError::NoParent(study_dir.to_path_buf()))?;

    let output_path = match output_zip {
        Some(p) => p.to_path_buf(),
        None => {
            let name = study_dir
                .file_name()
                .map(|n| format!("{}.zip", n.to_string_lossy()))
                .unwrap_or_else(|| "study.zip".to_string());
            parent.join(name)
        }
    };

    let file = File::create(&output_path)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    for entry in WalkDir::new(study_dir).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let arcname = path
            .strip_prefix(parent)
            .unwrap_or(path)
            .to_str()
            .ok_or_else(|| ZipError::NonUtf8Path(path.to_path_buf()))?
            .replace('\\', "/");

        zip.start_file(arcname, options)?;
        let mut f = File::open(path)?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;
        zip.write_all(&buf)?;
    }

    zip.finish()?;
    Ok(output_path)
}

/// Remove the zip file and, if given, the source study directory.
/// Failures are logged, never propagated — matches `cleanup_files`'
/// best-effort semantics.
pub fn cleanup_files(zip_file_path: &Path, study_dir: Option<&Path>) {
    if zip_file_path.exists() {
        if let Err(e) = std::fs::remove_file(zip_file_path) {
            tracing::error!(path = %zip_file_path.display(), error = %e, "failed to remove zip file");
        } else {
            tracing::info!(path = %zip_file_path.display(), "removed zip file");
        }
    }

    if let Some(dir) = study_dir {
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(dir) {
                tracing::error!(path = %dir.display(), error = %e, "failed to remove study directory");
            } else {
                tracing::info!(path = %dir.display(), "removed study directory");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;

    #[test]
    fn zip_study_archives_files_relative_to_parent() {
        let temp = tempfile::tempdir().unwrap();
        let study_dir = temp.path().join("STUDY-1");
        let series_dir = study_dir.join("SERIES-1").join("scans");
        std::fs::create_dir_all(&series_dir).unwrap();
        std::fs::write(series_dir.join("image1.dcm"), b"dummy-dicom-bytes").unwrap();

        let zip_path = zip_study(&study_dir, None).unwrap();
        assert!(zip_path.exists());
        assert_eq!(zip_path.file_name().unwrap(), "STUDY-1.zip");

        let file = File::open(&zip_path).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        let mut found = false;
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).unwrap();
            if entry.name() == "STUDY-1/SERIES-1/scans/image1.dcm" {
                found = true;
                let mut contents = Vec::new();
                entry.read_to_end(&mut contents).unwrap();
                assert_eq!(contents, b"dummy-dicom-bytes");
            }
        }
        assert!(found, "expected archive to contain the nested scan file");
    }

    #[test]
    fn cleanup_files_removes_zip_and_directory() {
        let temp = tempfile::tempdir().unwrap();
        let study_dir = temp.path().join("STUDY-2");
        std::fs::create_dir_all(&study_dir).unwrap();
        std::fs::write(study_dir.join("a.dcm"), b"x").unwrap();
        let zip_path = zip_study(&study_dir, None).unwrap();

        cleanup_files(&zip_path, Some(&study_dir));

        assert!(!zip_path.exists());
        assert!(!study_dir.exists());
    }
}
