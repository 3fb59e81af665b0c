//! Object Store (OS): deterministic on-disk layout for received DICOM
//! instances and the filesystem-walk query accessors the Protocol Service
//! Provider answers FIND/GET against when the central API is unavailable.
//!
//! Grounded in `original_source/dicom_receiver/core/storage.py`'s
//! `DicomStorage` (`get_file_path`, `get_study_path_by_uid`,
//! `migrate_to_patient_structure`) and in the query handlers
//! (`core/query_handlers/*.py`) for the shape of the query accessor records.
//! Layout: `<root>/<patient>/<study>/<series>/scans/<sop>.dcm`.

use crate::config::config::sanitise_patient_id;
use dicom_object::InMemDicomObject;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

const SCANS_DIR: &str = "scans";
const UNKNOWN_PATIENT: &str = "unknown";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("study {0} not found under the storage root")]
    StudyNotFound(String),

    #[error("series {0} not found under the storage root")]
    SeriesNotFound(String),

    #[error("failed to read DICOM file {path}: {source}")]
    Dicom {
        path: PathBuf,
        #[source]
        source: dicom_object::ReadError,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Default)]
pub struct PatientRecord {
    pub patient_id: String,
    pub patient_name: Option<String>,
    pub patient_birth_date: Option<String>,
    pub patient_sex: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StudyRecord {
    pub patient_id: String,
    pub study_instance_uid: String,
    pub study_id: Option<String>,
    pub study_date: Option<String>,
    pub study_time: Option<String>,
    pub study_description: Option<String>,
    pub accession_number: Option<String>,
    pub number_of_series: usize,
    pub number_of_instances: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SeriesRecord {
    pub series_instance_uid: String,
    pub modality: Option<String>,
    pub series_number: Option<String>,
    pub series_description: Option<String>,
    pub series_date: Option<String>,
    pub series_time: Option<String>,
    pub instance_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ImageRecord {
    pub series_instance_uid: String,
    pub sop_instance_uid: String,
    pub sop_class_uid: Option<String>,
    pub instance_number: Option<String>,
}

/// Filesystem-backed object store rooted at a single storage directory.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic path for an instance, creating the four-level
    /// directory (`patient/study/series/scans`) if it does not exist yet.
    /// The patient segment is derived from `dataset`'s PatientID when
    /// provided, else `"unknown"`.
    pub fn path_for(
        &self,
        study_uid: &str,
        series_uid: &str,
        sop_uid: &str,
        dataset: Option<&InMemDicomObject>,
    ) -> Result<PathBuf, StorageError> {
        let patient_id = dataset
            .and_then(|ds| ds.element_by_name("PatientID").ok())
            .and_then(|e| e.to_str().ok())
            .map(|v| sanitise_patient_id(&v))
            .unwrap_or_else(|| UNKNOWN_PATIENT.to_string());

        let scans_dir = self
            .root
            .join(&patient_id)
            .join(study_uid)
            .join(series_uid)
            .join(SCANS_DIR);
        std::fs::create_dir_all(&scans_dir).map_err(|e| io_err(&scans_dir, e))?;
        Ok(scans_dir.join(format!("{sop_uid}.dcm")))
    }

    fn patient_dirs(&self) -> Result<Vec<PathBuf>, StorageError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(&self.root).map_err(|e| io_err(&self.root, e))? {
            let entry = entry.map_err(|e| io_err(&self.root, e))?;
            if entry.path().is_dir() {
                dirs.push(entry.path());
            }
        }
        Ok(dirs)
    }

    fn subdirs(dir: &Path) -> Result<Vec<PathBuf>, StorageError> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(|e| io_err(dir, e))? {
            let entry = entry.map_err(|e| io_err(dir, e))?;
            if entry.path().is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Locate a study's directory by scanning every patient directory,
    /// falling back to a legacy `<root>/<study>` path if not found anywhere
    /// (matching `get_study_path_by_uid`'s fallback).
    pub fn resolve_study(&self, study_uid: &str) -> Result<PathBuf, StorageError> {
        for patient_dir in self.patient_dirs()? {
            let candidate = patient_dir.join(study_uid);
            if candidate.is_dir() {
                return Ok(candidate);
            }
        }
        Ok(self.root.join(study_uid))
    }

    fn resolve_study_with_patient(
        &self,
        study_uid: &str,
    ) -> Result<(String, PathBuf), StorageError> {
        for patient_dir in self.patient_dirs()? {
            let candidate = patient_dir.join(study_uid);
            if candidate.is_dir() {
                let patient_id = patient_dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or(UNKNOWN_PATIENT)
                    .to_string();
                return Ok((patient_id, candidate));
            }
        }
        Err(StorageError::StudyNotFound(study_uid.to_string()))
    }

    /// Scan every study directory for a matching series, regardless of
    /// which study it belongs to — mirrors `resolve_study`'s
    /// ownership-agnostic search, one level deeper.
    pub fn resolve_series(&self, series_uid: &str) -> Result<PathBuf, StorageError> {
        for patient_dir in self.patient_dirs()? {
            for study_dir in Self::subdirs(&patient_dir)? {
                let candidate = study_dir.join(series_uid);
                if candidate.is_dir() {
                    return Ok(candidate);
                }
            }
        }
        Err(StorageError::SeriesNotFound(series_uid.to_string()))
    }

    pub fn scan_files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().map(|x| x == "dcm").unwrap_or(false))
            .map(|e| e.path().to_path_buf())
            .collect();
        files.sort();
        files
    }

    fn first_dataset(
        dir: &Path,
    ) -> Result<Option<dicom_object::FileDicomObject<InMemDicomObject>>, StorageError> {
        for file in Self::scan_files(dir).into_iter().take(1) {
            let obj = dicom_object::open_file(&file)
                .map_err(|e| StorageError::Dicom { path: file, source: e })?;
            return Ok(Some(obj));
        }
        Ok(None)
    }

    fn str_tag(obj: &InMemDicomObject, name: &str) -> Option<String> {
        obj.element_by_name(name)
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|v| v.to_string())
    }

    /// One record per patient directory, populated from the first DICOM
    /// instance found anywhere beneath it.
    pub fn all_patients(&self) -> Result<Vec<PatientRecord>, StorageError> {
        let mut out = Vec::new();
        for patient_dir in self.patient_dirs()? {
            let patient_id = patient_dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(UNKNOWN_PATIENT)
                .to_string();
            let dataset = Self::first_dataset(&patient_dir)?;
            out.push(PatientRecord {
                patient_id: dataset
                    .as_ref()
                    .and_then(|ds| Self::str_tag(ds, "PatientID"))
                    .unwrap_or_else(|| patient_id.clone()),
                patient_name: dataset.as_ref().and_then(|ds| Self::str_tag(ds, "PatientName")),
                patient_birth_date: dataset
                    .as_ref()
                    .and_then(|ds| Self::str_tag(ds, "PatientBirthDate")),
                patient_sex: dataset.as_ref().and_then(|ds| Self::str_tag(ds, "PatientSex")),
            });
        }
        Ok(out)
    }

    /// One record per study directory across all patients.
    pub fn all_studies(&self) -> Result<Vec<StudyRecord>, StorageError> {
        let mut out = Vec::new();
        for patient_dir in self.patient_dirs()? {
            let patient_id = patient_dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(UNKNOWN_PATIENT)
                .to_string();
            for study_dir in Self::subdirs(&patient_dir)? {
                let study_instance_uid = study_dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default()
                    .to_string();
                let dataset = Self::first_dataset(&study_dir)?;
                let series_dirs = Self::subdirs(&study_dir)?;
                let mut number_of_instances = 0;
                for series_dir in &series_dirs {
                    number_of_instances += Self::scan_files(&series_dir.join(SCANS_DIR)).len();
                }
                out.push(StudyRecord {
                    patient_id: patient_id.clone(),
                    study_instance_uid,
                    study_id: dataset.as_ref().and_then(|ds| Self::str_tag(ds, "StudyID")),
                    study_date: dataset.as_ref().and_then(|ds| Self::str_tag(ds, "StudyDate")),
                    study_time: dataset.as_ref().and_then(|ds| Self::str_tag(ds, "StudyTime")),
                    study_description: dataset
                        .as_ref()
                        .and_then(|ds| Self::str_tag(ds, "StudyDescription")),
                    accession_number: dataset
                        .as_ref()
                        .and_then(|ds| Self::str_tag(ds, "AccessionNumber")),
                    number_of_series: series_dirs.len(),
                    number_of_instances,
                });
            }
        }
        Ok(out)
    }

    /// Series beneath a given study, regardless of which patient owns it.
    pub fn series_for(&self, study_uid: &str) -> Result<Vec<SeriesRecord>, StorageError> {
        let (_patient, study_dir) = self.resolve_study_with_patient(study_uid)?;
        let mut out = Vec::new();
        for series_dir in Self::subdirs(&study_dir)? {
            let series_instance_uid = series_dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            let scans_dir = series_dir.join(SCANS_DIR);
            let instance_count = Self::scan_files(&scans_dir).len();
            let dataset = Self::first_dataset(&scans_dir)?;
            out.push(SeriesRecord {
                series_instance_uid,
                modality: dataset.as_ref().and_then(|ds| Self::str_tag(ds, "Modality")),
                series_number: dataset.as_ref().and_then(|ds| Self::str_tag(ds, "SeriesNumber")),
                series_description: dataset
                    .as_ref()
                    .and_then(|ds| Self::str_tag(ds, "SeriesDescription")),
                series_date: dataset.as_ref().and_then(|ds| Self::str_tag(ds, "SeriesDate")),
                series_time: dataset.as_ref().and_then(|ds| Self::str_tag(ds, "SeriesTime")),
                instance_count,
            });
        }
        Ok(out)
    }

    /// Instances within a given series, located by a full tree scan (the
    /// series UID alone is enough to find it — see `resolve_series`).
    pub fn images_for(&self, series_uid: &str) -> Result<Vec<ImageRecord>, StorageError> {
        let series_dir = self.resolve_series(series_uid)?;
        Self::images_in_dir(&series_dir.join(SCANS_DIR), series_uid)
    }

    /// Every instance across every series of a study, for an IMAGE-level
    /// query that omits SeriesInstanceUID (searches the whole study).
    pub fn images_for_study(&self, study_uid: &str) -> Result<Vec<ImageRecord>, StorageError> {
        let (_patient, study_dir) = self.resolve_study_with_patient(study_uid)?;
        let mut out = Vec::new();
        for series_dir in Self::subdirs(&study_dir)? {
            let series_uid = series_dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            out.extend(Self::images_in_dir(&series_dir.join(SCANS_DIR), &series_uid)?);
        }
        Ok(out)
    }

    fn images_in_dir(scans_dir: &Path, series_uid: &str) -> Result<Vec<ImageRecord>, StorageError> {
        let mut out = Vec::new();
        for file in Self::scan_files(scans_dir) {
            let dataset = dicom_object::open_file(&file).map_err(|e| StorageError::Dicom {
                path: file.clone(),
                source: e,
            })?;
            out.push(ImageRecord {
                series_instance_uid: series_uid.to_string(),
                sop_instance_uid: Self::str_tag(&dataset, "SOPInstanceUID").unwrap_or_default(),
                sop_class_uid: Self::str_tag(&dataset, "SOPClassUID"),
                instance_number: Self::str_tag(&dataset, "InstanceNumber"),
            });
        }
        Ok(out)
    }

    /// Every `.dcm` file beneath a study's directory, for ZIP packaging.
    pub fn files_for_study(&self, study_uid: &str) -> Result<Vec<PathBuf>, StorageError> {
        let study_dir = self.resolve_study(study_uid)?;
        Ok(Self::scan_files(&study_dir))
    }

    /// Migrate legacy `<root>/<study>/<series>/*.dcm` directories into the
    /// four-level `<patient>/<study>/<series>/scans/*.dcm` layout. A
    /// top-level directory is considered legacy when any of its
    /// series-candidate subdirectories holds `.dcm` files directly (i.e. has
    /// no `scans` subdirectory yet); patient directories that already follow
    /// the new layout are left untouched. `patient_study_index` maps a
    /// patient id to the study UIDs it owns (e.g. from the identity store's
    /// `patient_ids_to_studies`); studies absent from it land under
    /// `"unknown"`.
    pub fn migrate(
        &self,
        patient_study_index: Option<&HashMap<String, Vec<String>>>,
    ) -> Result<(), StorageError> {
        let top_level = self.patient_dirs()?;
        for dir_path in top_level {
            let study_uid = match dir_path.file_name().and_then(|n| n.to_str()) {
                Some(s) => s.to_string(),
                None => continue,
            };

            if !Self::is_legacy_study_dir(&dir_path)? {
                continue;
            }

            let patient_id = patient_study_index
                .and_then(|index| {
                    index
                        .iter()
                        .find(|(_, studies)| studies.iter().any(|s| s == &study_uid))
                        .map(|(pid, _)| pid.clone())
                })
                .unwrap_or_else(|| UNKNOWN_PATIENT.to_string());

            tracing::info!(study_uid = %study_uid, patient_id = %patient_id, "migrating legacy study layout");

            let new_study_dir = self.root.join(&patient_id).join(&study_uid);
            std::fs::create_dir_all(&new_study_dir).map_err(|e| io_err(&new_study_dir, e))?;

            for series_dir in Self::subdirs(&dir_path)? {
                let series_uid = series_dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default()
                    .to_string();
                let new_scans_dir = new_study_dir.join(&series_uid).join(SCANS_DIR);
                std::fs::create_dir_all(&new_scans_dir).map_err(|e| io_err(&new_scans_dir, e))?;

                for entry in std::fs::read_dir(&series_dir).map_err(|e| io_err(&series_dir, e))? {
                    let entry = entry.map_err(|e| io_err(&series_dir, e))?;
                    let path = entry.path();
                    if path.extension().map(|e| e == "dcm").unwrap_or(false) {
                        let dest = new_scans_dir.join(path.file_name().unwrap());
                        std::fs::rename(&path, &dest).map_err(|e| io_err(&path, e))?;
                    }
                }
            }

            if std::fs::read_dir(&dir_path)
                .map_err(|e| io_err(&dir_path, e))?
                .next()
                .is_none()
            {
                std::fs::remove_dir(&dir_path).map_err(|e| io_err(&dir_path, e))?;
            }
        }
        Ok(())
    }

    fn is_legacy_study_dir(dir_path: &Path) -> Result<bool, StorageError> {
        for series_dir in Self::subdirs(dir_path)? {
            if !series_dir.join(SCANS_DIR).is_dir() {
                for entry in std::fs::read_dir(&series_dir).map_err(|e| io_err(&series_dir, e))? {
                    let entry = entry.map_err(|e| io_err(&series_dir, e))?;
                    if entry.path().extension().map(|e| e == "dcm").unwrap_or(false) {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{dicom_value, DataElement, VR};
    use dicom_dictionary_std::tags;
    use tempfile::tempdir;

    fn dataset(patient_id: &str) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            dicom_value!(Str, patient_id),
        ));
        obj
    }

    #[test]
    fn path_for_is_deterministic_and_creates_scans_dir() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        let ds = dataset("Patient/One:*");

        let path = store.path_for("1.1", "1.1.1", "1.1.1.1", Some(&ds)).unwrap();
        assert!(path.parent().unwrap().is_dir());
        assert_eq!(path.file_name().unwrap(), "1.1.1.1.dcm");
        assert!(path.to_string_lossy().contains("PatientOne"));

        let again = store.path_for("1.1", "1.1.1", "1.1.1.1", Some(&ds)).unwrap();
        assert_eq!(path, again);
    }

    #[test]
    fn path_for_defaults_to_unknown_without_dataset() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        let path = store.path_for("1.1", "1.1.1", "1.1.1.1", None).unwrap();
        assert!(path.starts_with(dir.path().join(UNKNOWN_PATIENT)));
    }

    #[test]
    fn resolve_study_finds_study_under_any_patient() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        let ds = dataset("P1");
        store.path_for("STUDY1", "SERIES1", "SOP1", Some(&ds)).unwrap();

        let resolved = store.resolve_study("STUDY1").unwrap();
        assert!(resolved.ends_with("P1/STUDY1"));
    }

    #[test]
    fn resolve_study_falls_back_to_legacy_path_when_absent() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        let resolved = store.resolve_study("MISSING").unwrap();
        assert_eq!(resolved, dir.path().join("MISSING"));
    }

    #[test]
    fn migrate_moves_legacy_layout_into_patient_structure() {
        let dir = tempdir().unwrap();
        let legacy_scans = dir.path().join("STUDY1").join("SERIES1");
        std::fs::create_dir_all(&legacy_scans).unwrap();
        std::fs::write(legacy_scans.join("SOP1.dcm"), b"dummy").unwrap();

        let store = ObjectStore::new(dir.path());
        let mut index = HashMap::new();
        index.insert("PAT1".to_string(), vec!["STUDY1".to_string()]);
        store.migrate(Some(&index)).unwrap();

        let moved = dir
            .path()
            .join("PAT1")
            .join("STUDY1")
            .join("SERIES1")
            .join("scans")
            .join("SOP1.dcm");
        assert!(moved.is_file());
        assert!(!dir.path().join("STUDY1").exists());
    }

    #[test]
    fn migrate_defaults_unmapped_studies_to_unknown() {
        let dir = tempdir().unwrap();
        let legacy_scans = dir.path().join("STUDY2").join("SERIES1");
        std::fs::create_dir_all(&legacy_scans).unwrap();
        std::fs::write(legacy_scans.join("SOP1.dcm"), b"dummy").unwrap();

        let store = ObjectStore::new(dir.path());
        store.migrate(None).unwrap();

        let moved = dir
            .path()
            .join(UNKNOWN_PATIENT)
            .join("STUDY2")
            .join("SERIES1")
            .join("scans")
            .join("SOP1.dcm");
        assert!(moved.is_file());
    }

    #[test]
    fn migrate_leaves_already_migrated_patient_dirs_alone() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        let ds = dataset("P1");
        store.path_for("STUDY1", "SERIES1", "SOP1", Some(&ds)).unwrap();

        store.migrate(None).unwrap();

        let still_there = dir
            .path()
            .join("P1")
            .join("STUDY1")
            .join("SERIES1")
            .join("scans")
            .join("SOP1.dcm");
        assert!(still_there.is_file());
    }
}
