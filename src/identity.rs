//! Identity Store (IS): reversible PatientName anonymisation.
//!
//! Grounded in `original_source/dicom_receiver/core/utils/anonymization.py`
//! (`AnonymizationUtils`, which keeps a `sub-NNN` counter and a JSON-backed
//! original-value map) and `core/crypto.py`'s `restore_file`, which restores a
//! stored dataset from that same map. The dicom-rs read/write idiom
//! (`element_by_name(...).to_str()` / `DataElement::new(...)` + `.put(...)`)
//! is grounded on `other_examples/da21879d_BirendraRokaha-dcmrig__src-anon.rs.rs`.
//! Persistence (temp file + fsync + rename under a single mutex) follows the
//! atomic-write pattern used elsewhere in this workspace for JSON sidecar
//! documents.

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("I/O error accessing identity map {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed identity map at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("dataset is missing StudyInstanceUID, cannot anonymise")]
    MissingStudyUid,

    #[error("dicom element error: {0}")]
    Dicom(String),
}

/// Per-study record of what was replaced and with what, so a later restore
/// (or an authorised de-anonymised API/MOVE response) can recover the
/// original values. `patient_id` is carried unchanged (spec.md: PatientID is
/// never anonymised, only PatientName and the other configured PII tags).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyRecord {
    pub anon_patient_name: String,
    pub patient_id: String,
    /// Original value per anonymised tag name (including "PatientName").
    pub originals: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct PersistedState {
    next_counter: u64,
    /// Keyed by StudyInstanceUID.
    studies: HashMap<String, StudyRecord>,
    /// Original PatientName -> `sub-NNN`, the bijection's source of truth.
    /// Looked up before minting a new tag so the same patient gets the same
    /// tag across every study they appear in (spec.md §3/§8 property 1).
    name_map: HashMap<String, String>,
}

/// On-disk shape of the identity mapping file: `patient_info` (original
/// values per study), `patient_name_map` (the PatientName bijection), and
/// `patient_study_map` (derived, rebuilt on every save — never read back
/// as authoritative beyond reconstructing which patient owns which study).
#[derive(Debug, Default, Serialize, Deserialize)]
struct IdentityDocument {
    #[serde(default)]
    patient_info: HashMap<String, HashMap<String, String>>,
    #[serde(default)]
    patient_name_map: HashMap<String, String>,
    #[serde(default)]
    patient_study_map: HashMap<String, Vec<String>>,
}

impl PersistedState {
    fn to_document(&self) -> IdentityDocument {
        let mut patient_info = HashMap::new();
        let mut patient_study_map: HashMap<String, Vec<String>> = HashMap::new();

        for (study_uid, record) in &self.studies {
            patient_info.insert(study_uid.clone(), record.originals.clone());
            patient_study_map
                .entry(record.patient_id.clone())
                .or_default()
                .push(study_uid.clone());
        }

        IdentityDocument {
            patient_info,
            patient_name_map: self.name_map.clone(),
            patient_study_map,
        }
    }

    fn from_document(doc: IdentityDocument) -> Self {
        let mut patient_id_of: HashMap<String, String> = HashMap::new();
        for (patient_id, study_uids) in &doc.patient_study_map {
            for study_uid in study_uids {
                patient_id_of.insert(study_uid.clone(), patient_id.clone());
            }
        }

        let mut studies = HashMap::new();
        for (study_uid, originals) in doc.patient_info {
            let anon_patient_name = originals
                .get("PatientName")
                .and_then(|original| doc.patient_name_map.get(original))
                .cloned()
                .unwrap_or_default();
            let patient_id = patient_id_of.get(&study_uid).cloned().unwrap_or_default();
            studies.insert(
                study_uid,
                StudyRecord {
                    anon_patient_name,
                    patient_id,
                    originals,
                },
            );
        }

        PersistedState {
            next_counter: 0,
            studies,
            name_map: doc.patient_name_map,
        }
    }
}

struct Inner {
    path: PathBuf,
    state: PersistedState,
}

/// Reversible anonymisation keyed by StudyInstanceUID, bijective on
/// PatientName (`sub-NNN`, monotonically increasing), literal for the rest
/// of the configured PII tag set.
pub struct IdentityStore {
    inner: Mutex<Inner>,
    pii_tags: Vec<String>,
}

const ANON_LITERAL: &str = "ANON";

impl IdentityStore {
    /// Load the persisted mapping from `path` if it exists, else start
    /// empty. `pii_tags` is the configured PII tag name list (PatientName is
    /// always treated specially regardless of whether it appears in it).
    ///
    /// A missing file is normal (first run). An unreadable or malformed file
    /// is logged and treated as an empty mapping rather than propagated —
    /// per spec.md §4.1/§7, a bad mapping file must never stop the SCP from
    /// starting.
    pub fn load(path: impl Into<PathBuf>, pii_tags: Vec<String>) -> Result<Self, IdentityError> {
        let path = path.into();
        let state = if path.exists() {
            match fs::read(&path)
                .map_err(|e| IdentityError::Io {
                    path: path.clone(),
                    source: e,
                })
                .and_then(|bytes| {
                    serde_json::from_slice::<IdentityDocument>(&bytes).map_err(|e| IdentityError::Parse {
                        path: path.clone(),
                        source: e,
                    })
                }) {
                Ok(doc) => PersistedState::from_document(doc),
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "identity map unreadable or malformed, starting with an empty mapping");
                    PersistedState::default()
                }
            }
        } else {
            PersistedState::default()
        };

        let mut store = Self {
            inner: Mutex::new(Inner { path, state }),
            pii_tags,
        };
        store.recover_counter();
        Ok(store)
    }

    /// Recompute `next_counter` from the highest `sub-NNN` already recorded,
    /// in case the persisted `next_counter` itself is stale or absent (e.g.
    /// a map file hand-edited or merged from an older version).
    fn recover_counter(&mut self) {
        let inner = self.inner.get_mut().expect("identity mutex poisoned");
        let max_seen = inner
            .state
            .name_map
            .values()
            .filter_map(|tag| tag.strip_prefix("sub-"))
            .filter_map(|n| n.parse::<u64>().ok())
            .max();
        if let Some(max_seen) = max_seen {
            inner.state.next_counter = inner.state.next_counter.max(max_seen + 1);
        }
        if inner.state.next_counter == 0 {
            inner.state.next_counter = 1;
        }
    }

    /// Anonymise `dataset` in place, returning the per-tag map of original
    /// values that were replaced (including "PatientName"). Idempotent per
    /// study: a study seen before reuses its existing `sub-NNN` instead of
    /// minting a new one.
    pub fn anonymise(
        &self,
        dataset: &mut InMemDicomObject,
    ) -> Result<HashMap<String, String>, IdentityError> {
        let study_uid = dataset
            .element_by_name("StudyInstanceUID")
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|s| s.to_string())
            .ok_or(IdentityError::MissingStudyUid)?;

        let patient_id = dataset
            .element_by_name("PatientID")
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|s| s.to_string())
            .unwrap_or_default();

        let mut inner = self.inner.lock().expect("identity mutex poisoned");

        let original_name = dataset
            .element_by_name("PatientName")
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|s| s.to_string());

        // A study already seen keeps its tag. Otherwise the same original
        // PatientName, even under a different study, must resolve to the
        // same tag — the bijection is on PatientName, not on study.
        let anon_name = if let Some(existing) = inner.state.studies.get(&study_uid) {
            existing.anon_patient_name.clone()
        } else if let Some(existing) = original_name
            .as_ref()
            .and_then(|name| inner.state.name_map.get(name))
        {
            existing.clone()
        } else {
            let n = inner.state.next_counter;
            inner.state.next_counter += 1;
            let tag = format!("sub-{n:03}");
            if let Some(name) = &original_name {
                inner.state.name_map.insert(name.clone(), tag.clone());
            }
            tag
        };

        let mut originals = HashMap::new();
        if let Some(v) = &original_name {
            originals.insert("PatientName".to_string(), v.clone());
        }
        dataset.put(DataElement::new(
            tags::PATIENT_NAME,
            VR::PN,
            dicom_value!(Str, anon_name.clone()),
        ));

        for tag_name in &self.pii_tags {
            if tag_name == "PatientName" || tag_name == "PatientID" {
                continue;
            }
            if let Some((tag, vr)) = known_pii_tag(tag_name) {
                if let Ok(elem) = dataset.element_by_name(tag_name) {
                    if let Ok(v) = elem.to_str() {
                        originals.insert(tag_name.clone(), v.to_string());
                    }
                }
                dataset.put(DataElement::new(tag, vr, dicom_value!(Str, ANON_LITERAL)));
            }
        }

        inner.state.studies.insert(
            study_uid,
            StudyRecord {
                anon_patient_name: anon_name,
                patient_id,
                originals,
            },
        );
        persist(&inner.path, &inner.state)?;
        Ok(originals)
    }

    /// Restore `dataset`'s originals in place from its recorded study
    /// mapping. Returns `false` (not an error) if the study was never
    /// anonymised through this store, mirroring `restore_file`'s behaviour
    /// of leaving unmapped fields untouched.
    pub fn restore(&self, dataset: &mut InMemDicomObject) -> Result<bool, IdentityError> {
        let study_uid = match dataset
            .element_by_name("StudyInstanceUID")
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|s| s.to_string())
        {
            Some(uid) => uid,
            None => return Ok(false),
        };

        let inner = self.inner.lock().expect("identity mutex poisoned");
        let record = match inner.state.studies.get(&study_uid) {
            Some(r) => r.clone(),
            None => return Ok(false),
        };
        drop(inner);

        for (tag_name, original) in &record.originals {
            if let Some((tag, vr)) = known_pii_tag(tag_name) {
                dataset.put(DataElement::new(tag, vr, dicom_value!(Str, original.clone())));
            }
        }
        Ok(true)
    }

    /// The `sub-NNN` name assigned to a study, if it has been anonymised.
    pub fn anonymised_name_for(&self, study_uid: &str) -> Option<String> {
        let inner = self.inner.lock().expect("identity mutex poisoned");
        inner
            .state
            .studies
            .get(study_uid)
            .map(|r| r.anon_patient_name.clone())
    }

    /// Find the original PatientName for an anonymised `sub-NNN` value.
    pub fn reverse_name_lookup(&self, anon_name: &str) -> Option<String> {
        let inner = self.inner.lock().expect("identity mutex poisoned");
        inner
            .state
            .name_map
            .iter()
            .find(|(_, tag)| tag.as_str() == anon_name)
            .map(|(name, _)| name.clone())
    }

    /// PatientID -> list of StudyInstanceUIDs recorded under it.
    pub fn patient_ids_to_studies(&self) -> HashMap<String, Vec<String>> {
        let inner = self.inner.lock().expect("identity mutex poisoned");
        let mut out: HashMap<String, Vec<String>> = HashMap::new();
        for (study_uid, record) in &inner.state.studies {
            out.entry(record.patient_id.clone())
                .or_default()
                .push(study_uid.clone());
        }
        out
    }

    pub fn mapping_snapshot(&self) -> HashMap<String, StudyRecord> {
        let inner = self.inner.lock().expect("identity mutex poisoned");
        inner.state.studies.clone()
    }
}

fn known_pii_tag(name: &str) -> Option<(dicom_core::Tag, VR)> {
    match name {
        "PatientName" => Some((tags::PATIENT_NAME, VR::PN)),
        "PatientID" => Some((tags::PATIENT_ID, VR::LO)),
        "PatientBirthDate" => Some((tags::PATIENT_BIRTH_DATE, VR::DA)),
        "PatientAddress" => Some((tags::PATIENT_ADDRESS, VR::LO)),
        "PatientTelephoneNumbers" => Some((tags::PATIENT_TELEPHONE_NUMBERS, VR::SH)),
        "OtherPatientIDs" => Some((tags::OTHER_PATIENT_IDS, VR::LO)),
        "OtherPatientNames" => Some((tags::OTHER_PATIENT_NAMES, VR::PN)),
        _ => None,
    }
}

/// Write `state` to `path` atomically: serialise to a sibling temp file,
/// fsync it, then rename over the destination. `patient_study_map` is
/// rebuilt from `state.studies` on every call rather than maintained
/// incrementally.
fn persist(path: &Path, state: &PersistedState) -> Result<(), IdentityError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| IdentityError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;

    let tmp_path = parent.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("identity")
    ));

    let document = state.to_document();
    {
        let file = File::create(&tmp_path).map_err(|e| IdentityError::Io {
            path: tmp_path.clone(),
            source: e,
        })?;
        serde_json::to_writer_pretty(&file, &document).map_err(|e| IdentityError::Parse {
            path: tmp_path.clone(),
            source: e,
        })?;
        file.sync_all().map_err(|e| IdentityError::Io {
            path: tmp_path.clone(),
            source: e,
        })?;
    }

    fs::rename(&tmp_path, path).map_err(|e| IdentityError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_object(study_uid: &str, patient_id: &str, patient_name: &str) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, study_uid),
        ));
        obj.put(DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            dicom_value!(Str, patient_id),
        ));
        obj.put(DataElement::new(
            tags::PATIENT_NAME,
            VR::PN,
            dicom_value!(Str, patient_name),
        ));
        obj.put(DataElement::new(
            tags::PATIENT_BIRTH_DATE,
            VR::DA,
            dicom_value!(Str, "19800101"),
        ));
        obj
    }

    #[test]
    fn anonymise_assigns_monotonic_counter_and_is_idempotent_per_study() {
        let dir = tempdir().unwrap();
        let store = IdentityStore::load(
            dir.path().join("map.json"),
            vec!["PatientBirthDate".to_string()],
        )
        .unwrap();

        let mut obj_a = sample_object("1.2.3", "PID-A", "Doe^Jane");
        store.anonymise(&mut obj_a).unwrap();
        let name_a = obj_a
            .element_by_name("PatientName")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert_eq!(name_a, "sub-001");

        let mut obj_b = sample_object("4.5.6", "PID-B", "Smith^John");
        store.anonymise(&mut obj_b).unwrap();
        let name_b = obj_b
            .element_by_name("PatientName")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert_eq!(name_b, "sub-002");

        let mut obj_a_again = sample_object("1.2.3", "PID-A", "Doe^Jane");
        store.anonymise(&mut obj_a_again).unwrap();
        assert_eq!(
            obj_a_again
                .element_by_name("PatientName")
                .unwrap()
                .to_str()
                .unwrap(),
            "sub-001"
        );
    }

    #[test]
    fn same_patient_name_across_studies_gets_the_same_tag() {
        let dir = tempdir().unwrap();
        let store = IdentityStore::load(dir.path().join("map.json"), vec![]).unwrap();

        let mut first_study = sample_object("1.1.1", "PID-A", "DOE^JOHN");
        store.anonymise(&mut first_study).unwrap();
        let mut second_study = sample_object("2.2.2", "PID-A", "DOE^JOHN");
        store.anonymise(&mut second_study).unwrap();
        let mut third_study = sample_object("3.3.3", "PID-B", "ROE^JANE");
        store.anonymise(&mut third_study).unwrap();

        let tag = |obj: &InMemDicomObject| {
            obj.element_by_name("PatientName")
                .unwrap()
                .to_str()
                .unwrap()
                .to_string()
        };
        assert_eq!(tag(&first_study), "sub-001");
        assert_eq!(tag(&second_study), "sub-001");
        assert_eq!(tag(&third_study), "sub-002");
    }

    #[test]
    fn patient_id_is_preserved_other_pii_becomes_anon() {
        let dir = tempdir().unwrap();
        let store = IdentityStore::load(
            dir.path().join("map.json"),
            vec!["PatientBirthDate".to_string()],
        )
        .unwrap();

        let mut obj = sample_object("1.2.3", "PID-A", "Doe^Jane");
        store.anonymise(&mut obj).unwrap();

        assert_eq!(
            obj.element_by_name("PatientID").unwrap().to_str().unwrap(),
            "PID-A"
        );
        assert_eq!(
            obj.element_by_name("PatientBirthDate")
                .unwrap()
                .to_str()
                .unwrap(),
            ANON_LITERAL
        );
    }

    #[test]
    fn restore_recovers_original_values() {
        let dir = tempdir().unwrap();
        let store = IdentityStore::load(
            dir.path().join("map.json"),
            vec!["PatientBirthDate".to_string()],
        )
        .unwrap();

        let mut obj = sample_object("1.2.3", "PID-A", "Doe^Jane");
        store.anonymise(&mut obj).unwrap();

        let restored = store.restore(&mut obj).unwrap();
        assert!(restored);
        assert_eq!(
            obj.element_by_name("PatientName")
                .unwrap()
                .to_str()
                .unwrap(),
            "Doe^Jane"
        );
        assert_eq!(
            obj.element_by_name("PatientBirthDate")
                .unwrap()
                .to_str()
                .unwrap(),
            "19800101"
        );
    }

    #[test]
    fn reverse_name_lookup_finds_original_patient_name() {
        let dir = tempdir().unwrap();
        let store = IdentityStore::load(dir.path().join("map.json"), vec![]).unwrap();

        let mut obj = sample_object("1.2.3", "PID-A", "Doe^Jane");
        let anon_name = {
            store.anonymise(&mut obj).unwrap();
            store.anonymised_name_for("1.2.3").unwrap()
        };

        assert_eq!(store.reverse_name_lookup(&anon_name).unwrap(), "Doe^Jane");
        assert!(store.reverse_name_lookup("sub-999").is_none());
    }

    #[test]
    fn persisted_document_matches_the_documented_schema() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("map.json");
        let store = IdentityStore::load(path.clone(), vec![]).unwrap();

        let mut obj = sample_object("1.2.3", "PID-A", "Doe^Jane");
        store.anonymise(&mut obj).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();

        assert_eq!(
            doc["patient_info"]["1.2.3"]["PatientName"],
            serde_json::json!("Doe^Jane")
        );
        assert_eq!(doc["patient_name_map"]["Doe^Jane"], serde_json::json!("sub-001"));
        assert_eq!(
            doc["patient_study_map"]["PID-A"],
            serde_json::json!(["1.2.3"])
        );
    }

    #[test]
    fn counter_is_recovered_from_existing_map_on_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("map.json");

        {
            let store = IdentityStore::load(path.clone(), vec![]).unwrap();
            let mut obj = sample_object("1.1.1", "PID-A", "Doe^Jane");
            store.anonymise(&mut obj).unwrap();
            let mut obj2 = sample_object("2.2.2", "PID-B", "Roe^Richard");
            store.anonymise(&mut obj2).unwrap();
        }

        let reloaded = IdentityStore::load(path, vec![]).unwrap();
        let mut obj3 = sample_object("3.3.3", "PID-C", "Poe^Peter");
        reloaded.anonymise(&mut obj3).unwrap();
        assert_eq!(
            obj3.element_by_name("PatientName")
                .unwrap()
                .to_str()
                .unwrap(),
            "sub-003"
        );
    }

    #[test]
    fn malformed_map_file_falls_back_to_empty_state_instead_of_erroring() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("map.json");
        fs::write(&path, b"{ not json").unwrap();

        let store = IdentityStore::load(path, vec![]).unwrap();
        let mut obj = sample_object("1.2.3", "PID-A", "Doe^Jane");
        store.anonymise(&mut obj).unwrap();
        assert_eq!(
            obj.element_by_name("PatientName")
                .unwrap()
                .to_str()
                .unwrap(),
            "sub-001"
        );
    }

    #[test]
    fn patient_ids_to_studies_groups_by_patient() {
        let dir = tempdir().unwrap();
        let store = IdentityStore::load(dir.path().join("map.json"), vec![]).unwrap();

        let mut obj1 = sample_object("1.1.1", "PID-A", "Doe^Jane");
        store.anonymise(&mut obj1).unwrap();
        let mut obj2 = sample_object("2.2.2", "PID-A", "Doe^Jane");
        store.anonymise(&mut obj2).unwrap();

        let grouped = store.patient_ids_to_studies();
        let mut studies = grouped.get("PID-A").cloned().unwrap_or_default();
        studies.sort();
        assert_eq!(studies, vec!["1.1.1".to_string(), "2.2.2".to_string()]);
    }
}
