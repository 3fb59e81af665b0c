//! Extraction helpers for the central API's bulk DICOM metadata catalogue.
//!
//! Grounded in `original_source/dicom_receiver/core/utils/api_integration.py`'s
//! `extract_patients_from_api_data`/`extract_studies_from_api_data`/
//! `extract_series_from_api_data`/`extract_images_from_api_data`: the
//! catalogue nests `results[].dicom_data.studies{studyUID}.series{seriesUID}
//! .instances[]`. These are pure functions over the already-parsed
//! `serde_json::Value` document; de-anonymisation is the caller's job.

use serde_json::Value;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Default)]
pub struct ApiPatient {
    pub patient_id: String,
    pub patient_name: String,
    pub patient_birth_date: String,
    pub patient_sex: String,
}

#[derive(Debug, Clone, Default)]
pub struct ApiStudy {
    pub patient_id: String,
    pub patient_name: String,
    pub study_instance_uid: String,
    pub study_id: String,
    pub study_description: String,
    pub study_date: String,
    pub study_time: String,
    pub accession_number: String,
    pub number_of_series: usize,
    pub number_of_instances: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ApiSeries {
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub series_description: String,
    pub series_number: String,
    pub modality: String,
}

#[derive(Debug, Clone, Default)]
pub struct ApiImage {
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub sop_instance_uid: String,
    pub instance_number: String,
}

fn str_field(v: &Value, key: &str) -> String {
    v.get(key).and_then(|x| x.as_str()).unwrap_or_default().to_string()
}

fn studies<'a>(catalogue: &'a Value) -> impl Iterator<Item = (&'a str, &'a Value)> {
    catalogue
        .get("results")
        .and_then(|r| r.as_array())
        .into_iter()
        .flatten()
        .filter_map(|result| result.get("dicom_data")?.get("studies")?.as_object())
        .flat_map(|studies| studies.iter().map(|(k, v)| (k.as_str(), v)))
}

pub fn result_id_for_study(catalogue: &Value, study_uid: &str) -> Option<String> {
    let results = catalogue.get("results")?.as_array()?;
    for result in results {
        let has_study = result
            .get("dicom_data")
            .and_then(|d| d.get("studies"))
            .and_then(|s| s.as_object())
            .map(|m| m.contains_key(study_uid))
            .unwrap_or(false);
        if has_study {
            return result.get("result")?.get("id").map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        }
    }
    None
}

/// One record per distinct PatientID across the whole catalogue.
pub fn extract_patients(catalogue: &Value) -> Vec<ApiPatient> {
    let mut seen: HashMap<String, ApiPatient> = HashMap::new();
    for (_uid, study) in studies(catalogue) {
        let patient_id = str_field(study, "patient_id");
        if patient_id.is_empty() || seen.contains_key(&patient_id) {
            continue;
        }
        seen.insert(
            patient_id.clone(),
            ApiPatient {
                patient_id,
                patient_name: str_field(study, "patient_name"),
                patient_birth_date: str_field(study, "patient_birth_date"),
                patient_sex: str_field(study, "patient_sex"),
            },
        );
    }
    seen.into_values().collect()
}

/// One record per distinct StudyInstanceUID, optionally filtered to one.
pub fn extract_studies(catalogue: &Value, study_uid_filter: Option<&str>) -> Vec<ApiStudy> {
    let mut seen: HashMap<String, ApiStudy> = HashMap::new();
    for (uid, study) in studies(catalogue) {
        if uid.is_empty() || seen.contains_key(uid) {
            continue;
        }
        if study_uid_filter.map(|f| f != uid).unwrap_or(false) {
            continue;
        }
        let series_map = study.get("series").and_then(|s| s.as_object());
        let number_of_series = series_map.map(|m| m.len()).unwrap_or(0);
        let number_of_instances = series_map
            .map(|m| {
                m.values()
                    .filter_map(|series| series.get("instances")?.as_array())
                    .map(|instances| instances.len())
                    .sum()
            })
            .unwrap_or(0);
        seen.insert(
            uid.to_string(),
            ApiStudy {
                patient_id: str_field(study, "patient_id"),
                patient_name: str_field(study, "patient_name"),
                study_instance_uid: uid.to_string(),
                study_id: str_field(study, "study_id"),
                study_description: str_field(study, "study_description"),
                study_date: str_field(study, "study_date"),
                study_time: str_field(study, "study_time"),
                accession_number: str_field(study, "accession_number"),
                number_of_series,
                number_of_instances,
            },
        );
    }
    seen.into_values().collect()
}

/// Series beneath a specific study, optionally filtered to one series.
pub fn extract_series(
    catalogue: &Value,
    study_uid: &str,
    series_uid_filter: Option<&str>,
) -> Vec<ApiSeries> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for (uid, study) in studies(catalogue) {
        if uid != study_uid {
            continue;
        }
        let Some(series_map) = study.get("series").and_then(|s| s.as_object()) else {
            continue;
        };
        for (series_uid, series) in series_map {
            if series_uid_filter.map(|f| f != series_uid).unwrap_or(false) {
                continue;
            }
            if !seen.insert(series_uid.clone()) {
                continue;
            }
            out.push(ApiSeries {
                study_instance_uid: study_uid.to_string(),
                series_instance_uid: series_uid.clone(),
                series_description: str_field(series, "series_description"),
                series_number: str_field(series, "series_number"),
                modality: str_field(series, "modality"),
            });
        }
    }
    out
}

/// Instances within a specific series.
pub fn extract_images(catalogue: &Value, study_uid: &str, series_uid: &str) -> Vec<ApiImage> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for (uid, study) in studies(catalogue) {
        if uid != study_uid {
            continue;
        }
        let Some(series) = study.get("series").and_then(|s| s.get(series_uid)) else {
            continue;
        };
        let Some(instances) = series.get("instances").and_then(|i| i.as_array()) else {
            continue;
        };
        for instance in instances {
            let sop_uid = str_field(instance, "sop_instance_uid");
            if sop_uid.is_empty() || !seen.insert(sop_uid.clone()) {
                continue;
            }
            out.push(ApiImage {
                study_instance_uid: study_uid.to_string(),
                series_instance_uid: series_uid.to_string(),
                sop_instance_uid: sop_uid,
                instance_number: str_field(instance, "instance_number"),
            });
        }
    }
    out
}

/// Instances across every series of a study, for an IMAGE-level query that
/// omits SeriesInstanceUID.
pub fn extract_images_for_study(catalogue: &Value, study_uid: &str) -> Vec<ApiImage> {
    let mut out = Vec::new();
    for (uid, study) in studies(catalogue) {
        if uid != study_uid {
            continue;
        }
        let Some(series_map) = study.get("series").and_then(|s| s.as_object()) else {
            continue;
        };
        for series_uid in series_map.keys() {
            out.extend(extract_images(catalogue, study_uid, series_uid));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_catalogue() -> Value {
        serde_json::json!({
            "results": [{
                "result": {"id": "42"},
                "dicom_data": {
                    "studies": {
                        "1.2.3": {
                            "patient_id": "PID-A",
                            "patient_name": "sub-001",
                            "study_description": "CHEST",
                            "study_date": "20260101",
                            "series": {
                                "1.2.3.4": {
                                    "modality": "CT",
                                    "series_description": "AXIAL",
                                    "instances": [
                                        {"sop_instance_uid": "1.2.3.4.5", "instance_number": "1"}
                                    ]
                                }
                            }
                        }
                    }
                }
            }]
        })
    }

    #[test]
    fn extracts_one_patient_study_series_image() {
        let catalogue = sample_catalogue();
        assert_eq!(extract_patients(&catalogue).len(), 1);

        let studies = extract_studies(&catalogue, None);
        assert_eq!(studies.len(), 1);
        assert_eq!(studies[0].study_instance_uid, "1.2.3");

        let series = extract_series(&catalogue, "1.2.3", None);
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].modality, "CT");

        let images = extract_images(&catalogue, "1.2.3", "1.2.3.4");
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].sop_instance_uid, "1.2.3.4.5");
    }

    #[test]
    fn result_id_for_study_finds_owning_result() {
        let catalogue = sample_catalogue();
        assert_eq!(result_id_for_study(&catalogue, "1.2.3").as_deref(), Some("42"));
        assert_eq!(result_id_for_study(&catalogue, "9.9.9"), None);
    }
}
