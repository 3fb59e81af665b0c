//! Protocol Service Provider (PSP) wiring: the `dimse` crate's
//! [`QueryProvider`] implementation backing C-STORE/C-FIND/C-GET/C-MOVE.
//!
//! Grounded in `original_source/dicom_receiver/core/handlers/{store_handler,
//! find_handler,get_handler,move_handler}.py` and the
//! `core/query_handlers/*.py` per-level C-FIND responders: PATIENT/STUDY/
//! SERIES/IMAGE queries are answered from the Object Store first, falling
//! back to the central API's metadata catalogue on a miss
//! (`core/utils/api_integration.py`'s `extract_*_from_api_data` family, see
//! [`crate::api_catalogue`]). C-STORE anonymises via the Identity Store
//! before persisting and touches the Quiescence Monitor; C-MOVE destinations
//! are resolved through the Node Manager's registry, falling back to a
//! configured default address (`ae_config.py`'s `get_ae_address`) when no
//! node advertises the requested AE title.

use std::sync::Arc;

use async_trait::async_trait;
use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dimse::config::RemoteNode;
use dimse::error::{DimseError, Result as DimseResult};
use dimse::scp::QueryProvider;
use dimse::types::{DatasetStream, FindQuery, MoveQuery, QueryLevel};
use futures_util::stream::{self, BoxStream, StreamExt};

use crate::api_catalogue::{self, ApiImage, ApiSeries, ApiStudy};
use crate::api_client::ApiClient;
use crate::identity::IdentityStore;
use crate::node_manager::NodeManager;
use crate::quiescence::QuiescenceMonitor;
use crate::storage::ObjectStore;


pub struct GatewayQueryProvider {
    storage: Arc<ObjectStore>,
    identity: Arc<IdentityStore>,
    quiescence: Arc<QuiescenceMonitor>,
    nodes: Arc<NodeManager>,
    api: Option<Arc<ApiClient>>,
    default_ae_host: String,
    default_ae_port: u16,
}

impl GatewayQueryProvider {
    pub fn new(
        storage: Arc<ObjectStore>,
        identity: Arc<IdentityStore>,
        quiescence: Arc<QuiescenceMonitor>,
        nodes: Arc<NodeManager>,
        api: Option<Arc<ApiClient>>,
        default_ae_host: String,
        default_ae_port: u16,
    ) -> Self {
        Self {
            storage,
            identity,
            quiescence,
            nodes,
            api,
            default_ae_host,
            default_ae_port,
        }
    }

    fn find_patients_local(&self) -> DimseResult<Vec<InMemDicomObject>> {
        let patients = self
            .storage
            .all_patients()
            .map_err(|e| DimseError::internal(e.to_string()))?;

        Ok(patients
            .into_iter()
            .map(|p| {
                let mut obj = InMemDicomObject::new_empty();
                obj.put(DataElement::new(
                    tags::QUERY_RETRIEVE_LEVEL,
                    VR::CS,
                    dicom_value!(Str, "PATIENT"),
                ));
                obj.put(DataElement::new(
                    tags::PATIENT_ID,
                    VR::LO,
                    dicom_value!(Str, &p.patient_id),
                ));
                obj.put(DataElement::new(
                    tags::PATIENT_NAME,
                    VR::PN,
                    dicom_value!(Str, p.patient_name.unwrap_or_default()),
                ));
                obj.put(DataElement::new(
                    tags::PATIENT_BIRTH_DATE,
                    VR::DA,
                    dicom_value!(Str, p.patient_birth_date.unwrap_or_default()),
                ));
                obj.put(DataElement::new(
                    tags::PATIENT_SEX,
                    VR::CS,
                    dicom_value!(Str, p.patient_sex.unwrap_or_default()),
                ));
                obj
            })
            .collect())
    }

    fn find_studies_local(&self, study_uid_filter: Option<&str>) -> DimseResult<Vec<InMemDicomObject>> {
        let studies = self
            .storage
            .all_studies()
            .map_err(|e| DimseError::internal(e.to_string()))?;

        Ok(studies
            .into_iter()
            .filter(|s| study_uid_filter.map(|f| f == s.study_instance_uid).unwrap_or(true))
            .map(|s| {
                let display_name = self
                    .identity
                    .anonymised_name_for(&s.study_instance_uid)
                    .unwrap_or_default();
                let mut obj = InMemDicomObject::new_empty();
                obj.put(DataElement::new(
                    tags::QUERY_RETRIEVE_LEVEL,
                    VR::CS,
                    dicom_value!(Str, "STUDY"),
                ));
                obj.put(DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, &s.patient_id)));
                obj.put(DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, display_name)));
                obj.put(DataElement::new(
                    tags::STUDY_INSTANCE_UID,
                    VR::UI,
                    dicom_value!(Str, &s.study_instance_uid),
                ));
                obj.put(DataElement::new(
                    tags::STUDY_DATE,
                    VR::DA,
                    dicom_value!(Str, s.study_date.unwrap_or_default()),
                ));
                obj.put(DataElement::new(
                    tags::STUDY_DESCRIPTION,
                    VR::LO,
                    dicom_value!(Str, s.study_description.unwrap_or_default()),
                ));
                obj.put(DataElement::new(
                    tags::STUDY_ID,
                    VR::SH,
                    dicom_value!(Str, s.study_id.unwrap_or_default()),
                ));
                obj.put(DataElement::new(
                    tags::STUDY_TIME,
                    VR::TM,
                    dicom_value!(Str, s.study_time.unwrap_or_default()),
                ));
                obj.put(DataElement::new(
                    tags::ACCESSION_NUMBER,
                    VR::SH,
                    dicom_value!(Str, s.accession_number.unwrap_or_default()),
                ));
                obj.put(DataElement::new(
                    tags::NUMBER_OF_STUDY_RELATED_SERIES,
                    VR::IS,
                    dicom_value!(Str, s.number_of_series.to_string()),
                ));
                obj.put(DataElement::new(
                    tags::NUMBER_OF_STUDY_RELATED_INSTANCES,
                    VR::IS,
                    dicom_value!(Str, s.number_of_instances.to_string()),
                ));
                obj
            })
            .collect())
    }

    fn find_series_local(
        &self,
        study_uid: &str,
        series_uid_filter: Option<&str>,
    ) -> DimseResult<Vec<InMemDicomObject>> {
        let series = self
            .storage
            .series_for(study_uid)
            .map_err(|e| DimseError::internal(e.to_string()))?;

        Ok(series
            .into_iter()
            .filter(|s| {
                series_uid_filter
                    .map(|f| f == s.series_instance_uid)
                    .unwrap_or(true)
            })
            .map(|s| {
                let mut obj = InMemDicomObject::new_empty();
                obj.put(DataElement::new(
                    tags::QUERY_RETRIEVE_LEVEL,
                    VR::CS,
                    dicom_value!(Str, "SERIES"),
                ));
                obj.put(DataElement::new(
                    tags::STUDY_INSTANCE_UID,
                    VR::UI,
                    dicom_value!(Str, study_uid),
                ));
                obj.put(DataElement::new(
                    tags::SERIES_INSTANCE_UID,
                    VR::UI,
                    dicom_value!(Str, &s.series_instance_uid),
                ));
                obj.put(DataElement::new(
                    tags::MODALITY,
                    VR::CS,
                    dicom_value!(Str, s.modality.unwrap_or_default()),
                ));
                obj.put(DataElement::new(
                    tags::SERIES_DESCRIPTION,
                    VR::LO,
                    dicom_value!(Str, s.series_description.unwrap_or_default()),
                ));
                obj.put(DataElement::new(
                    tags::SERIES_NUMBER,
                    VR::IS,
                    dicom_value!(Str, s.series_number.unwrap_or_default()),
                ));
                obj.put(DataElement::new(
                    tags::SERIES_DATE,
                    VR::DA,
                    dicom_value!(Str, s.series_date.unwrap_or_default()),
                ));
                obj.put(DataElement::new(
                    tags::SERIES_TIME,
                    VR::TM,
                    dicom_value!(Str, s.series_time.unwrap_or_default()),
                ));
                obj.put(DataElement::new(
                    tags::NUMBER_OF_SERIES_RELATED_INSTANCES,
                    VR::IS,
                    dicom_value!(Str, s.instance_count.to_string()),
                ));
                obj
            })
            .collect())
    }

    /// Instances at IMAGE level. `series_uid` absent means the query is
    /// study-wide (all series of the study), per the IMAGE-level contract.
    fn find_images_local(
        &self,
        study_uid: &str,
        series_uid: Option<&str>,
    ) -> DimseResult<Vec<InMemDicomObject>> {
        let images = match series_uid {
            Some(series_uid) => self.storage.images_for(series_uid),
            None => self.storage.images_for_study(study_uid),
        }
        .map_err(|e| DimseError::internal(e.to_string()))?;

        Ok(images
            .into_iter()
            .map(|i| {
                let mut obj = InMemDicomObject::new_empty();
                obj.put(DataElement::new(
                    tags::QUERY_RETRIEVE_LEVEL,
                    VR::CS,
                    dicom_value!(Str, "IMAGE"),
                ));
                obj.put(DataElement::new(
                    tags::STUDY_INSTANCE_UID,
                    VR::UI,
                    dicom_value!(Str, study_uid),
                ));
                obj.put(DataElement::new(
                    tags::SERIES_INSTANCE_UID,
                    VR::UI,
                    dicom_value!(Str, &i.series_instance_uid),
                ));
                obj.put(DataElement::new(
                    tags::SOP_INSTANCE_UID,
                    VR::UI,
                    dicom_value!(Str, &i.sop_instance_uid),
                ));
                obj.put(DataElement::new(
                    tags::SOP_CLASS_UID,
                    VR::UI,
                    dicom_value!(Str, i.sop_class_uid.unwrap_or_default()),
                ));
                obj.put(DataElement::new(
                    tags::INSTANCE_NUMBER,
                    VR::IS,
                    dicom_value!(Str, i.instance_number.unwrap_or_default()),
                ));
                obj
            })
            .collect())
    }

    /// De-anonymise a PatientName pulled from the API catalogue: the
    /// catalogue holds whatever this gateway itself anonymised and uploaded,
    /// so a successful reverse lookup recovers the original; an unmapped
    /// name (e.g. a study this instance never anonymised) passes through
    /// unchanged, matching `get_original_patient_name`'s behaviour.
    fn deanon_name(&self, anon_name: &str) -> String {
        self.identity
            .reverse_name_lookup(anon_name)
            .unwrap_or_else(|| anon_name.to_string())
    }

    async fn query_catalogue(&self) -> Option<serde_json::Value> {
        let api = self.api.as_ref()?;
        match api.query_all_dicom_metadata().await {
            Ok(doc) => Some(doc),
            Err(e) => {
                tracing::warn!(error = %e, "API metadata fallback failed, treating as empty");
                None
            }
        }
    }

    fn study_to_dicom(&self, s: ApiStudy) -> InMemDicomObject {
        let display_name = self.deanon_name(&s.patient_name);
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(tags::QUERY_RETRIEVE_LEVEL, VR::CS, dicom_value!(Str, "STUDY")));
        obj.put(DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, s.patient_id)));
        obj.put(DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, display_name)));
        obj.put(DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, s.study_instance_uid),
        ));
        obj.put(DataElement::new(tags::STUDY_DATE, VR::DA, dicom_value!(Str, s.study_date)));
        obj.put(DataElement::new(
            tags::STUDY_DESCRIPTION,
            VR::LO,
            dicom_value!(Str, s.study_description),
        ));
        obj.put(DataElement::new(tags::STUDY_ID, VR::SH, dicom_value!(Str, s.study_id)));
        obj.put(DataElement::new(tags::STUDY_TIME, VR::TM, dicom_value!(Str, s.study_time)));
        obj.put(DataElement::new(
            tags::ACCESSION_NUMBER,
            VR::SH,
            dicom_value!(Str, s.accession_number),
        ));
        obj.put(DataElement::new(
            tags::NUMBER_OF_STUDY_RELATED_SERIES,
            VR::IS,
            dicom_value!(Str, s.number_of_series.to_string()),
        ));
        obj.put(DataElement::new(
            tags::NUMBER_OF_STUDY_RELATED_INSTANCES,
            VR::IS,
            dicom_value!(Str, s.number_of_instances.to_string()),
        ));
        obj
    }

    fn series_to_dicom(&self, s: ApiSeries) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(tags::QUERY_RETRIEVE_LEVEL, VR::CS, dicom_value!(Str, "SERIES")));
        obj.put(DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, s.study_instance_uid),
        ));
        obj.put(DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, s.series_instance_uid),
        ));
        obj.put(DataElement::new(tags::MODALITY, VR::CS, dicom_value!(Str, s.modality)));
        obj.put(DataElement::new(
            tags::SERIES_DESCRIPTION,
            VR::LO,
            dicom_value!(Str, s.series_description),
        ));
        obj.put(DataElement::new(tags::SERIES_NUMBER, VR::IS, dicom_value!(Str, s.series_number)));
        obj
    }

    fn image_to_dicom(&self, i: ApiImage) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(tags::QUERY_RETRIEVE_LEVEL, VR::CS, dicom_value!(Str, "IMAGE")));
        obj.put(DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, i.study_instance_uid),
        ));
        obj.put(DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, i.series_instance_uid),
        ));
        obj.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, i.sop_instance_uid),
        ));
        obj.put(DataElement::new(
            tags::INSTANCE_NUMBER,
            VR::IS,
            dicom_value!(Str, i.instance_number),
        ));
        obj
    }

    async fn find_patients(&self) -> DimseResult<Vec<InMemDicomObject>> {
        let local = self.find_patients_local()?;
        if !local.is_empty() {
            return Ok(local);
        }
        let Some(catalogue) = self.query_catalogue().await else {
            return Ok(Vec::new());
        };
        Ok(api_catalogue::extract_patients(&catalogue)
            .into_iter()
            .map(|p| {
                let display_name = self.deanon_name(&p.patient_name);
                let mut obj = InMemDicomObject::new_empty();
                obj.put(DataElement::new(
                    tags::QUERY_RETRIEVE_LEVEL,
                    VR::CS,
                    dicom_value!(Str, "PATIENT"),
                ));
                obj.put(DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, p.patient_id)));
                obj.put(DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, display_name)));
                obj
            })
            .collect())
    }

    async fn find_studies(&self, study_uid_filter: Option<&str>) -> DimseResult<Vec<InMemDicomObject>> {
        let local = self.find_studies_local(study_uid_filter)?;
        if !local.is_empty() {
            return Ok(local);
        }
        let Some(catalogue) = self.query_catalogue().await else {
            return Ok(Vec::new());
        };
        Ok(api_catalogue::extract_studies(&catalogue, study_uid_filter)
            .into_iter()
            .map(|s| self.study_to_dicom(s))
            .collect())
    }

    async fn find_series(
        &self,
        study_uid: &str,
        series_uid_filter: Option<&str>,
    ) -> DimseResult<Vec<InMemDicomObject>> {
        let local = self.find_series_local(study_uid, series_uid_filter)?;
        if !local.is_empty() {
            return Ok(local);
        }
        let Some(catalogue) = self.query_catalogue().await else {
            return Ok(Vec::new());
        };
        Ok(api_catalogue::extract_series(&catalogue, study_uid, series_uid_filter)
            .into_iter()
            .map(|s| self.series_to_dicom(s))
            .collect())
    }

    async fn find_images(
        &self,
        study_uid: &str,
        series_uid: Option<&str>,
    ) -> DimseResult<Vec<InMemDicomObject>> {
        let local = self.find_images_local(study_uid, series_uid)?;
        if !local.is_empty() {
            return Ok(local);
        }
        let Some(catalogue) = self.query_catalogue().await else {
            return Ok(Vec::new());
        };
        let images = match series_uid {
            Some(series_uid) => api_catalogue::extract_images(&catalogue, study_uid, series_uid),
            None => api_catalogue::extract_images_for_study(&catalogue, study_uid),
        };
        Ok(images.into_iter().map(|i| self.image_to_dicom(i)).collect())
    }

    async fn locate_for_level(&self, query: &MoveQuery) -> DimseResult<Vec<InMemDicomObject>> {
        let study_uid = query.parameters.get("StudyInstanceUID").cloned();
        let series_uid = query.parameters.get("SeriesInstanceUID").cloned();
        let sop_uid = query.parameters.get("SOPInstanceUID").cloned();

        match query.query_level {
            QueryLevel::Study => {
                let study_uid = study_uid.ok_or_else(|| {
                    DimseError::operation_failed("C-MOVE/C-GET at STUDY level requires StudyInstanceUID")
                })?;
                self.load_objects_for_study(&study_uid).await
            }
            QueryLevel::Series => {
                let study_uid = study_uid.ok_or_else(|| {
                    DimseError::operation_failed("C-MOVE/C-GET at SERIES level requires StudyInstanceUID")
                })?;
                let series_uid = series_uid.ok_or_else(|| {
                    DimseError::operation_failed("C-MOVE/C-GET at SERIES level requires SeriesInstanceUID")
                })?;
                self.load_objects_for_series(&study_uid, &series_uid).await
            }
            QueryLevel::Image => {
                let study_uid = study_uid.ok_or_else(|| {
                    DimseError::operation_failed("C-MOVE/C-GET at IMAGE level requires StudyInstanceUID")
                })?;
                let series_uid = series_uid.ok_or_else(|| {
                    DimseError::operation_failed("C-MOVE/C-GET at IMAGE level requires SeriesInstanceUID")
                })?;
                let sop_uid = sop_uid.ok_or_else(|| {
                    DimseError::operation_failed("C-MOVE/C-GET at IMAGE level requires SOPInstanceUID")
                })?;
                let requested_sops: Vec<&str> = sop_uid.split('\\').collect();
                let objects = self.load_objects_for_series(&study_uid, &series_uid).await?;
                Ok(objects
                    .into_iter()
                    .filter(|o| {
                        o.element(tags::SOP_INSTANCE_UID)
                            .ok()
                            .and_then(|e| e.to_str().ok())
                            .map(|v| requested_sops.contains(&v.as_ref()))
                            .unwrap_or(false)
                    })
                    .collect())
            }
            QueryLevel::Patient => Err(DimseError::operation_failed(
                "C-MOVE/C-GET at PATIENT level is not supported",
            )),
        }
    }

    async fn load_objects_for_study(&self, study_uid: &str) -> DimseResult<Vec<InMemDicomObject>> {
        let files = self
            .storage
            .files_for_study(study_uid)
            .map_err(|e| DimseError::internal(e.to_string()))?;
        if !files.is_empty() {
            return self.load_and_restore(files);
        }
        self.load_objects_for_study_from_api(study_uid, None, None).await
    }

    async fn load_objects_for_series(
        &self,
        study_uid: &str,
        series_uid: &str,
    ) -> DimseResult<Vec<InMemDicomObject>> {
        if let Ok(series_dir) = self.storage.resolve_series(series_uid) {
            let files = ObjectStore::scan_files(&series_dir.join("scans"));
            if !files.is_empty() {
                return self.load_and_restore(files);
            }
        }
        self.load_objects_for_series_from_api(study_uid, series_uid, None).await
    }

    fn load_and_restore(&self, files: Vec<std::path::PathBuf>) -> DimseResult<Vec<InMemDicomObject>> {
        let mut out = Vec::with_capacity(files.len());
        for path in files {
            let file_obj = dicom_object::open_file(&path)
                .map_err(|e| DimseError::DicomObject(e.to_string()))?;
            let mut obj: InMemDicomObject = (*file_obj).clone();
            self.identity
                .restore(&mut obj)
                .map_err(|e| DimseError::internal(e.to_string()))?;
            out.push(obj);
        }
        Ok(out)
    }

    /// Download a study's instances from the API, de-anonymising each one.
    /// Logs and returns an empty result on any API failure so the caller
    /// always terminates the DICOM exchange with Success rather than hang.
    async fn load_objects_for_study_from_api(
        &self,
        study_uid: &str,
        series_filter: Option<&str>,
        instance_filter: Option<&str>,
    ) -> DimseResult<Vec<InMemDicomObject>> {
        let Some(api) = self.api.clone() else {
            return Ok(Vec::new());
        };
        let result_id = match api.result_id_for_study(study_uid).await {
            Ok(Some(id)) => id,
            Ok(None) => return Ok(Vec::new()),
            Err(e) => {
                tracing::warn!(error = %e, study_uid, "API result lookup failed, treating as empty");
                return Ok(Vec::new());
            }
        };
        let blobs = match api
            .download_study(&result_id, study_uid, series_filter, instance_filter)
            .await
        {
            Ok(blobs) => blobs,
            Err(e) => {
                tracing::warn!(error = %e, study_uid, "API study download failed, treating as empty");
                return Ok(Vec::new());
            }
        };
        self.bytes_to_restored_objects(blobs)
    }

    async fn load_objects_for_series_from_api(
        &self,
        study_uid: &str,
        series_uid: &str,
        instance_filter: Option<&str>,
    ) -> DimseResult<Vec<InMemDicomObject>> {
        let Some(api) = self.api.clone() else {
            return Ok(Vec::new());
        };
        let result_id = match api.result_id_for_study(study_uid).await {
            Ok(Some(id)) => id,
            Ok(None) => return Ok(Vec::new()),
            Err(e) => {
                tracing::warn!(error = %e, study_uid, "API result lookup failed, treating as empty");
                return Ok(Vec::new());
            }
        };
        let blobs = match api
            .download_series(&result_id, study_uid, series_uid, instance_filter)
            .await
        {
            Ok(blobs) => blobs,
            Err(e) => {
                tracing::warn!(error = %e, series_uid, "API series download failed, treating as empty");
                return Ok(Vec::new());
            }
        };
        self.bytes_to_restored_objects(blobs)
    }

    fn bytes_to_restored_objects(&self, blobs: Vec<Vec<u8>>) -> DimseResult<Vec<InMemDicomObject>> {
        let mut out = Vec::with_capacity(blobs.len());
        for bytes in blobs {
            let mut obj = match dicom_object::from_reader(bytes.as_slice()) {
                Ok(obj) => obj,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable instance from API download");
                    continue;
                }
            };
            self.identity
                .restore(&mut obj)
                .map_err(|e| DimseError::internal(e.to_string()))?;
            out.push(obj);
        }
        Ok(out)
    }
}

#[async_trait]
impl QueryProvider for GatewayQueryProvider {
    async fn find(&self, query: FindQuery) -> DimseResult<BoxStream<'static, DimseResult<InMemDicomObject>>> {
        let results = match query.query_level {
            QueryLevel::Patient => self.find_patients().await?,
            QueryLevel::Study => {
                self.find_studies(query.parameters.get("StudyInstanceUID").map(|s| s.as_str()))
                    .await?
            }
            QueryLevel::Series => {
                let study_uid = query.parameters.get("StudyInstanceUID").ok_or_else(|| {
                    DimseError::operation_failed("SERIES level C-FIND requires StudyInstanceUID")
                })?;
                self.find_series(study_uid, query.parameters.get("SeriesInstanceUID").map(|s| s.as_str()))
                    .await?
            }
            QueryLevel::Image => {
                // A missing StudyInstanceUID yields Success with no matches rather
                // than a failure status; a missing SeriesInstanceUID searches
                // across every series of the study.
                match query.parameters.get("StudyInstanceUID") {
                    Some(study_uid) => {
                        self.find_images(
                            study_uid,
                            query.parameters.get("SeriesInstanceUID").map(|s| s.as_str()),
                        )
                        .await?
                    }
                    None => Vec::new(),
                }
            }
        };

        Ok(stream::iter(results.into_iter().map(Ok)).boxed())
    }

    async fn locate(&self, query: MoveQuery) -> DimseResult<BoxStream<'static, DimseResult<InMemDicomObject>>> {
        let results = self.locate_for_level(&query).await?;
        Ok(stream::iter(results.into_iter().map(Ok)).boxed())
    }

    async fn store(&self, dataset: DatasetStream) -> DimseResult<()> {
        let mut object = dataset.to_object().await?;

        let study_uid = object
            .element_by_name("StudyInstanceUID")
            .map_err(|e| DimseError::DicomObject(e.to_string()))?
            .to_str()
            .map_err(|e| DimseError::DicomObject(e.to_string()))?
            .into_owned();
        let series_uid = object
            .element_by_name("SeriesInstanceUID")
            .map_err(|e| DimseError::DicomObject(e.to_string()))?
            .to_str()
            .map_err(|e| DimseError::DicomObject(e.to_string()))?
            .into_owned();
        let sop_class_uid = object
            .element_by_name("SOPClassUID")
            .map_err(|e| DimseError::DicomObject(e.to_string()))?
            .to_str()
            .map_err(|e| DimseError::DicomObject(e.to_string()))?
            .into_owned();
        let sop_uid = object
            .element_by_name("SOPInstanceUID")
            .map_err(|e| DimseError::DicomObject(e.to_string()))?
            .to_str()
            .map_err(|e| DimseError::DicomObject(e.to_string()))?
            .into_owned();

        self.identity
            .anonymise(&mut object)
            .map_err(|e| DimseError::internal(e.to_string()))?;

        let path = self
            .storage
            .path_for(&study_uid, &series_uid, &sop_uid, Some(&object))
            .map_err(|e| DimseError::internal(e.to_string()))?;

        let transfer_syntax = dataset
            .metadata()
            .transfer_syntax
            .clone()
            .unwrap_or_else(|| dicom_dictionary_std::uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string());
        let file_meta = dicom_object::FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(sop_class_uid.as_str())
            .media_storage_sop_instance_uid(sop_uid.as_str())
            .transfer_syntax(&transfer_syntax)
            .build()
            .map_err(|e| DimseError::DicomObject(e.to_string()))?;
        let file_object = object.with_exact_meta(file_meta);

        file_object
            .write_to_file(&path)
            .map_err(|e| DimseError::DicomObject(e.to_string()))?;

        self.quiescence.touch(&study_uid).await;

        tracing::info!(study_uid = %study_uid, series_uid = %series_uid, sop_uid = %sop_uid, path = %path.display(), "stored instance");
        Ok(())
    }

    async fn resolve_destination(&self, ae_title: &str) -> DimseResult<RemoteNode> {
        let nodes = self.nodes.list_nodes();
        if let Some(node) = nodes.values().find(|n| n.aet == ae_title) {
            return Ok(RemoteNode {
                ae_title: node.aet.clone(),
                host: node.ip.clone(),
                port: node.port,
                use_tls: false,
                connect_timeout_ms: None,
                max_pdu: None,
            });
        }

        tracing::warn!(
            ae_title,
            host = %self.default_ae_host,
            port = self.default_ae_port,
            "no configured node for AE title, using default fallback address"
        );
        Ok(RemoteNode {
            ae_title: ae_title.to_string(),
            host: self.default_ae_host.clone(),
            port: self.default_ae_port,
            use_tls: false,
            connect_timeout_ms: None,
            max_pdu: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_dictionary_std::uids;
    use tempfile::tempdir;

    fn sample_instance(study_uid: &str, series_uid: &str, sop_uid: &str, patient_name: &str) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, dicom_value!(Str, study_uid)));
        obj.put(DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, dicom_value!(Str, series_uid)));
        obj.put(DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, sop_uid)));
        obj.put(DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, uids::CT_IMAGE_STORAGE),
        ));
        obj.put(DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, "PID-1")));
        obj.put(DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, patient_name)));
        obj
    }

    fn build_provider(dir: &std::path::Path) -> GatewayQueryProvider {
        let storage = Arc::new(ObjectStore::new(dir.join("storage")));
        let identity = Arc::new(IdentityStore::load(dir.join("map.json"), vec![]).unwrap());
        let quiescence = QuiescenceMonitor::new(60);
        let nodes = Arc::new(NodeManager::load(dir.join("nodes.json"), dir.join("ledger.json")).unwrap());
        GatewayQueryProvider::new(
            storage,
            identity,
            quiescence,
            nodes,
            None,
            "0.0.0.0".to_string(),
            104,
        )
    }

    #[tokio::test]
    async fn store_anonymises_touches_quiescence_and_persists_to_deterministic_path() {
        let dir = tempdir().unwrap();
        let provider = build_provider(dir.path());

        let object = sample_instance("1.1.1", "1.1.1.1", "1.1.1.1.1", "DOE^JOHN");
        provider.store(DatasetStream::from_object(object)).await.unwrap();

        let actual_dir = provider.storage.resolve_study("1.1.1").unwrap();
        assert!(actual_dir.ends_with("PID-1/1.1.1"));

        let stored_path = actual_dir.join("1.1.1.1").join("scans").join("1.1.1.1.1.dcm");
        assert!(stored_path.is_file());

        let stored = dicom_object::open_file(&stored_path).unwrap();
        let name: String = stored.element_by_name("PatientName").unwrap().to_str().unwrap().into_owned();
        assert_eq!(name, "sub-001");
    }

    #[tokio::test]
    async fn store_is_idempotent_for_a_resent_instance() {
        let dir = tempdir().unwrap();
        let provider = build_provider(dir.path());

        for _ in 0..2 {
            let object = sample_instance("2.2.2", "2.2.2.2", "2.2.2.2.2", "ROE^JANE");
            provider.store(DatasetStream::from_object(object)).await.unwrap();
        }

        let files = provider.storage.files_for_study("2.2.2").unwrap();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn locate_for_level_resolves_study_series_and_image_scoped_queries() {
        let dir = tempdir().unwrap();
        let provider = build_provider(dir.path());

        let object = sample_instance("3.3.3", "3.3.3.3", "3.3.3.3.3", "POE^PAUL");
        provider.store(DatasetStream::from_object(object)).await.unwrap();

        let study_query = MoveQuery::new(QueryLevel::Study, "DEST")
            .with_parameter("StudyInstanceUID", "3.3.3");
        let found = provider.locate_for_level(&study_query).await.unwrap();
        assert_eq!(found.len(), 1);

        let series_query = MoveQuery::new(QueryLevel::Series, "DEST")
            .with_parameter("StudyInstanceUID", "3.3.3")
            .with_parameter("SeriesInstanceUID", "3.3.3.3");
        let found = provider.locate_for_level(&series_query).await.unwrap();
        assert_eq!(found.len(), 1);

        let image_query = MoveQuery::new(QueryLevel::Image, "DEST")
            .with_parameter("StudyInstanceUID", "3.3.3")
            .with_parameter("SeriesInstanceUID", "3.3.3.3")
            .with_parameter("SOPInstanceUID", "3.3.3.3.3");
        let found = provider.locate_for_level(&image_query).await.unwrap();
        assert_eq!(found.len(), 1);

        let miss_query = MoveQuery::new(QueryLevel::Image, "DEST")
            .with_parameter("StudyInstanceUID", "3.3.3")
            .with_parameter("SeriesInstanceUID", "3.3.3.3")
            .with_parameter("SOPInstanceUID", "not-there");
        let found = provider.locate_for_level(&miss_query).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn locate_for_level_is_empty_with_no_local_data_and_no_api_client() {
        let dir = tempdir().unwrap();
        let provider = build_provider(dir.path());

        let query = MoveQuery::new(QueryLevel::Study, "DEST").with_parameter("StudyInstanceUID", "9.9.9");
        let found = provider.locate_for_level(&query).await.unwrap();
        assert!(found.is_empty(), "an empty locate result is what drives the MOVE 0xA701 refusal path");
    }

    #[tokio::test]
    async fn locate_for_level_rejects_patient_level_and_missing_required_uids() {
        let dir = tempdir().unwrap();
        let provider = build_provider(dir.path());

        let patient_query = MoveQuery::new(QueryLevel::Patient, "DEST");
        assert!(provider.locate_for_level(&patient_query).await.is_err());

        let missing_study = MoveQuery::new(QueryLevel::Study, "DEST");
        assert!(provider.locate_for_level(&missing_study).await.is_err());
    }

    #[tokio::test]
    async fn resolve_destination_falls_back_to_default_address_for_unknown_ae() {
        let dir = tempdir().unwrap();
        let provider = build_provider(dir.path());

        let dest = provider.resolve_destination("VIEWER").await.unwrap();
        assert_eq!(dest.ae_title, "VIEWER");
        assert_eq!(dest.host, "0.0.0.0");
        assert_eq!(dest.port, 104);
    }
}
