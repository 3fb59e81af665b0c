//! DICOM Upper Layer service provider (SCP)
//!
//! Accepts associations, negotiates presentation contexts for verification,
//! storage and query/retrieve, and dispatches incoming DIMSE commands
//! (C-ECHO, C-STORE, C-FIND, C-GET, C-MOVE) to a [`QueryProvider`] supplied
//! by the caller. The wire-level association loop follows the same
//! PDU-buffering shape used throughout the dicom-rs ecosystem: commands
//! always travel in Implicit VR Little Endian, data sets travel in whatever
//! transfer syntax was negotiated for their presentation context.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::{
    association::ServerAssociationOptions,
    pdu::{PDataValue, PDataValueType},
    Pdu, ServerAssociation,
};
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DimseConfig, RemoteNode};
use crate::error::{DimseError, Result};
use crate::scu::DimseScu;
use crate::types::{DatasetStream, FindQuery, MovePriority, MoveQuery, QueryLevel};

const C_STORE_RQ: u16 = 0x0001;
const C_STORE_RSP: u16 = 0x8001;
const C_GET_RQ: u16 = 0x0010;
const C_GET_RSP: u16 = 0x8010;
const C_FIND_RQ: u16 = 0x0020;
const C_FIND_RSP: u16 = 0x8020;
const C_MOVE_RQ: u16 = 0x0021;
const C_MOVE_RSP: u16 = 0x8021;
const C_ECHO_RQ: u16 = 0x0030;
const C_ECHO_RSP: u16 = 0x8030;

const STATUS_SUCCESS: u16 = 0x0000;
const STATUS_PENDING: u16 = 0xFF00;
const STATUS_PROCESSING_FAILURE: u16 = 0x0110;
const STATUS_SUB_OPERATIONS_WARNING: u16 = 0xB000;
const STATUS_MOVE_REFUSED: u16 = 0xA701;
const STATUS_UNABLE_TO_PROCESS: u16 = 0xC000;

/// Storage SOP classes advertised on every association, so that C-STORE,
/// and the storage sub-operations of C-GET, have a presentation context to
/// use regardless of which modality or archive is on the other end.
#[allow(deprecated)]
pub static STORAGE_SOP_CLASSES: &[&str] = &[
    uids::CT_IMAGE_STORAGE,
    uids::ENHANCED_CT_IMAGE_STORAGE,
    uids::MR_IMAGE_STORAGE,
    uids::ENHANCED_MR_IMAGE_STORAGE,
    uids::MR_SPECTROSCOPY_STORAGE,
    uids::SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::COMPUTED_RADIOGRAPHY_IMAGE_STORAGE,
    uids::DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
    uids::DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PROCESSING,
    uids::ENCAPSULATED_PDF_STORAGE,
    uids::GRAYSCALE_SOFTCOPY_PRESENTATION_STATE_STORAGE,
    uids::POSITRON_EMISSION_TOMOGRAPHY_IMAGE_STORAGE,
    uids::NUCLEAR_MEDICINE_IMAGE_STORAGE,
    uids::ULTRASOUND_MULTI_FRAME_IMAGE_STORAGE,
    uids::ULTRASOUND_IMAGE_STORAGE_RETIRED,
    uids::RT_IMAGE_STORAGE,
    uids::BASIC_TEXT_SR_STORAGE,
    uids::ENHANCED_SR_STORAGE,
    uids::COMPREHENSIVE_SR_STORAGE,
];

/// Supplies the data an SCP needs to answer queries and retrievals.
///
/// Implementors own the actual archive (the Object Store, in this gateway);
/// the SCP only knows how to speak DIMSE.
#[async_trait]
pub trait QueryProvider: Send + Sync {
    /// Runs a C-FIND query and streams matching identifiers back.
    async fn find(&self, query: FindQuery) -> Result<BoxStream<'static, Result<InMemDicomObject>>>;

    /// Locates the instances a C-GET or C-MOVE request refers to.
    async fn locate(&self, query: MoveQuery) -> Result<BoxStream<'static, Result<InMemDicomObject>>>;

    /// Persists an instance received via C-STORE.
    async fn store(&self, dataset: DatasetStream) -> Result<()>;

    /// Resolves a C-MOVE destination AE title to a network address.
    async fn resolve_destination(&self, ae_title: &str) -> Result<RemoteNode>;
}

/// A test-only provider with empty results, used where a real archive isn't needed.
pub struct DefaultQueryProvider {
    storage_dir: std::path::PathBuf,
}

impl DefaultQueryProvider {
    pub fn new(storage_dir: std::path::PathBuf) -> Self {
        Self { storage_dir }
    }
}

#[async_trait]
impl QueryProvider for DefaultQueryProvider {
    async fn find(&self, _query: FindQuery) -> Result<BoxStream<'static, Result<InMemDicomObject>>> {
        warn!("DefaultQueryProvider::find called - no backing archive configured");
        Ok(futures::stream::empty().boxed())
    }

    async fn locate(&self, _query: MoveQuery) -> Result<BoxStream<'static, Result<InMemDicomObject>>> {
        warn!("DefaultQueryProvider::locate called - no backing archive configured");
        Ok(futures::stream::empty().boxed())
    }

    async fn store(&self, dataset: DatasetStream) -> Result<()> {
        dataset.to_temp_file(&self.storage_dir).await?;
        Ok(())
    }

    async fn resolve_destination(&self, ae_title: &str) -> Result<RemoteNode> {
        Err(DimseError::NotFound(format!("unknown destination AE title: {}", ae_title)))
    }
}

/// A pending DIMSE request whose command has been fully read but whose
/// data set, if any, is still being accumulated.
enum PendingCommand {
    Echo {
        message_id: u16,
        sop_class_uid: String,
        pc_id: u8,
    },
    Store {
        message_id: u16,
        sop_class_uid: String,
        sop_instance_uid: String,
        pc_id: u8,
    },
    Find {
        message_id: u16,
        sop_class_uid: String,
        pc_id: u8,
    },
    Get {
        message_id: u16,
        sop_class_uid: String,
        pc_id: u8,
    },
    Move {
        message_id: u16,
        sop_class_uid: String,
        pc_id: u8,
        destination_aet: String,
    },
}

/// The DICOM Upper Layer service provider.
///
/// Owns the listening socket and the query provider used to answer every
/// incoming association. One `DimseScp` backs the gateway's entire inbound
/// DIMSE surface: C-ECHO, C-STORE, C-FIND, C-GET and C-MOVE all arrive
/// through the same port and the same association loop, exactly as a real
/// PACS node exposes them.
pub struct DimseScp {
    config: DimseConfig,
    query_provider: Arc<dyn QueryProvider>,
    active_associations: Arc<RwLock<u32>>,
}

impl DimseScp {
    pub fn new(config: DimseConfig, query_provider: Arc<dyn QueryProvider>) -> Self {
        Self {
            config,
            query_provider,
            active_associations: Arc::new(RwLock::new(0)),
        }
    }

    /// Current number of associations being served.
    pub async fn active_associations(&self) -> u32 {
        *self.active_associations.read().await
    }

    /// Binds the listener and serves associations until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.config.validate()?;

        let listener = TcpListener::bind((self.config.bind_addr, self.config.port)).await?;
        info!(
            aet = %self.config.local_aet,
            addr = %self.config.bind_addr,
            port = self.config.port,
            "DIMSE SCP listening"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("DIMSE SCP shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;

                    if *self.active_associations.read().await >= self.config.max_associations {
                        warn!(%peer, "rejecting association: max_associations reached");
                        drop(stream);
                        continue;
                    }

                    let config = self.config.clone();
                    let query_provider = Arc::clone(&self.query_provider);
                    let active_associations = Arc::clone(&self.active_associations);

                    tokio::spawn(async move {
                        {
                            let mut count = active_associations.write().await;
                            *count += 1;
                        }
                        if let Err(e) = run_association(stream, peer, &config, query_provider).await {
                            warn!(%peer, error = %e, "association ended with error");
                        }
                        {
                            let mut count = active_associations.write().await;
                            *count = count.saturating_sub(1);
                        }
                    });
                }
            }
        }
    }
}

async fn run_association(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    config: &DimseConfig,
    query_provider: Arc<dyn QueryProvider>,
) -> Result<()> {
    let mut options = ServerAssociationOptions::new()
        .ae_title(&config.local_aet)
        .strict(config.strict)
        .max_pdu_length(config.max_pdu)
        .promiscuous(config.promiscuous);

    if config.promiscuous {
        options = options.accept_any();
    }

    for ts in TransferSyntaxRegistry.iter() {
        if !ts.is_unsupported() {
            options = options.with_transfer_syntax(ts.uid());
        }
    }

    options = options.with_abstract_syntax(uids::VERIFICATION);
    if config.enable_find {
        options = options.with_abstract_syntax(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND);
    }
    if config.enable_get {
        options = options.with_abstract_syntax(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET);
    }
    if config.enable_move {
        options = options.with_abstract_syntax(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE);
    }
    for uid in STORAGE_SOP_CLASSES {
        options = options.with_abstract_syntax(*uid);
    }

    let mut association = options
        .establish_async(stream)
        .await
        .map_err(|e| DimseError::AssociationRejected(e.to_string()))?;

    info!(peer = %peer, calling_ae = %association.client_ae_title(), "association established");
    debug!(pcs = ?association.presentation_contexts(), "negotiated presentation contexts");

    let mut command_buffer: Vec<u8> = Vec::with_capacity(256);
    let mut data_buffer: Vec<u8> = Vec::with_capacity(1024 * 1024);
    let mut pending: Option<PendingCommand> = None;

    loop {
        match association.receive().await {
            Ok(Pdu::PData { data }) => {
                for value in data {
                    match value.value_type {
                        PDataValueType::Command => {
                            command_buffer.extend_from_slice(&value.data);
                            if value.is_last {
                                let cmd_obj = read_implicit_vr(&command_buffer)?;
                                command_buffer.clear();

                                let has_dataset = cmd_obj
                                    .element(tags::COMMAND_DATA_SET_TYPE)
                                    .ok()
                                    .and_then(|e| e.to_int::<u16>().ok())
                                    .map(|v| v != 0x0101)
                                    .unwrap_or(false);

                                let command = parse_pending_command(&cmd_obj, value.presentation_context_id)?;

                                if has_dataset {
                                    pending = Some(command);
                                } else {
                                    dispatch(&mut association, &query_provider, config, command, None).await?;
                                }
                            }
                        }
                        PDataValueType::Data => {
                            data_buffer.extend_from_slice(&value.data);
                            if value.is_last {
                                if let Some(command) = pending.take() {
                                    let pc = association
                                        .presentation_contexts()
                                        .iter()
                                        .find(|pc| pc.id == value.presentation_context_id)
                                        .ok_or_else(|| DimseError::operation_failed("missing presentation context"))?;
                                    let ts = TransferSyntaxRegistry
                                        .get(&pc.transfer_syntax)
                                        .ok_or_else(|| DimseError::operation_failed("unsupported transfer syntax"))?;
                                    let dataset = InMemDicomObject::read_dataset_with_ts(
                                        data_buffer.as_slice(),
                                        ts,
                                    )
                                    .map_err(|e| DimseError::DicomParsing(e.to_string()))?;
                                    data_buffer.clear();
                                    dispatch(&mut association, &query_provider, config, command, Some(dataset)).await?;
                                } else {
                                    data_buffer.clear();
                                }
                            }
                        }
                    }
                }
            }
            Ok(Pdu::ReleaseRQ) => {
                if let Err(e) = association.send(&Pdu::ReleaseRP).await {
                    warn!("failed to send release response: {}", e);
                }
                info!(calling_ae = %association.client_ae_title(), "association released");
                break;
            }
            Ok(Pdu::AbortRQ { source }) => {
                warn!(?source, "association aborted by peer");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                debug!("association receive ended: {}", err);
                break;
            }
        }
    }

    Ok(())
}

fn read_implicit_vr(bytes: &[u8]) -> Result<InMemDicomObject> {
    let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    InMemDicomObject::read_dataset_with_ts(bytes, &ts)
        .map_err(|e| DimseError::DicomParsing(e.to_string()))
}

fn trimmed(s: &str) -> String {
    s.trim_end_matches('\0').trim().to_string()
}

fn parse_pending_command(cmd_obj: &InMemDicomObject, pc_id: u8) -> Result<PendingCommand> {
    let command_field = cmd_obj
        .element(tags::COMMAND_FIELD)
        .map_err(|e| DimseError::DicomParsing(e.to_string()))?
        .to_int::<u16>()
        .map_err(|e| DimseError::DicomParsing(e.to_string()))?;
    let message_id = cmd_obj
        .element(tags::MESSAGE_ID)
        .map_err(|e| DimseError::DicomParsing(e.to_string()))?
        .to_int::<u16>()
        .map_err(|e| DimseError::DicomParsing(e.to_string()))?;
    let sop_class_uid = cmd_obj
        .element(tags::AFFECTED_SOP_CLASS_UID)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| trimmed(&s))
        .unwrap_or_default();

    Ok(match command_field {
        C_ECHO_RQ => PendingCommand::Echo {
            message_id,
            sop_class_uid,
            pc_id,
        },
        C_STORE_RQ => {
            let sop_instance_uid = cmd_obj
                .element(tags::AFFECTED_SOP_INSTANCE_UID)
                .ok()
                .and_then(|e| e.to_str().ok())
                .map(|s| trimmed(&s))
                .unwrap_or_default();
            PendingCommand::Store {
                message_id,
                sop_class_uid,
                sop_instance_uid,
                pc_id,
            }
        }
        C_FIND_RQ => PendingCommand::Find {
            message_id,
            sop_class_uid,
            pc_id,
        },
        C_GET_RQ => PendingCommand::Get {
            message_id,
            sop_class_uid,
            pc_id,
        },
        C_MOVE_RQ => {
            let destination_aet = cmd_obj
                .element(tags::MOVE_DESTINATION)
                .map_err(|e| DimseError::DicomParsing(e.to_string()))?
                .to_str()
                .map_err(|e| DimseError::DicomParsing(e.to_string()))?;
            PendingCommand::Move {
                message_id,
                sop_class_uid,
                pc_id,
                destination_aet: trimmed(&destination_aet),
            }
        }
        other => {
            return Err(DimseError::NotSupported(format!(
                "unsupported command field 0x{:04x}",
                other
            )))
        }
    })
}

/// Pulls the identifying tags a gateway archive is expected to match on
/// out of a C-FIND/C-GET/C-MOVE identifier data set.
fn known_identifier_fields(dataset: &InMemDicomObject) -> std::collections::HashMap<String, String> {
    let mut parameters = std::collections::HashMap::new();
    let known = [
        ("PatientID", tags::PATIENT_ID),
        ("PatientName", tags::PATIENT_NAME),
        ("StudyInstanceUID", tags::STUDY_INSTANCE_UID),
        ("SeriesInstanceUID", tags::SERIES_INSTANCE_UID),
        ("SOPInstanceUID", tags::SOP_INSTANCE_UID),
        ("StudyDate", tags::STUDY_DATE),
        ("AccessionNumber", tags::ACCESSION_NUMBER),
        ("ModalitiesInStudy", tags::MODALITIES_IN_STUDY),
    ];
    for (name, tag) in known {
        if let Ok(element) = dataset.element(tag) {
            if let Ok(value) = element.to_str() {
                let value = trimmed(&value);
                if !value.is_empty() {
                    parameters.insert(name.to_string(), value);
                }
            }
        }
    }
    parameters
}

fn identifier_to_find_query(dataset: &InMemDicomObject) -> Result<FindQuery> {
    let level_str = dataset
        .element(tags::QUERY_RETRIEVE_LEVEL)
        .map_err(|e| DimseError::DicomParsing(e.to_string()))?
        .to_str()
        .map_err(|e| DimseError::DicomParsing(e.to_string()))?;
    let query_level: QueryLevel = trimmed(&level_str).parse()?;

    Ok(FindQuery {
        query_level,
        parameters: known_identifier_fields(dataset),
        max_results: 0,
    })
}

fn identifier_to_move_query(dataset: &InMemDicomObject, destination_aet: &str) -> Result<MoveQuery> {
    let level_str = dataset
        .element(tags::QUERY_RETRIEVE_LEVEL)
        .map_err(|e| DimseError::DicomParsing(e.to_string()))?
        .to_str()
        .map_err(|e| DimseError::DicomParsing(e.to_string()))?;
    let query_level: QueryLevel = trimmed(&level_str).parse()?;

    Ok(MoveQuery {
        query_level,
        parameters: known_identifier_fields(dataset),
        destination_aet: destination_aet.to_string(),
        priority: MovePriority::Medium,
    })
}

async fn dispatch<S>(
    association: &mut ServerAssociation<S>,
    query_provider: &Arc<dyn QueryProvider>,
    config: &DimseConfig,
    command: PendingCommand,
    dataset: Option<InMemDicomObject>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match command {
        PendingCommand::Echo {
            message_id,
            sop_class_uid,
            pc_id,
        } => {
            send_command_only(association, pc_id, C_ECHO_RSP, message_id, &sop_class_uid, None, STATUS_SUCCESS).await
        }

        PendingCommand::Store {
            message_id,
            sop_class_uid,
            sop_instance_uid,
            pc_id,
        } => {
            let dataset = dataset.ok_or_else(|| DimseError::operation_failed("C-STORE request had no data set"))?;
            let status = match query_provider.store(DatasetStream::from_object(dataset)).await {
                Ok(()) => STATUS_SUCCESS,
                Err(e) => {
                    warn!("C-STORE failed: {}", e);
                    STATUS_PROCESSING_FAILURE
                }
            };
            send_command_only(
                association,
                pc_id,
                C_STORE_RSP,
                message_id,
                &sop_class_uid,
                Some(&sop_instance_uid),
                status,
            )
            .await
        }

        PendingCommand::Find {
            message_id,
            sop_class_uid,
            pc_id,
        } => {
            // Malformed/unsupported query-level identifiers and provider
            // errors must return a Failure status, not tear down the
            // association (spec: FIND handler exceptions emit 0xC000 and
            // the peer's association stays open).
            let dataset = dataset.ok_or_else(|| DimseError::operation_failed("C-FIND request had no identifier"))?;
            let query = match identifier_to_find_query(&dataset) {
                Ok(query) => query,
                Err(e) => {
                    warn!("C-FIND identifier parsing failed: {}", e);
                    return send_command_only(
                        association,
                        pc_id,
                        C_FIND_RSP,
                        message_id,
                        &sop_class_uid,
                        None,
                        STATUS_UNABLE_TO_PROCESS,
                    )
                    .await;
                }
            };
            let ts_uid = match presentation_context_ts(association, pc_id) {
                Ok(ts_uid) => ts_uid,
                Err(e) => {
                    warn!("C-FIND presentation context lookup failed: {}", e);
                    return send_command_only(
                        association,
                        pc_id,
                        C_FIND_RSP,
                        message_id,
                        &sop_class_uid,
                        None,
                        STATUS_UNABLE_TO_PROCESS,
                    )
                    .await;
                }
            };

            let status = match query_provider.find(query).await {
                Ok(mut results) => {
                    let mut send_failed = false;
                    while let Some(item) = results.next().await {
                        match item {
                            Ok(identifier) => {
                                if let Err(e) = send_identifier_response(
                                    association,
                                    pc_id,
                                    &ts_uid,
                                    C_FIND_RSP,
                                    message_id,
                                    &sop_class_uid,
                                    STATUS_PENDING,
                                    &identifier,
                                )
                                .await
                                {
                                    warn!("C-FIND response send failed: {}", e);
                                    send_failed = true;
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("C-FIND result stream error: {}", e);
                                break;
                            }
                        }
                    }
                    if send_failed {
                        return Err(DimseError::operation_failed("C-FIND response send failed"));
                    }
                    STATUS_SUCCESS
                }
                Err(e) => {
                    warn!("C-FIND query failed: {}", e);
                    STATUS_UNABLE_TO_PROCESS
                }
            };
            send_command_only(association, pc_id, C_FIND_RSP, message_id, &sop_class_uid, None, status).await
        }

        PendingCommand::Get {
            message_id,
            sop_class_uid,
            pc_id,
        } => {
            let dataset = dataset.ok_or_else(|| DimseError::operation_failed("C-GET request had no identifier"))?;
            let query = match identifier_to_move_query(&dataset, "") {
                Ok(query) => query,
                Err(e) => {
                    warn!("C-GET identifier parsing failed: {}", e);
                    return send_suboperations_response(
                        association,
                        pc_id,
                        C_GET_RSP,
                        message_id,
                        &sop_class_uid,
                        STATUS_UNABLE_TO_PROCESS,
                        0,
                        0,
                        0,
                        0,
                    )
                    .await;
                }
            };

            let located = match query_provider.locate(query).await {
                Ok(mut results) => {
                    let mut items = Vec::new();
                    while let Some(item) = results.next().await {
                        match item {
                            Ok(instance) => items.push(instance),
                            Err(e) => warn!("C-GET locate stream error: {}", e),
                        }
                    }
                    items
                }
                Err(e) => {
                    warn!("C-GET locate failed: {}", e);
                    return send_suboperations_response(
                        association,
                        pc_id,
                        C_GET_RSP,
                        message_id,
                        &sop_class_uid,
                        STATUS_UNABLE_TO_PROCESS,
                        0,
                        0,
                        0,
                        0,
                    )
                    .await;
                }
            };

            let mut completed = 0u16;
            let mut failed = 0u16;
            for instance in located {
                match store_suboperation(association, &instance).await {
                    Ok(()) => completed += 1,
                    Err(e) => {
                        warn!("C-GET sub-operation failed: {}", e);
                        failed += 1;
                    }
                }
            }

            let status = if failed == 0 { STATUS_SUCCESS } else { STATUS_SUB_OPERATIONS_WARNING };
            send_suboperations_response(
                association,
                pc_id,
                C_GET_RSP,
                message_id,
                &sop_class_uid,
                status,
                0,
                completed,
                failed,
                0,
            )
            .await
        }

        PendingCommand::Move {
            message_id,
            sop_class_uid,
            pc_id,
            destination_aet,
        } => {
            let dataset = dataset.ok_or_else(|| DimseError::operation_failed("C-MOVE request had no identifier"))?;
            // A malformed identifier (unsupported level, missing required
            // UID) is refused exactly like an empty locate result: no
            // destination is resolved, no outbound association is attempted.
            let query = match identifier_to_move_query(&dataset, &destination_aet) {
                Ok(query) => query,
                Err(e) => {
                    warn!("C-MOVE identifier parsing failed: {}", e);
                    return send_suboperations_response(
                        association,
                        pc_id,
                        C_MOVE_RSP,
                        message_id,
                        &sop_class_uid,
                        STATUS_MOVE_REFUSED,
                        0,
                        0,
                        0,
                        0,
                    )
                    .await;
                }
            };

            // Locate before resolving a destination: a MOVE that finds
            // nothing (neither locally nor via any configured fallback) must
            // be refused outright, with no outbound association attempted.
            let mut located = Vec::new();
            let mut locate_failed = 0u16;
            match query_provider.locate(query).await {
                Ok(mut results) => {
                    while let Some(item) = results.next().await {
                        match item {
                            Ok(instance) => located.push(instance),
                            Err(e) => {
                                warn!("C-MOVE locate stream error: {}", e);
                                locate_failed += 1;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("C-MOVE locate failed: {}", e);
                    locate_failed += 1;
                }
            }

            if located.is_empty() {
                return send_suboperations_response(
                    association,
                    pc_id,
                    C_MOVE_RSP,
                    message_id,
                    &sop_class_uid,
                    STATUS_MOVE_REFUSED,
                    0,
                    0,
                    locate_failed,
                    0,
                )
                .await;
            }

            let destination = query_provider.resolve_destination(&destination_aet).await?;
            let scu = DimseScu::new(config.clone());
            let mut completed = 0u16;
            let mut failed = locate_failed;
            for instance in located {
                match scu.store_one(&destination, &instance).await {
                    Ok(()) => completed += 1,
                    Err(e) => {
                        warn!("C-MOVE sub-operation to {} failed: {}", destination_aet, e);
                        failed += 1;
                    }
                }
            }

            let status = if failed == 0 { STATUS_SUCCESS } else { STATUS_SUB_OPERATIONS_WARNING };
            send_suboperations_response(
                association,
                pc_id,
                C_MOVE_RSP,
                message_id,
                &sop_class_uid,
                status,
                0,
                completed,
                failed,
                0,
            )
            .await
        }
    }
}

fn presentation_context_ts<S>(association: &ServerAssociation<S>, pc_id: u8) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    association
        .presentation_contexts()
        .iter()
        .find(|pc| pc.id == pc_id)
        .map(|pc| pc.transfer_syntax.clone())
        .ok_or_else(|| DimseError::operation_failed("missing presentation context"))
}

/// Sends an instance as a C-STORE-RQ over the current association (used
/// for C-GET sub-operations, which travel on the same association as the
/// request that triggered them) and waits for the matching C-STORE-RSP.
async fn store_suboperation<S>(association: &mut ServerAssociation<S>, instance: &InMemDicomObject) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let sop_class_uid = instance
        .element(tags::SOP_CLASS_UID)
        .map_err(|e| DimseError::DicomParsing(e.to_string()))?
        .to_str()
        .map_err(|e| DimseError::DicomParsing(e.to_string()))?
        .into_owned();
    let sop_instance_uid = instance
        .element(tags::SOP_INSTANCE_UID)
        .map_err(|e| DimseError::DicomParsing(e.to_string()))?
        .to_str()
        .map_err(|e| DimseError::DicomParsing(e.to_string()))?
        .into_owned();

    let pc = association
        .presentation_contexts()
        .iter()
        .find(|pc| STORAGE_SOP_CLASSES.contains(&sop_class_uid.as_str()) && !pc.transfer_syntax.is_empty())
        .map(|pc| (pc.id, pc.transfer_syntax.clone()))
        .ok_or_else(|| DimseError::operation_failed("no storage presentation context available for C-GET sub-operation"))?;

    let (pc_id, ts_uid) = pc;
    let ts = TransferSyntaxRegistry
        .get(&ts_uid)
        .ok_or_else(|| DimseError::operation_failed("unsupported transfer syntax for sub-operation"))?;

    let command = InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, &sop_class_uid)),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_STORE_RQ])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [1])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [0x0001])),
        DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, &sop_instance_uid)),
    ]);
    send_pdu_command(association, pc_id, &command).await?;

    let mut data = Vec::new();
    instance
        .write_dataset_with_ts(&mut data, ts)
        .map_err(|e| DimseError::DicomParsing(e.to_string()))?;
    let pdu = Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: pc_id,
            value_type: PDataValueType::Data,
            is_last: true,
            data,
        }],
    };
    association
        .send(&pdu)
        .await
        .map_err(|e| DimseError::DicomUl(e.to_string()))?;

    match association.receive().await {
        Ok(Pdu::PData { data }) => {
            let rsp_value = data
                .into_iter()
                .find(|v| v.value_type == PDataValueType::Command)
                .ok_or_else(|| DimseError::operation_failed("expected C-STORE-RSP command"))?;
            let rsp_obj = read_implicit_vr(&rsp_value.data)?;
            let status = rsp_obj
                .element(tags::STATUS)
                .map_err(|e| DimseError::DicomParsing(e.to_string()))?
                .to_int::<u16>()
                .map_err(|e| DimseError::DicomParsing(e.to_string()))?;
            if status == STATUS_SUCCESS {
                Ok(())
            } else {
                Err(DimseError::operation_failed(format!(
                    "peer rejected sub-operation store with status 0x{:04x}",
                    status
                )))
            }
        }
        Ok(_) => Err(DimseError::operation_failed("unexpected PDU while waiting for C-STORE-RSP")),
        Err(e) => Err(DimseError::DicomUl(e.to_string())),
    }
}

async fn send_pdu_command<S>(association: &mut ServerAssociation<S>, pc_id: u8, command: &InMemDicomObject) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let mut data = Vec::new();
    command
        .write_dataset_with_ts(&mut data, &ts)
        .map_err(|e| DimseError::DicomParsing(e.to_string()))?;
    let pdu = Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: pc_id,
            value_type: PDataValueType::Command,
            is_last: true,
            data,
        }],
    };
    association
        .send(&pdu)
        .await
        .map_err(|e| DimseError::DicomUl(e.to_string()))
}

async fn send_command_only<S>(
    association: &mut ServerAssociation<S>,
    pc_id: u8,
    command_field: u16,
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: Option<&str>,
    status: u16,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut elements = vec![
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, sop_class_uid)),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [command_field])),
        DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [0x0101])),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
    ];
    if let Some(uid) = sop_instance_uid {
        elements.push(DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, uid),
        ));
    }
    let command = InMemDicomObject::command_from_element_iter(elements);
    send_pdu_command(association, pc_id, &command).await
}

#[allow(clippy::too_many_arguments)]
async fn send_suboperations_response<S>(
    association: &mut ServerAssociation<S>,
    pc_id: u8,
    command_field: u16,
    message_id: u16,
    sop_class_uid: &str,
    status: u16,
    remaining: u16,
    completed: u16,
    failed: u16,
    warnings: u16,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let command = InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, sop_class_uid)),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [command_field])),
        DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [0x0101])),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
        DataElement::new(
            tags::NUMBER_OF_REMAINING_SUB_OPERATIONS,
            VR::US,
            dicom_value!(U16, [remaining]),
        ),
        DataElement::new(
            tags::NUMBER_OF_COMPLETED_SUB_OPERATIONS,
            VR::US,
            dicom_value!(U16, [completed]),
        ),
        DataElement::new(
            tags::NUMBER_OF_FAILED_SUB_OPERATIONS,
            VR::US,
            dicom_value!(U16, [failed]),
        ),
        DataElement::new(
            tags::NUMBER_OF_WARNING_SUB_OPERATIONS,
            VR::US,
            dicom_value!(U16, [warnings]),
        ),
    ]);
    send_pdu_command(association, pc_id, &command).await
}

async fn send_identifier_response<S>(
    association: &mut ServerAssociation<S>,
    pc_id: u8,
    ts_uid: &str,
    command_field: u16,
    message_id: u16,
    sop_class_uid: &str,
    status: u16,
    identifier: &InMemDicomObject,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let command = InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, sop_class_uid)),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [command_field])),
        DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [0x0001])),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
    ]);
    send_pdu_command(association, pc_id, &command).await?;

    let ts = TransferSyntaxRegistry
        .get(ts_uid)
        .ok_or_else(|| DimseError::operation_failed("unsupported transfer syntax"))?;
    let mut data = Vec::new();
    identifier
        .write_dataset_with_ts(&mut data, ts)
        .map_err(|e| DimseError::DicomParsing(e.to_string()))?;
    let pdu = Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: pc_id,
            value_type: PDataValueType::Data,
            is_last: true,
            data,
        }],
    };
    association
        .send(&pdu)
        .await
        .map_err(|e| DimseError::DicomUl(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scp_creation() {
        let config = DimseConfig::default();
        let provider = Arc::new(DefaultQueryProvider::new(std::env::temp_dir()));
        let scp = DimseScp::new(config, provider);
        assert_eq!(scp.active_associations().await, 0);
    }

    #[tokio::test]
    async fn test_default_query_provider_find_is_empty() {
        let provider = DefaultQueryProvider::new(std::env::temp_dir());
        let mut results = provider
            .find(FindQuery::patient(Some("123".to_string())))
            .await
            .unwrap();
        assert!(results.next().await.is_none());
    }

    #[tokio::test]
    async fn test_default_query_provider_resolve_destination_fails() {
        let provider = DefaultQueryProvider::new(std::env::temp_dir());
        assert!(provider.resolve_destination("UNKNOWN").await.is_err());
    }
}
