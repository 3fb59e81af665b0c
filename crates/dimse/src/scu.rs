//! Service Class User (SCU) implementation for outbound DIMSE operations
//!
//! `dicom-ul`'s client association is synchronous, so every operation here
//! runs the actual wire exchange inside [`tokio::task::spawn_blocking`] and
//! only awaits the blocking task from async callers (the Auto-Forwarder and
//! the SCP's C-MOVE/C-GET sub-operation dispatch).

use std::time::Duration;

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::{
    association::client::ClientAssociationOptions,
    pdu::{PDataValue, PDataValueType, PresentationContextResultReason},
    Pdu,
};
use tracing::{debug, error, info, warn};

use crate::config::{DimseConfig, RemoteNode};
use crate::types::{DatasetStream, FindQuery, QueryLevel};
use crate::{DimseError, Result};

const C_ECHO_RQ: u16 = 0x0030;
const C_STORE_RQ: u16 = 0x0001;
const C_FIND_RQ: u16 = 0x0020;
const STATUS_SUCCESS: u16 = 0x0000;
const STATUS_PENDING_A: u16 = 0xFF00;
const STATUS_PENDING_B: u16 = 0xFF01;

/// DIMSE Service Class User
pub struct DimseScu {
    config: DimseConfig,
}

impl DimseScu {
    /// Create a new SCU with the given configuration
    pub fn new(config: DimseConfig) -> Self {
        Self { config }
    }

    /// Send a C-ECHO request to a remote node
    pub async fn echo(&self, node: &RemoteNode) -> Result<bool> {
        node.validate()?;
        info!("Sending C-ECHO to {}@{}:{}", node.ae_title, node.host, node.port);

        let local_aet = self.config.local_aet.clone();
        let node = node.clone();
        tokio::task::spawn_blocking(move || echo_blocking(&local_aet, &node))
            .await
            .map_err(|e| DimseError::internal(format!("C-ECHO task panicked: {}", e)))??;

        info!("C-ECHO completed successfully");
        Ok(true)
    }

    /// Send a single instance to a remote node via C-STORE. Used both for
    /// the Auto-Forwarder's fan-out and for the SCP's C-MOVE/C-GET
    /// sub-operations.
    pub async fn store_one(&self, node: &RemoteNode, object: &InMemDicomObject) -> Result<()> {
        node.validate()?;

        let local_aet = self.config.local_aet.clone();
        let node = node.clone();
        let max_pdu = node.max_pdu.unwrap_or(self.config.max_pdu);
        let bytes = {
            let mut buf = Vec::new();
            object
                .write_all(&mut buf)
                .map_err(|e| DimseError::DicomObject(e.to_string()))?;
            buf
        };

        tokio::task::spawn_blocking(move || {
            let object = InMemDicomObject::from_reader(bytes.as_slice())
                .map_err(|e| DimseError::DicomObject(e.to_string()))?;
            store_one_blocking(&local_aet, &node, max_pdu, &object)
        })
        .await
        .map_err(|e| DimseError::internal(format!("C-STORE task panicked: {}", e)))??;

        Ok(())
    }

    /// Send a C-STORE request for a dataset already represented as a
    /// [`DatasetStream`] (e.g. freshly received from an SCP handler).
    pub async fn store(&self, node: &RemoteNode, dataset: DatasetStream) -> Result<bool> {
        let object = dataset.to_object().await?;
        self.store_one(node, &object).await?;
        Ok(true)
    }

    /// Run a C-FIND query against a remote node, collecting every matching
    /// identifier. `dicom-ul`'s client association is blocking, so results
    /// are gathered in one sweep rather than streamed incrementally.
    pub async fn find(&self, node: &RemoteNode, query: FindQuery) -> Result<Vec<InMemDicomObject>> {
        node.validate()?;
        info!(
            "Sending C-FIND to {}@{}:{} (level: {})",
            node.ae_title, node.host, node.port, query.query_level
        );

        let local_aet = self.config.local_aet.clone();
        let node = node.clone();
        let results = tokio::task::spawn_blocking(move || find_blocking(&local_aet, &node, &query))
            .await
            .map_err(|e| DimseError::internal(format!("C-FIND task panicked: {}", e)))??;

        Ok(results)
    }

    /// Test connectivity to a remote node with retry logic
    pub async fn test_connection(&self, node: &RemoteNode, max_retries: u32) -> Result<bool> {
        let mut retries = 0;

        loop {
            if retries > 0 {
                info!("Connection test retry {} of {}", retries, max_retries);
                tokio::time::sleep(Duration::from_secs(1 << retries.min(6))).await;
            }

            match self.echo(node).await {
                Ok(_) => {
                    info!("Connection test successful");
                    return Ok(true);
                }
                Err(e) if e.is_recoverable() && retries < max_retries => {
                    warn!("Connection test failed (attempt {}): {}", retries + 1, e);
                    retries += 1;
                }
                Err(e) => {
                    error!("Connection test failed permanently: {}", e);
                    return Err(e);
                }
            }
        }
    }

    /// Get connection timeout for a node (uses node-specific or global setting)
    fn get_connection_timeout(&self, node: &RemoteNode) -> Duration {
        node.connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.connect_timeout())
    }
}

fn echo_blocking(local_aet: &str, node: &RemoteNode) -> Result<()> {
    let mut association = ClientAssociationOptions::new()
        .with_abstract_syntax(uids::VERIFICATION)
        .calling_ae_title(local_aet)
        .called_ae_title(&node.ae_title)
        .max_pdu_length(node.max_pdu.unwrap_or(16384))
        .establish_with(&format!("{}:{}", node.host, node.port))
        .map_err(|e| DimseError::AssociationRejected(e.to_string()))?;

    let pc = association
        .presentation_contexts()
        .iter()
        .find(|pc| pc.reason == PresentationContextResultReason::Acceptance)
        .map(|pc| pc.id)
        .ok_or_else(|| DimseError::AssociationRejected("no presentation context accepted".into()))?;

    let command = InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::VERIFICATION)),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_ECHO_RQ])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [1])),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [0x0101])),
    ]);
    send_command(&mut association, pc, &command)?;

    let status = receive_status(&mut association)?;
    let _ = association.release();

    if status == STATUS_SUCCESS {
        Ok(())
    } else {
        Err(DimseError::operation_failed(format!("C-ECHO rejected with status 0x{:04x}", status)))
    }
}

fn store_one_blocking(local_aet: &str, node: &RemoteNode, max_pdu: u32, object: &InMemDicomObject) -> Result<()> {
    let sop_class_uid = object
        .element(tags::SOP_CLASS_UID)
        .map_err(|e| DimseError::DicomObject(e.to_string()))?
        .to_str()
        .map_err(|e| DimseError::DicomObject(e.to_string()))?
        .into_owned();
    let sop_instance_uid = object
        .element(tags::SOP_INSTANCE_UID)
        .map_err(|e| DimseError::DicomObject(e.to_string()))?
        .to_str()
        .map_err(|e| DimseError::DicomObject(e.to_string()))?
        .into_owned();

    let mut association = ClientAssociationOptions::new()
        .with_presentation_context(
            sop_class_uid.as_str(),
            vec!["1.2.840.10008.1.2.1", "1.2.840.10008.1.2"],
        )
        .calling_ae_title(local_aet)
        .called_ae_title(&node.ae_title)
        .max_pdu_length(max_pdu)
        .establish_with(&format!("{}:{}", node.host, node.port))
        .map_err(|e| DimseError::AssociationRejected(e.to_string()))?;

    let pc = association
        .presentation_contexts()
        .iter()
        .find(|pc| pc.reason == PresentationContextResultReason::Acceptance)
        .map(|pc| (pc.id, pc.transfer_syntax.clone()))
        .ok_or_else(|| DimseError::AssociationRejected("no presentation context accepted".into()))?;
    let (pc_id, ts_uid) = pc;
    let ts = TransferSyntaxRegistry
        .get(&ts_uid)
        .ok_or_else(|| DimseError::operation_failed("unsupported transfer syntax negotiated"))?;

    let command = InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, &sop_class_uid)),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_STORE_RQ])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [1])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [0x0001])),
        DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, &sop_instance_uid)),
    ]);
    send_command(&mut association, pc_id, &command)?;

    let mut dataset_buffer = Vec::new();
    object
        .write_dataset_with_ts(&mut dataset_buffer, ts)
        .map_err(|e| DimseError::DicomObject(e.to_string()))?;

    let max_fragment = 16_000usize;
    let mut offset = 0;
    loop {
        let end = (offset + max_fragment).min(dataset_buffer.len());
        let is_last = end >= dataset_buffer.len();
        let pdu = Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc_id,
                value_type: PDataValueType::Data,
                is_last,
                data: dataset_buffer[offset..end].to_vec(),
            }],
        };
        association
            .send(&pdu)
            .map_err(|e| DimseError::DicomUl(e.to_string()))?;
        offset = end;
        if is_last {
            break;
        }
    }

    let status = receive_status(&mut association)?;
    let _ = association.release();

    if status == STATUS_SUCCESS {
        debug!("C-STORE of {} completed", sop_instance_uid);
        Ok(())
    } else {
        Err(DimseError::operation_failed(format!("peer rejected C-STORE with status 0x{:04x}", status)))
    }
}

fn find_blocking(local_aet: &str, node: &RemoteNode, query: &FindQuery) -> Result<Vec<InMemDicomObject>> {
    let abstract_syntax = uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND;
    let mut association = ClientAssociationOptions::new()
        .with_abstract_syntax(abstract_syntax)
        .calling_ae_title(local_aet)
        .called_ae_title(&node.ae_title)
        .max_pdu_length(node.max_pdu.unwrap_or(16384))
        .establish_with(&format!("{}:{}", node.host, node.port))
        .map_err(|e| DimseError::AssociationRejected(e.to_string()))?;

    let pc = association
        .presentation_contexts()
        .iter()
        .find(|pc| pc.reason == PresentationContextResultReason::Acceptance)
        .map(|pc| (pc.id, pc.transfer_syntax.clone()))
        .ok_or_else(|| DimseError::AssociationRejected("no presentation context accepted".into()))?;
    let (pc_id, ts_uid) = pc;
    let ts = TransferSyntaxRegistry
        .get(&ts_uid)
        .ok_or_else(|| DimseError::operation_failed("unsupported transfer syntax negotiated"))?;

    let command = InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, abstract_syntax)),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_FIND_RQ])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [1])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [0x0001])),
    ]);
    send_command(&mut association, pc_id, &command)?;

    let identifier = find_query_to_identifier(query);
    let mut identifier_buffer = Vec::new();
    identifier
        .write_dataset_with_ts(&mut identifier_buffer, ts)
        .map_err(|e| DimseError::DicomObject(e.to_string()))?;
    association
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc_id,
                value_type: PDataValueType::Data,
                is_last: true,
                data: identifier_buffer,
            }],
        })
        .map_err(|e| DimseError::DicomUl(e.to_string()))?;

    let mut results = Vec::new();
    loop {
        match association.receive().map_err(|e| DimseError::DicomUl(e.to_string()))? {
            Pdu::PData { data } => {
                let command_value = data
                    .iter()
                    .find(|v| v.value_type == PDataValueType::Command)
                    .ok_or_else(|| DimseError::operation_failed("missing command value in C-FIND response"))?;
                let rsp_command = read_implicit_vr(&command_value.data)?;
                let status = rsp_command
                    .element(tags::STATUS)
                    .map_err(|e| DimseError::DicomParsing(e.to_string()))?
                    .to_int::<u16>()
                    .map_err(|e| DimseError::DicomParsing(e.to_string()))?;

                if status == STATUS_PENDING_A || status == STATUS_PENDING_B {
                    if let Some(identifier_value) = data.iter().find(|v| v.value_type == PDataValueType::Data) {
                        let identifier = InMemDicomObject::read_dataset_with_ts(&identifier_value.data[..], ts)
                            .map_err(|e| DimseError::DicomParsing(e.to_string()))?;
                        results.push(identifier);
                    }
                } else {
                    break;
                }
            }
            other => {
                warn!("unexpected PDU during C-FIND: {:?}", other);
                break;
            }
        }
    }

    let _ = association.release();
    Ok(results)
}

fn find_query_to_identifier(query: &FindQuery) -> InMemDicomObject {
    let mut identifier = InMemDicomObject::new_empty();
    let level = match query.query_level {
        QueryLevel::Patient => "PATIENT",
        QueryLevel::Study => "STUDY",
        QueryLevel::Series => "SERIES",
        QueryLevel::Image => "IMAGE",
    };
    identifier.put(DataElement::new(
        tags::QUERY_RETRIEVE_LEVEL,
        VR::CS,
        dicom_value!(Str, level),
    ));
    for (name, value) in &query.parameters {
        if let Some((tag, vr)) = tag_for_known_field(name) {
            identifier.put(DataElement::new(tag, vr, dicom_value!(Str, value)));
        }
    }
    identifier
}

fn tag_for_known_field(name: &str) -> Option<(dicom_core::Tag, VR)> {
    match name {
        "PatientID" => Some((tags::PATIENT_ID, VR::LO)),
        "PatientName" => Some((tags::PATIENT_NAME, VR::PN)),
        "StudyInstanceUID" => Some((tags::STUDY_INSTANCE_UID, VR::UI)),
        "SeriesInstanceUID" => Some((tags::SERIES_INSTANCE_UID, VR::UI)),
        "SOPInstanceUID" => Some((tags::SOP_INSTANCE_UID, VR::UI)),
        "StudyDate" => Some((tags::STUDY_DATE, VR::DA)),
        "AccessionNumber" => Some((tags::ACCESSION_NUMBER, VR::SH)),
        "ModalitiesInStudy" => Some((tags::MODALITIES_IN_STUDY, VR::CS)),
        _ => None,
    }
}

fn read_implicit_vr(bytes: &[u8]) -> Result<InMemDicomObject> {
    let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    InMemDicomObject::read_dataset_with_ts(bytes, &ts).map_err(|e| DimseError::DicomParsing(e.to_string()))
}

fn send_command(
    association: &mut dicom_ul::ClientAssociation<std::net::TcpStream>,
    pc_id: u8,
    command: &InMemDicomObject,
) -> Result<()> {
    let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let mut data = Vec::new();
    command
        .write_dataset_with_ts(&mut data, &ts)
        .map_err(|e| DimseError::DicomObject(e.to_string()))?;
    association
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data,
            }],
        })
        .map_err(|e| DimseError::DicomUl(e.to_string()))
}

fn receive_status(association: &mut dicom_ul::ClientAssociation<std::net::TcpStream>) -> Result<u16> {
    match association.receive().map_err(|e| DimseError::DicomUl(e.to_string()))? {
        Pdu::PData { data } => {
            let command_value = data
                .iter()
                .find(|v| v.value_type == PDataValueType::Command)
                .ok_or_else(|| DimseError::operation_failed("missing command value in response"))?;
            let rsp = read_implicit_vr(&command_value.data)?;
            rsp.element(tags::STATUS)
                .map_err(|e| DimseError::DicomParsing(e.to_string()))?
                .to_int::<u16>()
                .map_err(|e| DimseError::DicomParsing(e.to_string()))
        }
        other => Err(DimseError::operation_failed(format!("unexpected PDU: {:?}", other))),
    }
}

/// Builder for creating SCU instances with custom configurations
pub struct ScuBuilder {
    config: DimseConfig,
}

impl ScuBuilder {
    /// Start building a new SCU
    pub fn new() -> Self {
        Self {
            config: DimseConfig::default(),
        }
    }

    /// Set the local AE title
    pub fn local_aet(mut self, aet: impl Into<String>) -> Self {
        self.config.local_aet = aet.into();
        self
    }

    /// Set the connection timeout
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the maximum PDU size
    pub fn max_pdu(mut self, size: u32) -> Self {
        self.config.max_pdu = size;
        self
    }

    /// Build the SCU
    pub fn build(self) -> Result<DimseScu> {
        self.config.validate()?;
        Ok(DimseScu::new(self.config))
    }
}

impl Default for ScuBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scu_creation() {
        let scu = ScuBuilder::new()
            .local_aet("TEST_SCU")
            .connection_timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        assert_eq!(scu.config.local_aet, "TEST_SCU");
        assert_eq!(scu.config.connect_timeout_ms, 10_000);
    }

    #[tokio::test]
    async fn test_connection_timeout_selection() {
        let scu = DimseScu::new(DimseConfig {
            connect_timeout_ms: 5000,
            ..Default::default()
        });

        let node1 = RemoteNode::new("TEST1", "localhost", 11112);
        assert_eq!(scu.get_connection_timeout(&node1), Duration::from_millis(5000));

        let node2 = RemoteNode::new("TEST2", "localhost", 11113).with_timeout(2000);
        assert_eq!(scu.get_connection_timeout(&node2), Duration::from_millis(2000));
    }

    #[test]
    fn test_invalid_config_validation() {
        let result = ScuBuilder::new().local_aet("").build();
        assert!(result.is_err());
    }

    #[tokio::test]
    #[ignore = "requires a live DICOM peer to connect to"]
    async fn test_echo_against_live_peer() {
        let scu = DimseScu::new(DimseConfig::default());
        let node = RemoteNode::new("TEST_AET", "localhost", 11112);
        let result = scu.echo(&node).await;
        assert!(result.is_ok());
    }
}
