//! Auto-Forwarder (AF): periodically fans out never-before-sent series from
//! the central API's metadata catalogue to configured downstream DICOM nodes.
//!
//! Grounded in `original_source/dicom_receiver/core/forwarder.py`'s
//! `AutoForwarder.run`/`_forward_series`: one tick fetches the catalogue
//! once, then iterates enabled nodes and, per node, every `(study, series)`
//! pair not yet recorded in the Node Manager's ledger, downloading the
//! series ZIP and sending each instance over a single outbound association.
//! A forward counts as successful once at least `success_threshold` of its
//! instances land with status 0x0000, mirroring `_forward_series`'
//! `min_success_count` check. The background loop follows the same
//! `tokio::select!` / `CancellationToken` shutdown idiom used by
//! [`crate::quiescence::QuiescenceMonitor::run`] and `DimseScp::run`.

use std::sync::Arc;
use std::time::Duration;

use dimse::config::{DimseConfig, RemoteNode};
use dimse::scu::DimseScu;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api_catalogue;
use crate::api_client::ApiClient;
use crate::node_manager::{NodeConfig, NodeManager};

pub struct AutoForwarder {
    api: Arc<ApiClient>,
    nodes: Arc<NodeManager>,
    scu: DimseScu,
    poll_interval: Duration,
    success_threshold: f64,
}

impl AutoForwarder {
    pub fn new(
        api: Arc<ApiClient>,
        nodes: Arc<NodeManager>,
        dimse_config: DimseConfig,
        poll_interval_secs: u64,
        success_threshold: f64,
    ) -> Self {
        Self {
            api,
            nodes,
            scu: DimseScu::new(dimse_config),
            poll_interval: Duration::from_secs(poll_interval_secs),
            success_threshold,
        }
    }

    /// Run the poll loop until `shutdown` is cancelled. Intended to be
    /// spawned as its own task.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("auto-forwarder shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.poll_interval) => {
                    self.tick().await;
                }
            }
        }
    }

    async fn tick(&self) {
        let nodes = self.nodes.enabled_nodes();
        if nodes.is_empty() {
            return;
        }

        let catalogue = match self.api.query_all_dicom_metadata().await {
            Ok(doc) => doc,
            Err(e) => {
                warn!(error = %e, "auto-forwarder catalogue fetch failed, skipping tick");
                return;
            }
        };

        let studies = api_catalogue::extract_studies(&catalogue, None);

        for (node_id, node_config) in &nodes {
            for study in &studies {
                let series_list =
                    api_catalogue::extract_series(&catalogue, &study.study_instance_uid, None);
                for series in &series_list {
                    if self
                        .nodes
                        .is_series_sent(node_id, &series.series_instance_uid)
                    {
                        continue;
                    }
                    self.forward_series(
                        &catalogue,
                        node_id,
                        node_config,
                        &study.study_instance_uid,
                        &series.series_instance_uid,
                    )
                    .await;
                }
            }
        }
    }

    async fn forward_series(
        &self,
        catalogue: &serde_json::Value,
        node_id: &str,
        node_config: &NodeConfig,
        study_uid: &str,
        series_uid: &str,
    ) {
        let Some(result_id) = api_catalogue::result_id_for_study(catalogue, study_uid) else {
            warn!(study_uid, "no API result id for study, skipping forward");
            return;
        };

        let blobs = match self
            .api
            .download_series(&result_id, study_uid, series_uid, None)
            .await
        {
            Ok(blobs) => blobs,
            Err(e) => {
                warn!(error = %e, series_uid, "auto-forwarder download failed, will retry next tick");
                return;
            }
        };
        if blobs.is_empty() {
            return;
        }

        let node = RemoteNode {
            ae_title: node_config.aet.clone(),
            host: node_config.ip.clone(),
            port: node_config.port,
            use_tls: false,
            connect_timeout_ms: None,
            max_pdu: None,
        };

        let total = blobs.len();
        let mut succeeded = 0usize;
        for bytes in blobs {
            let object = match dicom_object::from_reader(bytes.as_slice()) {
                Ok(obj) => obj,
                Err(e) => {
                    warn!(error = %e, series_uid, "skipping unreadable instance during forward");
                    continue;
                }
            };
            match self.scu.store_one(&node, &object).await {
                Ok(()) => succeeded += 1,
                Err(e) => warn!(error = %e, node = %node_id, series_uid, "C-STORE sub-operation failed"),
            }
        }

        let ratio = succeeded as f64 / total as f64;
        if ratio >= self.success_threshold {
            if let Err(e) = self.nodes.mark_series_sent(node_id, series_uid) {
                warn!(error = %e, node = %node_id, series_uid, "failed to persist forwarding ledger entry");
            } else {
                info!(
                    node = %node_id,
                    series_uid,
                    succeeded,
                    total,
                    "forwarded series"
                );
            }
        } else {
            warn!(
                node = %node_id,
                series_uid,
                succeeded,
                total,
                "forward below success threshold, will retry next tick"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_threshold_accepts_partial_success() {
        let threshold = 0.8;
        assert!(4.0 / 5.0 >= threshold);
        assert!(3.0 / 5.0 < threshold);
    }
}
