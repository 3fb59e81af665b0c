//! Gateway orchestration: wires the Identity Store, Object Store, Quiescence
//! Monitor, Node Manager, API client and the `dimse` crate's service
//! provider together under a `tokio::select!` / `CancellationToken`
//! shutdown, the same worker shape used by `DimseScp::run` and
//! `QuiescenceMonitor::run`.

pub mod api_catalogue;
pub mod api_client;
pub mod auto_forward;
pub mod config;
pub mod error;
pub mod identity;
pub mod node_manager;
pub mod query_provider;
pub mod quiescence;
pub mod storage;
pub mod zip_packager;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{self, prelude::*};

use crate::api_client::ApiClient;
use crate::auto_forward::AutoForwarder;
use crate::config::config::Config;
use crate::error::{GatewayError, Result};
use crate::identity::IdentityStore;
use crate::node_manager::NodeManager;
use crate::query_provider::GatewayQueryProvider;
use crate::quiescence::QuiescenceMonitor;
use crate::storage::ObjectStore;
use dimse::config::DimseConfig;
use dimse::scp::DimseScp;

/// Initialise `tracing`: an `EnvFilter` over `config.log_level`, writing to
/// `config.log_file` when set, stdout otherwise.
pub fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let file_writer = config.log_file.as_ref().and_then(|path| {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| tracing::warn!(path = %path.display(), error = %e, "failed to open log file, logging to stdout"))
            .ok()
    });

    match file_writer {
        Some(file) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(file)
                        .with_ansi(false)
                        .with_file(true)
                        .with_line_number(true),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_file(true)
                        .with_line_number(true),
                )
                .init();
        }
    }
}

/// The four core subsystems plus the optional API client, shared across the
/// `receive` background workers and the one-shot CLI subcommands.
pub struct Components {
    pub storage: Arc<ObjectStore>,
    pub identity: Arc<IdentityStore>,
    pub quiescence: Arc<QuiescenceMonitor>,
    pub nodes: Arc<NodeManager>,
    pub api: Option<Arc<ApiClient>>,
}

pub fn build_components(config: &Config) -> Result<Components> {
    config.ensure_dirs_exist()?;

    let storage = Arc::new(ObjectStore::new(&config.storage_dir));
    let identity = Arc::new(IdentityStore::load(
        config.map_file_path(),
        config.pii_tags.clone(),
    )?);
    let quiescence = QuiescenceMonitor::new(config.timeout_secs);
    let nodes = Arc::new(NodeManager::load(
        config.nodes_file_path(),
        config.ledger_file_path(),
    )?);
    let api = if config.api_username.is_some() || config.api_token.is_some() {
        Some(Arc::new(ApiClient::new(config)))
    } else {
        None
    };

    Ok(Components {
        storage,
        identity,
        quiescence,
        nodes,
        api,
    })
}

fn dimse_config(config: &Config) -> DimseConfig {
    DimseConfig {
        local_aet: config.ae_title.clone(),
        port: config.port,
        storage_dir: config.data_dir.join("tmp").join("dimse"),
        ..DimseConfig::default()
    }
}

/// Start the SCP (PSP) plus the QM and AF background workers, and block
/// until SIGINT/SIGTERM.
pub async fn receive(config: Config) -> Result<()> {
    config
        .validate()
        .map_err(|e| GatewayError::Config(e.to_string()))?;

    let config = Arc::new(config);
    let components = build_components(&config)?;

    if let Some(api) = &components.api {
        if let Err(e) = api.login().await {
            tracing::warn!(error = %e, "initial API authentication failed, will retry lazily");
        }
    }

    let patient_study_index = components.identity.patient_ids_to_studies();
    if let Err(e) = components.storage.migrate(Some(&patient_study_index)) {
        tracing::warn!(error = %e, "legacy-layout migration failed");
    }

    register_finalize_callback(&config, &components).await;

    let query_provider = Arc::new(GatewayQueryProvider::new(
        components.storage.clone(),
        components.identity.clone(),
        components.quiescence.clone(),
        components.nodes.clone(),
        components.api.clone(),
        config.default_ae_host.clone(),
        config.default_ae_port,
    ));

    let dimse_cfg = dimse_config(&config);
    let scp = DimseScp::new(dimse_cfg.clone(), query_provider);

    let shutdown = CancellationToken::new();
    let mut handles = Vec::new();

    handles.push(tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = scp.run(shutdown).await {
                tracing::error!(error = %e, "DICOM listener exited with error");
            }
        }
    }));

    handles.push(tokio::spawn({
        let quiescence = components.quiescence.clone();
        let shutdown = shutdown.clone();
        async move { quiescence.run(shutdown).await }
    }));

    if let Some(api) = components.api.clone() {
        let forwarder = AutoForwarder::new(
            api,
            components.nodes.clone(),
            dimse_cfg,
            config.forward_poll_interval_secs,
            config.forward_success_threshold,
        );
        handles.push(tokio::spawn({
            let shutdown = shutdown.clone();
            async move { forwarder.run(shutdown).await }
        }));
    }

    tracing::info!(ae_title = %config.ae_title, port = config.port, "DICOM gateway listening");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    shutdown.cancel();
    for handle in handles {
        let _ = handle.await;
    }
    tracing::info!("gateway shut down gracefully");
    Ok(())
}

/// Wire the QM's completion callback to packaging-and-upload, matching the
/// overview's "waits until quiescent, then packages and uploads" behaviour.
async fn register_finalize_callback(config: &Arc<Config>, components: &Components) {
    let storage = components.storage.clone();
    let api = components.api.clone();
    let zip_dir = config.zip_dir.clone();
    let auto_upload = config.auto_upload;
    let cleanup_after_upload = config.cleanup_after_upload;

    components
        .quiescence
        .on_complete(move |study_uid| {
            finalize_study(
                study_uid,
                storage.clone(),
                api.clone(),
                zip_dir.clone(),
                auto_upload,
                cleanup_after_upload,
            )
        })
        .await;
}

async fn finalize_study(
    study_uid: String,
    storage: Arc<ObjectStore>,
    api: Option<Arc<ApiClient>>,
    zip_dir: PathBuf,
    auto_upload: bool,
    cleanup_after_upload: bool,
) {
    let study_dir = match storage.resolve_study(&study_uid) {
        Ok(dir) => dir,
        Err(e) => {
            tracing::error!(study_uid, error = %e, "could not resolve study directory for finalisation");
            return;
        }
    };

    let output_zip = zip_dir.join(format!("{study_uid}.zip"));
    let zip_path = match crate::zip_packager::zip_study(&study_dir, Some(&output_zip)) {
        Ok(path) => path,
        Err(e) => {
            tracing::error!(study_uid, error = %e, "failed to package study");
            return;
        }
    };

    if !auto_upload {
        return;
    }
    let Some(api) = api else {
        tracing::warn!(study_uid, "auto_upload enabled but no API client configured");
        return;
    };

    let mut study_info = HashMap::new();
    study_info.insert("name".to_string(), study_uid.clone());

    match api.upload_study(&zip_path, &study_info).await {
        Ok(_) => {
            tracing::info!(study_uid, "uploaded study to central API");
            if cleanup_after_upload {
                crate::zip_packager::cleanup_files(&zip_path, Some(&study_dir));
            }
        }
        Err(e) => {
            tracing::error!(study_uid, error = %e, "failed to upload study");
        }
    }
}

/// Fetch the central API's metadata catalogue and de-anonymise every
/// PatientName found in it, for the `query` CLI subcommand.
pub async fn query_catalogue(config: &Config) -> Result<serde_json::Value> {
    let identity = IdentityStore::load(config.map_file_path(), config.pii_tags.clone())?;
    let api = ApiClient::new(config);

    let mut catalogue = api.query_all_dicom_metadata().await?;
    deanonymise_catalogue(&mut catalogue, &identity);
    Ok(catalogue)
}

fn deanonymise_catalogue(catalogue: &mut serde_json::Value, identity: &IdentityStore) {
    let Some(results) = catalogue.get_mut("results").and_then(|r| r.as_array_mut()) else {
        return;
    };
    for result in results {
        let Some(studies) = result
            .get_mut("dicom_data")
            .and_then(|d| d.get_mut("studies"))
            .and_then(|s| s.as_object_mut())
        else {
            continue;
        };
        for study in studies.values_mut() {
            if let Some(anon_name) = study.get("patient_name").and_then(|v| v.as_str()) {
                let original = identity
                    .reverse_name_lookup(anon_name)
                    .unwrap_or_else(|| anon_name.to_string());
                study["patient_name"] = serde_json::Value::String(original);
            }
        }
    }
}

/// Infer the identity-mapping file from `infile`'s directory ancestry when
/// no explicit path is given, matching `crypto.py`'s `restore_file` default.
fn infer_map_file(infile: &Path, config: &Config) -> PathBuf {
    if let Some(name) = config.patient_info_map_filename.file_name() {
        for ancestor in infile.ancestors().skip(1) {
            let candidate = ancestor.join(name);
            if candidate.exists() {
                return candidate;
            }
        }
    }
    config.map_file_path()
}

/// Restore a single anonymised DICOM file offline, without starting the SCP
/// or mutating the live mapping document (loaded read-only, never saved).
pub fn restore_file(config: &Config, infile: &Path, outfile: &Path, map_file: Option<&Path>) -> Result<()> {
    let map_path = map_file
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| infer_map_file(infile, config));
    let identity = IdentityStore::load(map_path, config.pii_tags.clone())?;

    let file_obj =
        dicom_object::open_file(infile).map_err(|e| GatewayError::Config(e.to_string()))?;
    let sop_class_uid = file_obj.meta().media_storage_sop_class_uid.clone();
    let sop_instance_uid = file_obj.meta().media_storage_sop_instance_uid.clone();
    let transfer_syntax = file_obj.meta().transfer_syntax.trim_end_matches('\0').to_string();

    let mut object = (*file_obj).clone();
    identity.restore(&mut object)?;

    let file_meta = dicom_object::FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(sop_class_uid)
        .media_storage_sop_instance_uid(sop_instance_uid)
        .transfer_syntax(&transfer_syntax)
        .build()
        .map_err(|e| GatewayError::Config(e.to_string()))?;

    object
        .with_exact_meta(file_meta)
        .write_to_file(outfile)
        .map_err(|e| GatewayError::Config(e.to_string()))?;
    Ok(())
}

/// Zip a study directory and upload it to the central API, for the
/// `upload-study` CLI subcommand.
pub async fn upload_study(config: &Config, study_dir: &Path) -> Result<()> {
    let api = ApiClient::new(config);
    let output_zip = config.zip_dir.join(format!(
        "{}.zip",
        study_dir.file_name().and_then(|n| n.to_str()).unwrap_or("study")
    ));
    let zip_path = crate::zip_packager::zip_study(study_dir, Some(&output_zip))
        .map_err(|e| GatewayError::Config(e.to_string()))?;

    let mut study_info = HashMap::new();
    study_info.insert(
        "name".to_string(),
        study_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("study")
            .to_string(),
    );

    api.upload_study(&zip_path, &study_info).await?;
    if config.cleanup_after_upload {
        crate::zip_packager::cleanup_files(&zip_path, None);
    }
    Ok(())
}
