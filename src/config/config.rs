//! Gateway configuration, loaded from environment variables.
//!
//! Grounded in `original_source/dicom_receiver/config.py`: every setting is a
//! `DICOM_RECEIVER_*` environment variable with a process default, unlike the
//! rest of the workspace's TOML-driven endpoint/pipeline configuration. The
//! typed struct and its `Serialize` derive follow the same shape used for
//! this workspace's other config structs.

use serde::Serialize;
use std::env;
use std::path::{Path, PathBuf};

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

pub const DEFAULT_PII_TAGS: &[&str] = &[
    "PatientName",
    "PatientID",
    "PatientBirthDate",
    "PatientAddress",
    "PatientTelephoneNumbers",
    "OtherPatientIDs",
    "OtherPatientNames",
];

/// Resolved runtime configuration for the gateway.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub data_dir: PathBuf,
    pub port: u16,
    pub ae_title: String,
    pub storage_dir: PathBuf,
    /// Quiescence timeout (seconds) — studies are considered complete this
    /// long after their last C-STORE.
    pub timeout_secs: u64,
    pub log_level: String,
    pub log_file: Option<PathBuf>,

    pub api_url: String,
    pub api_username: Option<String>,
    #[serde(skip_serializing)]
    pub api_password: Option<String>,
    #[serde(skip_serializing)]
    pub api_token: Option<String>,

    pub auto_upload: bool,
    pub zip_dir: PathBuf,
    pub cleanup_after_upload: bool,

    pub max_retries: u32,
    pub retry_delay_secs: u64,

    pub pii_tags: Vec<String>,
    pub patient_info_map_filename: PathBuf,

    pub nodes_filename: PathBuf,
    pub forwarding_ledger_filename: PathBuf,
    /// Auto-Forwarder poll period (seconds), default 60.
    pub forward_poll_interval_secs: u64,
    /// Fraction of instances that must succeed for a forward to count as
    /// successful (spec.md: 0.8, preserved as-is — see DESIGN.md).
    pub forward_success_threshold: f64,

    /// Fallback MOVE destination address used when an AE title has no
    /// matching configured node (`ae_config.py`'s default localhost entry).
    pub default_ae_host: String,
    pub default_ae_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

impl Config {
    /// Build configuration from environment variables, falling back to the
    /// same process defaults as the source tool.
    pub fn from_env() -> Self {
        let data_dir = PathBuf::from(env_string_or("DICOM_RECEIVER_DATA_DIR", "data"));
        let data_path = |sub: &str| data_dir.join(sub);

        let storage_dir = env::var("DICOM_RECEIVER_STORAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_path("storage"));
        let log_file_default = data_path("logs/dicom_receiver.log");
        let zip_dir = env::var("DICOM_RECEIVER_ZIP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_path("zips"));
        let map_filename = env::var("DICOM_RECEIVER_MAP_FILENAME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_path("patient_info_map.json"));
        let nodes_filename = env::var("DICOM_RECEIVER_NODES_FILENAME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_path("nodes.json"));
        let ledger_filename = env::var("DICOM_RECEIVER_LEDGER_FILENAME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_path("forwarding_ledger.json"));

        let pii_tags = env::var("DICOM_RECEIVER_PII_TAGS")
            .ok()
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_else(|| DEFAULT_PII_TAGS.iter().map(|s| s.to_string()).collect());

        Self {
            port: env_or("DICOM_RECEIVER_PORT", 11112u16),
            ae_title: env_string_or("DICOM_RECEIVER_AE_TITLE", "DICOMRCV"),
            timeout_secs: env_or("DICOM_RECEIVER_TIMEOUT", 60u64),
            log_level: env_string_or("DICOM_RECEIVER_LOG_LEVEL", "INFO"),
            log_file: env_opt("DICOM_RECEIVER_LOG_FILE")
                .map(PathBuf::from)
                .or(Some(log_file_default)),

            api_url: env_string_or("DICOM_RECEIVER_API_URL", "http://localhost:8000/api"),
            api_username: env_opt("DICOM_RECEIVER_API_USERNAME"),
            api_password: env_opt("DICOM_RECEIVER_API_PASSWORD"),
            api_token: env_opt("DICOM_RECEIVER_API_TOKEN"),

            auto_upload: env_bool("DICOM_RECEIVER_AUTO_UPLOAD", false),
            cleanup_after_upload: env_bool("DICOM_RECEIVER_CLEANUP_AFTER_UPLOAD", false),

            max_retries: env_or("DICOM_RECEIVER_MAX_RETRIES", 3u32),
            retry_delay_secs: env_or("DICOM_RECEIVER_RETRY_DELAY", 5u64),

            pii_tags,
            patient_info_map_filename: map_filename,
            nodes_filename,
            forwarding_ledger_filename: ledger_filename,
            forward_poll_interval_secs: env_or("DICOM_RECEIVER_FORWARD_POLL_INTERVAL", 60u64),
            forward_success_threshold: 0.8,

            default_ae_host: env_string_or("DICOM_RECEIVER_DEFAULT_AE_HOST", "127.0.0.1"),
            default_ae_port: env_or("DICOM_RECEIVER_DEFAULT_AE_PORT", 11113u16),

            storage_dir,
            zip_dir,
            data_dir,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ae_title.trim().is_empty() || self.ae_title.len() > 16 {
            return Err(ConfigError::Invalid(
                "DICOM_RECEIVER_AE_TITLE must be 1-16 characters".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid(
                "DICOM_RECEIVER_PORT must be greater than 0".to_string(),
            ));
        }
        if self.auto_upload && self.api_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "DICOM_RECEIVER_API_URL is required when auto-upload is enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Create every directory this configuration references, matching
    /// `config.py`'s `ensure_dirs_exist`.
    pub fn ensure_dirs_exist(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.storage_dir)?;
        std::fs::create_dir_all(&self.zip_dir)?;
        if let Some(log_file) = &self.log_file {
            if let Some(parent) = log_file.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        if let Some(parent) = self.patient_info_map_filename.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = self.nodes_filename.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Resolved path for the patient-info mapping document.
    pub fn map_file_path(&self) -> PathBuf {
        resolve_relative(&self.storage_dir, &self.patient_info_map_filename)
    }

    /// Resolved path for the node configuration document.
    pub fn nodes_file_path(&self) -> PathBuf {
        resolve_relative(&self.storage_dir, &self.nodes_filename)
    }

    /// Resolved path for the forwarding ledger document.
    pub fn ledger_file_path(&self) -> PathBuf {
        resolve_relative(&self.storage_dir, &self.forwarding_ledger_filename)
    }

    pub fn as_display_lines(&self) -> Vec<String> {
        let mask = |v: &Option<String>| -> String {
            v.as_ref()
                .map(|_| "****".to_string())
                .unwrap_or_else(|| "<unset>".to_string())
        };

        vec![
            format!("data_dir: {}", self.data_dir.display()),
            format!("port: {}", self.port),
            format!("ae_title: {}", self.ae_title),
            format!("storage_dir: {}", self.storage_dir.display()),
            format!("timeout_secs: {}", self.timeout_secs),
            format!("log_level: {}", self.log_level),
            format!(
                "log_file: {}",
                self.log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "<none>".to_string())
            ),
            format!("api_url: {}", self.api_url),
            format!(
                "api_username: {}",
                self.api_username
                    .clone()
                    .unwrap_or_else(|| "<unset>".into())
            ),
            format!("api_password: {}", mask(&self.api_password)),
            format!("api_token: {}", mask(&self.api_token)),
            format!("auto_upload: {}", self.auto_upload),
            format!("zip_dir: {}", self.zip_dir.display()),
            format!("cleanup_after_upload: {}", self.cleanup_after_upload),
            format!("max_retries: {}", self.max_retries),
            format!("retry_delay_secs: {}", self.retry_delay_secs),
            format!("pii_tags: {}", self.pii_tags.join(",")),
            format!(
                "patient_info_map_filename: {}",
                self.patient_info_map_filename.display()
            ),
            format!("nodes_filename: {}", self.nodes_filename.display()),
            format!(
                "forwarding_ledger_filename: {}",
                self.forwarding_ledger_filename.display()
            ),
            format!(
                "forward_poll_interval_secs: {}",
                self.forward_poll_interval_secs
            ),
            format!(
                "forward_success_threshold: {}",
                self.forward_success_threshold
            ),
            format!(
                "default_ae_host: {}:{}",
                self.default_ae_host, self.default_ae_port
            ),
        ]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Sanitise a PatientID for use as a filesystem path segment, per spec.md
/// §4.2 / §8 property 3: keep `[A-Za-z0-9._ -]`, anything else stripped;
/// empty result becomes `"unknown"`.
pub fn sanitise_patient_id(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ' '))
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Resolve a path relative to a base directory unless it is already absolute.
pub fn resolve_relative(base: &Path, maybe_relative: &Path) -> PathBuf {
    if maybe_relative.is_absolute() {
        maybe_relative.to_path_buf()
    } else {
        base.join(maybe_relative)
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn sanitise_strips_disallowed_characters() {
        assert_eq!(sanitise_patient_id("ABC-123_ok."), "ABC-123_ok.");
        assert_eq!(sanitise_patient_id("ABC/123:*?"), "ABC123");
        assert_eq!(sanitise_patient_id(""), "unknown");
        assert_eq!(sanitise_patient_id("///"), "unknown");
    }
}
