//! HTTPS client to the central research API.
//!
//! Grounded in `original_source/dicom_receiver/core/uploader.py`
//! (`ApiUploader.login`/`upload_study`, retry/backoff shape),
//! `core/query.py` (`DicomQueryHandler.query_all_dicom_metadata`/
//! `query_result_by_id`, the sentinel-tolerant JSON regex substitutions,
//! the 401 retry-once flow), and `core/utils/api_integration.py`
//! (`download_study_from_api`, extracting a ZIP into a scratch directory and
//! reading `.dcm` entries back into memory before it is dropped). The
//! `reqwest`-with-retry shape follows `FNNDSC-oxidicom`'s `cube_client.rs`
//! (`should_retry`/backoff/attempt loop), adapted to async and to this
//! binary's single cached bearer token instead of HTTP basic auth.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::config::Config;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("not authenticated: username/password or token not configured")]
    NotConfigured,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("request failed with non-retryable status {status}: {body}")]
    ClientError { status: u16, body: String },

    #[error("request failed after {0} attempts")]
    RetriesExhausted(u32),

    #[error("malformed JSON response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error handling downloaded archive: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access: Option<String>,
    #[allow(dead_code)]
    user: Option<Value>,
}

static SENTINEL_PATTERNS: Lazy<[Regex; 4]> = Lazy::new(|| {
    [
        Regex::new(r":\s*\*+").unwrap(),
        Regex::new(r":\s*-?\d*\.\*+").unwrap(),
        Regex::new(r":\s*-?\d+\.\*+").unwrap(),
        Regex::new(r"[,\s]\*+[,\s]").unwrap(),
    ]
});

/// Replace the research pipeline's `***` sentinel values with `null` so the
/// document parses as JSON. Applied to every endpoint returning the
/// metadata document shape, not just the bulk one (spec.md §9).
fn clean_sentinels(body: &str) -> String {
    let mut cleaned = body.to_string();
    cleaned = SENTINEL_PATTERNS[0].replace_all(&cleaned, ": null").into_owned();
    cleaned = SENTINEL_PATTERNS[1].replace_all(&cleaned, ": null").into_owned();
    cleaned = SENTINEL_PATTERNS[2].replace_all(&cleaned, ": null").into_owned();
    cleaned = SENTINEL_PATTERNS[3].replace_all(&cleaned, ", null,").into_owned();
    cleaned
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    token: Mutex<Option<String>>,
    max_retries: u32,
    retry_delay: Duration,
}

impl ApiClient {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.api_url.trim_end_matches('/').to_string(),
            username: config.api_username.clone(),
            password: config.api_password.clone(),
            token: Mutex::new(config.api_token.clone()),
            max_retries: config.max_retries,
            retry_delay: Duration::from_secs(config.retry_delay_secs),
        }
    }

    /// Authenticate against `/users/login/`, caching the bearer token behind
    /// a single mutex (mirroring `ApiUploader.auth_lock`). A no-op if a
    /// token is already cached.
    pub async fn login(&self) -> Result<(), ApiError> {
        let mut token_guard = self.token.lock().await;
        if token_guard.is_some() {
            return Ok(());
        }

        let (username, password) = match (&self.username, &self.password) {
            (Some(u), Some(p)) => (u, p),
            _ => return Err(ApiError::NotConfigured),
        };

        let login_url = format!("{}/users/login/", self.base_url);

        for attempt in 1..=self.max_retries {
            let response = self
                .http
                .post(&login_url)
                .json(&serde_json::json!({
                    "username_or_email": username,
                    "password": password,
                }))
                .timeout(Duration::from_secs(30))
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    let body: LoginResponse = resp.json().await?;
                    let access = body
                        .access
                        .ok_or_else(|| ApiError::AuthFailed("response had no access token".into()))?;
                    tracing::info!(username = %username, "authenticated with API");
                    *token_guard = Some(access);
                    return Ok(());
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    if status.as_u16() != 429 && status.is_client_error() {
                        return Err(ApiError::ClientError {
                            status: status.as_u16(),
                            body,
                        });
                    }
                    tracing::warn!(%status, attempt, "authentication failed, may retry");
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "error during authentication attempt");
                }
            }

            if attempt < self.max_retries {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(ApiError::RetriesExhausted(self.max_retries))
    }

    async fn ensure_token(&self) -> Result<String, ApiError> {
        {
            let guard = self.token.lock().await;
            if let Some(token) = guard.as_ref() {
                return Ok(token.clone());
            }
        }
        self.login().await?;
        let guard = self.token.lock().await;
        guard.clone().ok_or(ApiError::NotConfigured)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    /// GET `url`, retrying once on 401 (re-authenticating first), and
    /// cleaning `***` sentinel values before parsing the body as JSON.
    async fn get_metadata_document(&self, url: &str) -> Result<Value, ApiError> {
        let token = self.ensure_token().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(&token)
            .header("Accept", "application/json")
            .timeout(Duration::from_secs(30))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            tracing::warn!("authentication failed, re-authenticating and retrying once");
            self.invalidate_token().await;
            let token = self.ensure_token().await?;
            let response = self
                .http
                .get(url)
                .bearer_auth(&token)
                .header("Accept", "application/json")
                .timeout(Duration::from_secs(30))
                .send()
                .await?;
            return Self::parse_metadata_response(response).await;
        }

        Self::parse_metadata_response(response).await
    }

    async fn parse_metadata_response(response: reqwest::Response) -> Result<Value, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::ClientError {
                status: status.as_u16(),
                body,
            });
        }
        let body = response.text().await?;
        let cleaned = clean_sentinels(&body);
        Ok(serde_json::from_str(&cleaned)?)
    }

    /// `/processing/results/all_dicom_metadata/`.
    pub async fn query_all_dicom_metadata(&self) -> Result<Value, ApiError> {
        let url = format!("{}/processing/results/all_dicom_metadata/", self.base_url);
        self.get_metadata_document(&url).await
    }

    /// `/processing/results/{result_id}/dicom_metadata/`.
    pub async fn query_result_by_id(&self, result_id: &str) -> Result<Value, ApiError> {
        let url = format!(
            "{}/processing/results/{}/dicom_metadata/",
            self.base_url, result_id
        );
        self.get_metadata_document(&url).await
    }

    /// Find the `result_id` owning `study_uid` by scanning the bulk
    /// metadata document, matching `get_result_id_for_study`.
    pub async fn result_id_for_study(&self, study_uid: &str) -> Result<Option<String>, ApiError> {
        let data = self.query_all_dicom_metadata().await?;
        let results = match data.get("results").and_then(|v| v.as_array()) {
            Some(r) => r,
            None => return Ok(None),
        };
        for item in results {
            let studies = item
                .get("dicom_data")
                .and_then(|d| d.get("studies"))
                .and_then(|s| s.as_object());
            if let Some(studies) = studies {
                if studies.contains_key(study_uid) {
                    let id = item
                        .get("result")
                        .and_then(|r| r.get("id"))
                        .map(|v| v.to_string().trim_matches('"').to_string());
                    return Ok(id);
                }
            }
        }
        Ok(None)
    }

    /// Download and extract a ZIP archive, returning the raw bytes of every
    /// `.dcm` entry. Filtering by SeriesInstanceUID/SOPInstanceUID happens
    /// after extraction by opening each candidate file, matching
    /// `download_study_from_api`'s pydicom filter step.
    async fn download_and_extract(
        &self,
        url: &str,
        query: &[(&str, &str)],
        series_filter: Option<&str>,
        instance_filter: Option<&str>,
    ) -> Result<Vec<Vec<u8>>, ApiError> {
        let token = self.ensure_token().await?;
        let mut response = self
            .http
            .get(url)
            .query(query)
            .bearer_auth(&token)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            self.invalidate_token().await;
            let token = self.ensure_token().await?;
            response = self
                .http
                .get(url)
                .query(query)
                .bearer_auth(&token)
                .send()
                .await?;
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::ClientError {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        let temp_dir = tempfile::tempdir()?;
        let zip_path: PathBuf = temp_dir.path().join("study.zip");
        tokio::fs::write(&zip_path, &bytes).await?;

        let file_data = tokio::task::spawn_blocking({
            let zip_path = zip_path.clone();
            let series_filter = series_filter.map(|s| s.to_string());
            let instance_filter = instance_filter.map(|s| s.to_string());
            move || -> Result<Vec<Vec<u8>>, ApiError> {
                let file = std::fs::File::open(&zip_path)?;
                let mut archive = zip::ZipArchive::new(file)?;
                let mut out = Vec::new();
                for i in 0..archive.len() {
                    let mut entry = archive.by_index(i)?;
                    if !entry.name().to_lowercase().ends_with(".dcm") {
                        continue;
                    }
                    let mut data = Vec::with_capacity(entry.size() as usize);
                    entry.read_to_end(&mut data)?;

                    if series_filter.is_some() || instance_filter.is_some() {
                        let obj = match dicom_object::from_reader(data.as_slice()) {
                            Ok(obj) => obj,
                            Err(_) => continue,
                        };
                        if let Some(expected) = &series_filter {
                            let actual = obj
                                .element_by_name("SeriesInstanceUID")
                                .ok()
                                .and_then(|e| e.to_str().ok());
                            if actual.as_deref() != Some(expected.as_str()) {
                                continue;
                            }
                        }
                        if let Some(expected) = &instance_filter {
                            let actual = obj
                                .element_by_name("SOPInstanceUID")
                                .ok()
                                .and_then(|e| e.to_str().ok());
                            if actual.as_deref() != Some(expected.as_str()) {
                                continue;
                            }
                        }
                    }

                    out.push(data);
                }
                Ok(out)
            }
        })
        .await
        .map_err(|e| ApiError::Io(std::io::Error::other(e)))??;

        Ok(file_data)
    }

    /// `/processing/results/{result_id}/download_dicom_study/`.
    pub async fn download_study(
        &self,
        result_id: &str,
        study_uid: &str,
        series_filter: Option<&str>,
        instance_filter: Option<&str>,
    ) -> Result<Vec<Vec<u8>>, ApiError> {
        let url = format!(
            "{}/processing/results/{}/download_dicom_study/",
            self.base_url, result_id
        );
        self.download_and_extract(&url, &[("study_uid", study_uid)], series_filter, instance_filter)
            .await
    }

    /// `/processing/results/{result_id}/download_dicom_series/`.
    pub async fn download_series(
        &self,
        result_id: &str,
        study_uid: &str,
        series_uid: &str,
        instance_filter: Option<&str>,
    ) -> Result<Vec<Vec<u8>>, ApiError> {
        let url = format!(
            "{}/processing/results/{}/download_dicom_series/",
            self.base_url, result_id
        );
        self.download_and_extract(
            &url,
            &[("study_uid", study_uid), ("series_uid", series_uid)],
            Some(series_uid),
            instance_filter,
        )
        .await
    }

    /// Multipart POST to `/data/datasets/`, mirroring `upload_study`'s
    /// form-data fields and bounded retry-with-linear-backoff.
    pub async fn upload_study(
        &self,
        zip_path: &std::path::Path,
        study_info: &std::collections::HashMap<String, String>,
    ) -> Result<Value, ApiError> {
        let token = self.ensure_token().await?;
        let upload_url = format!("{}/data/datasets/", self.base_url);
        let file_name = zip_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("study.zip")
            .to_string();
        let name = study_info
            .get("name")
            .cloned()
            .unwrap_or_else(|| file_name.trim_end_matches(".zip").to_string());

        for attempt in 1..=self.max_retries {
            let bytes = tokio::fs::read(zip_path).await?;
            let part = reqwest::multipart::Part::bytes(bytes)
                .file_name(file_name.clone())
                .mime_str("application/octet-stream")?;

            let mut form = reqwest::multipart::Form::new()
                .text("name", name.clone())
                .part("file", part);
            for (key, value) in study_info {
                if key != "name" {
                    form = form.text(key.clone(), value.clone());
                }
            }

            let response = self
                .http
                .post(&upload_url)
                .bearer_auth(&token)
                .header("User-Agent", "dicom-gateway")
                .header("Accept", "application/json")
                .multipart(form)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(resp.json().await.unwrap_or(Value::Null));
                }
                Ok(resp) if resp.status() == reqwest::StatusCode::UNAUTHORIZED => {
                    tracing::warn!("upload authentication failed, refreshing token");
                    self.invalidate_token().await;
                    self.login().await?;
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    if status.as_u16() != 429 && status.is_client_error() {
                        return Err(ApiError::ClientError {
                            status: status.as_u16(),
                            body,
                        });
                    }
                    tracing::warn!(%status, attempt, "upload failed, may retry");
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "error during upload attempt");
                }
            }

            if attempt < self.max_retries {
                let backoff = self.retry_delay * attempt;
                tokio::time::sleep(backoff).await;
            }
        }

        Err(ApiError::RetriesExhausted(self.max_retries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_sentinels_replaces_asterisk_placeholders() {
        let raw = r#"{"value": ***, "slice_location": -66.***, "other": 1.***, "list": [1, ***, 3]}"#;
        let cleaned = clean_sentinels(raw);
        let parsed: Value = serde_json::from_str(&cleaned).expect("should parse as JSON");
        assert!(parsed.get("value").unwrap().is_null());
        assert!(parsed.get("slice_location").unwrap().is_null());
        assert!(parsed.get("other").unwrap().is_null());
    }

    #[test]
    fn clean_sentinels_leaves_well_formed_json_untouched() {
        let raw = r#"{"a": 1, "b": "text", "c": null}"#;
        let cleaned = clean_sentinels(raw);
        assert_eq!(cleaned, raw);
    }
}
