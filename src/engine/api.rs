//! HTTP client for the pipeline backend.
//!
//! Wraps the run endpoints used by the session engine and the model console
//! endpoints used by the `models` commands. Non-2xx responses are turned into
//! [`ApiError::Status`] carrying the backend's own error text.

use crate::engine::PipelineBackend;
use crate::model::{ModelList, RunId, RunStatus, RunTicket, StartRequest, TestResult};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("API error: {message}")]
    Status { status: StatusCode, message: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected response body: {0}")]
    Decode(String),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: url::Url,
}

impl ApiClient {
    pub fn new(base_url: url::Url, timeout: Duration) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .user_agent(format!("pipeline-watch/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<url::Url, ApiError> {
        Ok(self.base_url.join(path)?)
    }

    /// Build the URL of `/api/models/{name}/download`, escaping the name.
    pub fn download_url(&self, model_name: &str) -> Result<url::Url, ApiError> {
        let mut url = self.endpoint("/api/models")?;
        url.path_segments_mut()
            .map_err(|_| ApiError::Decode("base URL cannot carry a path".into()))?
            .push(model_name)
            .push("download");
        Ok(url)
    }

    pub async fn start_run(&self, dataset_path: &str) -> Result<RunTicket, ApiError> {
        let url = self.endpoint("/api/pipeline/start")?;
        let resp = self
            .http
            .post(url)
            .json(&StartRequest { dataset_path })
            .send()
            .await?;
        decode_json(resp).await
    }

    pub async fn fetch_status(&self, run_id: &RunId) -> Result<RunStatus, ApiError> {
        let mut url = self.endpoint("/api/pipeline/status")?;
        url.path_segments_mut()
            .map_err(|_| ApiError::Decode("base URL cannot carry a path".into()))?
            .push(run_id.as_str());
        let resp = self.http.get(url).send().await?;
        decode_json(resp).await
    }

    pub async fn list_models(&self) -> Result<ModelList, ApiError> {
        let resp = self.http.get(self.endpoint("/api/models")?).send().await?;
        decode_json(resp).await
    }

    /// Upload an image for classification with the named model.
    pub async fn test_model(&self, model_name: &str, image: &Path) -> Result<TestResult, ApiError> {
        let bytes = tokio::fs::read(image).await?;
        let file_name = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        let form = reqwest::multipart::Form::new()
            .text("model_name", model_name.to_string())
            .part("file", part);
        let resp = self
            .http
            .post(self.endpoint("/api/models/test")?)
            .multipart(form)
            .send()
            .await?;
        decode_json(resp).await
    }

    /// Stream a model artifact into `dest`, returning the number of bytes written.
    ///
    /// The body lands in `<dest>.part` and is renamed into place once complete,
    /// so a failed transfer never leaves a truncated `dest` behind.
    pub async fn download_model(&self, model_name: &str, dest: &Path) -> Result<u64, ApiError> {
        let resp = self.http.get(self.download_url(model_name)?).send().await?;
        let resp = ensure_success(resp).await?;

        let part = partial_path(dest);
        let written = match write_body(resp, &part).await {
            Ok(n) => n,
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                return Err(e);
            }
        };
        tokio::fs::rename(&part, dest).await?;
        debug!(model = model_name, bytes = written, "model download finished");
        Ok(written)
    }
}

#[async_trait]
impl PipelineBackend for ApiClient {
    async fn start_run(&self, dataset_path: &str) -> Result<RunTicket, ApiError> {
        ApiClient::start_run(self, dataset_path).await
    }

    async fn fetch_status(&self, run_id: &RunId) -> Result<RunStatus, ApiError> {
        ApiClient::fetch_status(self, run_id).await
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

async fn write_body(resp: Response, path: &Path) -> Result<u64, ApiError> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0u64;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

async fn decode_json<T: DeserializeOwned>(resp: Response) -> Result<T, ApiError> {
    let resp = ensure_success(resp).await?;
    let body = resp.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| ApiError::Decode(e.to_string()))
}

async fn ensure_success(resp: Response) -> Result<Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.bytes().await.unwrap_or_default();
    Err(ApiError::Status {
        status,
        message: error_message(status, &body),
    })
}

/// Pick the human-readable error text out of a failed response body.
fn error_message(status: StatusCode, body: &[u8]) -> String {
    let fallback = || {
        status
            .canonical_reason()
            .map(str::to_string)
            .unwrap_or_else(|| status.as_str().to_string())
    };
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return fallback();
    };
    let field = ["detail", "message"]
        .iter()
        .filter_map(|k| value.get(*k))
        .find(|v| !v.is_null() && v.as_str() != Some(""));
    match field {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => value.to_string(),
    }
}
