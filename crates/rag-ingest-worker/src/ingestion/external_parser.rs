//! HTTP client for the external parsing service
//!
//! Endpoints:
//! - `POST /jobs` - submit base64 content, returns `{job_id, status, message}`
//! - `GET /jobs/{id}` - job status
//! - `GET /jobs/{id}/result` - parsed document of a finished job
//! - `GET /health` - liveness

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::ParserConfig;
use crate::providers::{ParserService, SubmissionError, SubmissionReceipt, SubmissionRequest};

/// Longest error body kept in a `SubmissionError::Status`
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Serialize)]
struct JobRequest<'a> {
    /// Base64-encoded file content
    content: String,
    filename: &'a str,
    mimetype: &'a str,
    metadata: BTreeMap<&'static str, String>,
}

/// Parsing service client
pub struct ExternalParser {
    client: Client,
    base_url: String,
    secret: Option<String>,
}

impl ExternalParser {
    /// Create a new parser client
    pub fn new(config: &ParserConfig) -> Result<Self, SubmissionError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| SubmissionError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            secret: config.secret.clone().filter(|s| !s.is_empty()),
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.secret {
            Some(secret) => request.bearer_auth(secret),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, SubmissionError> {
        self.authorized(request)
            .send()
            .await
            .map_err(|e| SubmissionError::Transport(e.to_string()))
    }

    async fn status_error(response: Response) -> SubmissionError {
        let status = response.status().as_u16();
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        SubmissionError::Status { status, body }
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
        job_id: &str,
    ) -> Result<T, SubmissionError> {
        let response = self.send(self.client.get(&url)).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(SubmissionError::JobNotFound(job_id.to_string()));
        }
        if response.status() != StatusCode::OK {
            return Err(Self::status_error(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| SubmissionError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl ParserService for ExternalParser {
    async fn submit(
        &self,
        request: SubmissionRequest<'_>,
    ) -> Result<SubmissionReceipt, SubmissionError> {
        let meta = &request.metadata;
        let body = JobRequest {
            content: STANDARD.encode(request.content),
            filename: request.filename,
            mimetype: request.media_type,
            metadata: BTreeMap::from([
                ("tenant", meta.tenant.clone()),
                ("file_id", meta.file_id.to_string()),
                ("file_path", meta.file_path.clone()),
                ("trace_id", meta.trace_id.clone()),
                ("event_id", meta.event_id.clone()),
            ]),
        };

        tracing::info!(
            "Submitting file {} ({} bytes) to parser, trace {}",
            meta.file_id,
            request.content.len(),
            meta.trace_id
        );

        let url = format!("{}/jobs", self.base_url);
        let response = self.send(self.client.post(&url).json(&body)).await?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let receipt: SubmissionReceipt = response
            .json()
            .await
            .map_err(|e| SubmissionError::InvalidResponse(e.to_string()))?;

        if receipt.job_id.is_empty() {
            return Err(SubmissionError::InvalidResponse(
                "response carries an empty job_id".to_string(),
            ));
        }

        tracing::info!(
            "Parser accepted file {} as job {} ({})",
            meta.file_id,
            receipt.job_id,
            receipt.status
        );
        Ok(receipt)
    }

    async fn get_status(&self, job_id: &str) -> Result<SubmissionReceipt, SubmissionError> {
        let url = format!("{}/jobs/{}", self.base_url, urlencoding::encode(job_id));
        let receipt: SubmissionReceipt = self.fetch_json(url, job_id).await?;
        tracing::debug!("Job {} status: {}", job_id, receipt.status);
        Ok(receipt)
    }

    async fn get_result(&self, job_id: &str) -> Result<serde_json::Value, SubmissionError> {
        let url = format!(
            "{}/jobs/{}/result",
            self.base_url,
            urlencoding::encode(job_id)
        );
        self.fetch_json(url, job_id).await
    }

    async fn health_check(&self) -> Result<(), SubmissionError> {
        let url = format!("{}/health", self.base_url);
        let response = self.send(self.client.get(&url)).await?;
        if response.status() == StatusCode::OK {
            Ok(())
        } else {
            Err(Self::status_error(response).await)
        }
    }

    fn name(&self) -> &str {
        "external-parser"
    }
}
