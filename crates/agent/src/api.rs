// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control-plane client: project validation, pre-signed upload URLs,
//! batch upload, and terminal processing triggers.

use std::io::Write as _;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::batch::Batch;

/// Path segment of our own ingest endpoints; requests to these are never
/// captured by the network tap.
pub const INGEST_PATH_SEGMENT: &str = "/api/v1/per/";

/// The 400 detail the control plane returns once a session is terminal.
const PROCESSING_STARTED_DETAIL: &str = "processing already started";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Local,
    Dev,
    Stg,
    #[default]
    Prod,
}

impl Environment {
    pub fn base_url(&self) -> &'static str {
        match self {
            Self::Local => "http://localhost:8000",
            Self::Dev => "https://api-dev.perceptr.io",
            Self::Stg => "https://api-stg.perceptr.io",
            Self::Prod => "https://api.perceptr.io",
        }
    }
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    success: bool,
}

#[derive(Debug, Deserialize)]
struct BatchUrlResponse {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    detail: String,
}

/// HTTP client for one project against one environment.
pub struct ApiClient {
    base_url: String,
    project_id: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(project_id: impl Into<String>, environment: Environment) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            base_url: environment.base_url().to_owned(),
            project_id: project_id.into(),
            client,
        }
    }

    /// Override the control-plane base URL (tests and self-hosted setups).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_owned();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{INGEST_PATH_SEGMENT}{}/{path}", self.base_url, self.project_id)
    }

    /// Whether the configured project id is valid. Any error reads as
    /// invalid — this is the gate that keeps a misconfigured agent dark.
    pub async fn check_valid_project_id(&self) -> bool {
        match self.do_check().await {
            Ok(success) => success,
            Err(e) => {
                debug!(err = %e, "project id check failed");
                false
            }
        }
    }

    async fn do_check(&self) -> anyhow::Result<bool> {
        let resp = self.client.get(self.url("check")).send().await?.error_for_status()?;
        let body: CheckResponse = resp.json().await?;
        Ok(body.success)
    }

    /// Fetch a pre-signed upload URL for the next batch of `session_id`.
    ///
    /// `None` means the session is already terminal server-side and the
    /// upload should be skipped.
    pub async fn get_upload_buffer_url(&self, session_id: &str) -> anyhow::Result<Option<String>> {
        let resp = self.client.get(self.url(&format!("r/{session_id}/batch"))).send().await?;

        if resp.status() == StatusCode::BAD_REQUEST {
            let text = resp.text().await.unwrap_or_default();
            if let Ok(body) = serde_json::from_str::<ErrorDetail>(&text) {
                if body.detail == PROCESSING_STARTED_DETAIL {
                    debug!(session_id, "session already terminal, skipping upload");
                    return Ok(None);
                }
            }
            anyhow::bail!("batch url request rejected: {text}");
        }

        let body: BatchUrlResponse = resp.error_for_status()?.json().await?;
        Ok(Some(body.url))
    }

    /// Upload one batch: pre-signed URL, PUT, and (for terminal batches)
    /// a best-effort processing trigger.
    pub async fn send_events(&self, batch: &Batch) -> anyhow::Result<()> {
        let Some(upload_url) = self.get_upload_buffer_url(&batch.session_id).await? else {
            return Ok(());
        };

        let payload = serde_json::to_vec(batch)?;
        let mut request = self.client.put(&upload_url).header(CONTENT_TYPE, "application/json");
        request = if batch.metadata.compressed {
            request.header(CONTENT_ENCODING, "gzip").body(gzip(&payload)?)
        } else {
            request.body(payload)
        };
        request.send().await?.error_for_status()?;
        debug!(
            session_id = %batch.session_id,
            batch_id = %batch.batch_id,
            events = batch.metadata.event_count,
            "batch uploaded"
        );

        if batch.is_session_ended {
            // The server deduplicates triggers by session; a lost trigger
            // is recovered by the next one.
            if let Err(e) = self.trigger_processing(&batch.session_id).await {
                warn!(session_id = %batch.session_id, err = %e, "processing trigger failed");
            }
        }
        Ok(())
    }

    async fn trigger_processing(&self, session_id: &str) -> anyhow::Result<()> {
        self.client
            .post(self.url(&format!("r/{session_id}/process")))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

fn gzip(bytes: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
#[path = "api_tests.rs"]
mod tests;
