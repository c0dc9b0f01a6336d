// =============================================================================
// HTTP scheduler client: POSTs JSON observation requests to the web services
// =============================================================================
//
// SECURITY: the secure key travels in the request body only and is never
// logged.  Request Debug impls omit it.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use super::{ScheduleRequest, ScheduleResponse, TelescopeScheduler};

#[derive(Clone)]
pub struct HttpScheduler {
    mwa_url: String,
    atca_url: String,
    client: reqwest::Client,
}

impl HttpScheduler {
    pub fn new(
        mwa_url: impl Into<String>,
        atca_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build scheduler HTTP client")?;

        let mwa_url = mwa_url.into();
        let atca_url = atca_url.into();
        debug!(mwa_url = %mwa_url, atca_url = %atca_url, "HttpScheduler initialised");

        Ok(Self {
            mwa_url,
            atca_url,
            client,
        })
    }
}

#[async_trait]
impl TelescopeScheduler for HttpScheduler {
    #[instrument(skip(self, request), name = "scheduler::schedule", fields(project = request.project_id()))]
    async fn schedule(&self, request: &ScheduleRequest) -> Result<Option<ScheduleResponse>> {
        let builder = match request {
            ScheduleRequest::Mwa(r) => self.client.post(&self.mwa_url).json(r),
            ScheduleRequest::Atca(r) => self.client.post(&self.atca_url).json(r),
        };

        let resp = builder
            .send()
            .await
            .context("POST schedule request failed")?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .context("failed to read schedule response body")?;

        if !status.is_success() {
            warn!(%status, "scheduler returned an error status");
            anyhow::bail!("scheduler returned {}: {}", status, body);
        }

        let trimmed = body.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Ok(None);
        }

        let parsed: ScheduleResponse =
            serde_json::from_str(trimmed).context("failed to parse schedule response")?;
        debug!(success = parsed.success, "schedule response received");
        Ok(Some(parsed))
    }
}
