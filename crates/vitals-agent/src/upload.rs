//! Upload client: POSTs one batch and classifies the result.
//!
//! Callers only ever see an [`UploadOutcome`]; transport errors are folded
//! into `TransientFailure` here. There is no internal retry. The next
//! upload tick is the retry, so attempts stay within the upload quota.

use crate::config::{AgentConfig, DeviceIdPlacement, DeviceIdentity};
use crate::constants;
use crate::error::{AgentError, AgentResult};
use crate::event::{Batch, Category};
use crate::health::HealthState;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Server acknowledgement of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub status: u16,
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    /// 2xx: the caller commits the batch.
    Success(Ack),
    /// Server error, timeout, or connection failure: the caller requeues.
    TransientFailure(String),
    /// Rejected payload or device: the caller discards the batch.
    PermanentFailure(String),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadBody<'a> {
    batch_id: &'a str,
    category: Category,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_id: Option<&'a str>,
    events: Vec<WireEvent<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent<'a> {
    sequence_id: u64,
    captured_at: DateTime<Utc>,
    payload: &'a serde_json::Value,
}

/// Serialize `batch` as the category-tagged request body.
fn encode_batch(
    batch: &Batch,
    device: &DeviceIdentity,
    placement: DeviceIdPlacement,
) -> serde_json::Result<Vec<u8>> {
    let body = UploadBody {
        batch_id: batch.batch_id(),
        category: batch.category(),
        device_id: match placement {
            DeviceIdPlacement::Body => Some(device.as_str()),
            DeviceIdPlacement::Header => None,
        },
        events: batch
            .events()
            .iter()
            .map(|e| WireEvent {
                sequence_id: e.sequence_id,
                captured_at: e.captured_at,
                payload: &e.payload,
            })
            .collect(),
    };
    serde_json::to_vec(&body)
}

/// How a response status is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusClass {
    Success,
    Transient,
    Permanent,
}

fn classify_status(status: StatusCode) -> StatusClass {
    if status.is_success() {
        StatusClass::Success
    } else if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        StatusClass::Transient
    } else {
        StatusClass::Permanent
    }
}

/// Build the shared HTTP client with the configured timeouts.
pub fn http_client(config: &AgentConfig) -> AgentResult<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(config.connect_timeout())
        .timeout(config.request_timeout())
        .user_agent(concat!("vitals-agent/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| AgentError::Http(format!("build client: {e}")))
}

#[derive(Debug)]
pub struct UploadClient {
    http: reqwest::Client,
    device: DeviceIdentity,
    placement: DeviceIdPlacement,
    vitals_url: String,
    feedings_url: String,
    health: Arc<HealthState>,
}

impl UploadClient {
    pub fn new(http: reqwest::Client, config: &AgentConfig, health: Arc<HealthState>) -> Self {
        Self {
            http,
            device: config.device_id.clone(),
            placement: config.device_id_placement,
            vitals_url: config.category_url(Category::Vitals),
            feedings_url: config.category_url(Category::Feeding),
            health,
        }
    }

    fn url(&self, category: Category) -> &str {
        match category {
            Category::Vitals => &self.vitals_url,
            Category::Feeding => &self.feedings_url,
        }
    }

    /// Send one batch and record the result in the health state.
    pub async fn upload(&self, batch: &Batch) -> UploadOutcome {
        let outcome = self.send(batch).await;
        let category = batch.category();
        match &outcome {
            UploadOutcome::Success(ack) => {
                debug!(batch_id = batch.batch_id(), status = ack.status, "batch accepted");
                self.health.record_upload_success(category);
            }
            UploadOutcome::TransientFailure(reason) => {
                warn!(batch_id = batch.batch_id(), reason = %reason, "upload failed, will retry");
                self.health.record_upload_failure(category, reason, false);
            }
            UploadOutcome::PermanentFailure(reason) => {
                error!(
                    batch_id = batch.batch_id(),
                    events = batch.len(),
                    reason = %reason,
                    "upload rejected, discarding batch"
                );
                self.health.record_upload_failure(category, reason, true);
            }
        }
        outcome
    }

    async fn send(&self, batch: &Batch) -> UploadOutcome {
        let body = match encode_batch(batch, &self.device, self.placement) {
            Ok(b) => b,
            Err(e) => return UploadOutcome::PermanentFailure(format!("encode batch: {e}")),
        };

        let mut request = self
            .http
            .post(self.url(batch.category()))
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if self.placement == DeviceIdPlacement::Header {
            request = request.header(constants::DEVICE_ID_HEADER, self.device.as_str());
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) if e.is_builder() => {
                return UploadOutcome::PermanentFailure(format!("build request: {e}"));
            }
            Err(e) if e.is_timeout() => {
                return UploadOutcome::TransientFailure("request timed out".into());
            }
            Err(e) if e.is_connect() => {
                return UploadOutcome::TransientFailure(format!("connect: {e}"));
            }
            Err(e) => return UploadOutcome::TransientFailure(format!("transport: {e}")),
        };

        let status = response.status();
        match classify_status(status) {
            StatusClass::Success => {
                // The batch is accepted even if the ack body is unreadable.
                let body = response
                    .bytes()
                    .await
                    .ok()
                    .and_then(|b| serde_json::from_slice(&b).ok());
                UploadOutcome::Success(Ack {
                    status: status.as_u16(),
                    body,
                })
            }
            class => {
                let text = response.text().await.unwrap_or_default();
                let reason = describe(status, &text);
                if class == StatusClass::Transient {
                    UploadOutcome::TransientFailure(reason)
                } else {
                    UploadOutcome::PermanentFailure(reason)
                }
            }
        }
    }
}

/// `HTTP 422: <first 200 chars of body>`
fn describe(status: StatusCode, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        let snippet: String = body.chars().take(200).collect();
        format!("HTTP {}: {snippet}", status.as_u16())
    }
}
