//! Extraction service seam: the trait the runner drives and its HTTP
//! implementation.
//!
//! The service is opaque to this crate. One call takes one page raster plus
//! the column spec and answers with zero or more rows; how the service
//! reads the page is its business. Everything that can go wrong on the
//! wire maps into [`ServiceError`], and the runner retries every variant
//! the same way.

use crate::error::ServiceError;
use crate::types::{ColumnSpec, RasterPayload, Row};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// What one successful extraction call returns.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractOutput {
    /// Zero or more rows; an empty page legitimately yields none.
    pub rows: Vec<Row>,
    /// Service-reported confidence in `[0, 1]`, when provided.
    pub confidence: Option<f32>,
}

/// A structured-extraction backend.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Extract rows matching `columns` from one page raster.
    async fn extract(
        &self,
        raster: &RasterPayload,
        columns: &ColumnSpec,
    ) -> Result<ExtractOutput, ServiceError>;
}

// ── HTTP implementation ──────────────────────────────────────────────────

/// JSON request body: base64 PNG plus the column list.
#[derive(Serialize)]
struct ExtractRequest<'a> {
    image: String,
    columns: Vec<WireColumn<'a>>,
}

#[derive(Serialize)]
struct WireColumn<'a> {
    name: &'a str,
    key: &'a str,
}

/// JSON response body.
#[derive(Deserialize)]
struct ExtractResponse {
    #[serde(default)]
    rows: Vec<Row>,
    #[serde(default)]
    confidence: Option<f32>,
}

/// [`Extractor`] over an HTTP endpoint accepting the JSON wire format.
pub struct HttpExtractor {
    client: reqwest::Client,
    endpoint: String,
    bearer_token: Option<String>,
}

impl HttpExtractor {
    /// Client with a 60 second per-call timeout and no auth.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, ServiceError> {
        Self::with_options(endpoint, 60, None)
    }

    pub fn with_options(
        endpoint: impl Into<String>,
        timeout_secs: u64,
        bearer_token: Option<String>,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            bearer_token,
        })
    }
}

#[async_trait]
impl Extractor for HttpExtractor {
    async fn extract(
        &self,
        raster: &RasterPayload,
        columns: &ColumnSpec,
    ) -> Result<ExtractOutput, ServiceError> {
        let started = Instant::now();
        let body = ExtractRequest {
            image: raster.to_base64(),
            columns: columns
                .columns()
                .iter()
                .map(|c| WireColumn {
                    name: &c.display_name,
                    key: &c.key,
                })
                .collect(),
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ServiceError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                }
            } else {
                ServiceError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ServiceError::Http {
                status: status.as_u16(),
                detail: truncate(&detail, 200),
            });
        }

        let parsed: ExtractResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::MalformedResponse(e.to_string()))?;

        debug!(
            "Extracted {} rows in {}ms",
            parsed.rows.len(),
            started.elapsed().as_millis()
        );

        Ok(ExtractOutput {
            rows: parsed.rows,
            confidence: parsed.confidence,
        })
    }
}

/// Clip long error bodies so logs stay readable.
fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}
