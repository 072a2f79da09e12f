//! HTTP knowledge source.
//!
//! Talks to any service exposing the JSON tool protocol:
//!
//! | Method | Path | Used for |
//! |--------|------|----------|
//! | `GET`  | `/health` | connect |
//! | `GET`  | `/tools/list` | discover: `{ "tools": [{ "name", "description", "parameters" }] }` |
//! | `POST` | `/tools/{name}` | invoke: JSON object of string params → `{ "result": ... }` |
//!
//! The `result` may be an array of records, or an object carrying the array
//! under `items` or `results`. Error bodies follow
//! `{ "error": { "code": "...", "message": "..." } }`.
//!
//! # Fault Classification
//!
//! | Response | Fault |
//! |----------|-------|
//! | connect error, timeout, 408, 429, 5xx | `Transient` |
//! | 401, 403 | `Auth` |
//! | 404 | `OperationNotFound` |
//! | other 4xx, undecodable body | `Protocol` |

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use evidence_core::models::{EvidenceRecord, ToolDescriptor};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::config::HttpSourceConfig;
use crate::error::SourceFault;
use crate::traits::EvidenceSource;

/// Knowledge source reached over the JSON tool protocol.
pub struct HttpSource {
    name: String,
    base_url: Url,
    api_key_env: Option<String>,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ToolListResponse {
    tools: Vec<ToolDescriptor>,
}

impl HttpSource {
    pub fn new(name: String, config: HttpSourceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let base_url = Url::parse(&config.url)
            .with_context(|| format!("source '{}': invalid url '{}'", name, config.url))?;
        if base_url.cannot_be_a_base() {
            bail!("source '{}': url '{}' cannot carry a path", name, config.url);
        }

        Ok(Self {
            name,
            base_url,
            api_key_env: config.api_key_env,
            client,
        })
    }

    /// `base_url` with `segments` appended, each percent-encoded as one
    /// path segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, SourceFault> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SourceFault::Protocol(format!("{}: base url cannot carry a path", self.name)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder, SourceFault> {
        match &self.api_key_env {
            Some(var) => {
                let token = std::env::var(var).map_err(|_| {
                    SourceFault::Auth(format!("environment variable {} is not set", var))
                })?;
                Ok(req.header("Authorization", format!("Bearer {}", token)))
            }
            None => Ok(req),
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Value, SourceFault> {
        let response = self
            .authorize(req)?
            .send()
            .await
            .map_err(|e| classify_transport_error(&self.name, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| classify_transport_error(&self.name, e))?;

        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        serde_json::from_str(&body)
            .map_err(|e| SourceFault::Protocol(format!("{}: invalid JSON response: {}", self.name, e)))
    }
}

#[async_trait]
impl EvidenceSource for HttpSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_type(&self) -> &str {
        "http"
    }

    async fn connect(&self) -> Result<(), SourceFault> {
        let url = self.endpoint(&["health"])?;
        debug!(source = %self.name, %url, "connecting");
        self.send(self.client.get(url)).await.map(|_| ())
    }

    async fn discover(&self) -> Result<Vec<ToolDescriptor>, SourceFault> {
        let url = self.endpoint(&["tools", "list"])?;
        let json = self.send(self.client.get(url)).await?;
        let list: ToolListResponse = serde_json::from_value(json).map_err(|e| {
            SourceFault::Protocol(format!("{}: invalid tool list: {}", self.name, e))
        })?;
        Ok(list.tools)
    }

    async fn invoke(
        &self,
        operation: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<Vec<EvidenceRecord>, SourceFault> {
        let url = self.endpoint(&["tools", operation])?;
        let json = self.send(self.client.post(url).json(params)).await?;
        parse_records(&self.name, json)
    }
}

/// Extract records from a `{ "result": ... }` body. Records without an
/// explicit `raw_payload` keep their original JSON there.
fn parse_records(source: &str, json: Value) -> Result<Vec<EvidenceRecord>, SourceFault> {
    let result = match json {
        Value::Object(mut map) => map
            .remove("result")
            .ok_or_else(|| SourceFault::Protocol(format!("{}: response missing 'result'", source)))?,
        _ => {
            return Err(SourceFault::Protocol(format!(
                "{}: response is not a JSON object",
                source
            )))
        }
    };

    let records = match result {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("items").or_else(|| map.remove("results")) {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(SourceFault::Protocol(format!(
                    "{}: result carries no 'items' or 'results' array",
                    source
                )))
            }
        },
        _ => {
            return Err(SourceFault::Protocol(format!(
                "{}: result is neither an array nor an object",
                source
            )))
        }
    };

    records
        .into_iter()
        .map(|v| -> Result<EvidenceRecord, SourceFault> {
            let mut record = serde_json::from_value::<EvidenceRecord>(v.clone())
                .map_err(|e| SourceFault::Protocol(format!("{}: invalid record: {}", source, e)))?;
            if record.raw_payload.is_null() {
                record.raw_payload = v;
            }
            Ok(record)
        })
        .collect()
}

fn classify_status(status: StatusCode, body: &str) -> SourceFault {
    let message = format!("HTTP {}: {}", status.as_u16(), error_message(body));
    match status.as_u16() {
        401 | 403 => SourceFault::Auth(message),
        404 => SourceFault::OperationNotFound(message),
        408 | 429 => SourceFault::Transient(message),
        _ if status.is_server_error() => SourceFault::Transient(message),
        _ => SourceFault::Protocol(message),
    }
}

fn classify_transport_error(source: &str, err: reqwest::Error) -> SourceFault {
    if err.is_decode() {
        SourceFault::Protocol(format!("{}: {}", source, err))
    } else {
        // Connect failures, timeouts, resets and body read errors.
        SourceFault::Transient(format!("{}: {}", source, err))
    }
}

/// Pull `error.message` out of an error body, falling back to the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(200).collect())
}
