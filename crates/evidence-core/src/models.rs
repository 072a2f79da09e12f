//! Core data models shared by every layer of the engine.
//!
//! Knowledge sources return [`EvidenceRecord`]s; the engine stamps them with
//! the source name, retrieval time and the spec that produced them, turning
//! them into [`EvidenceItem`]s that flow through aggregation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of evidence a [`SearchSpec`](crate::region::SearchSpec) is after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Guideline,
    Treatment,
    Literature,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceType::Guideline => "guideline",
            ResourceType::Treatment => "treatment",
            ResourceType::Literature => "literature",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of a source connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Pending,
    Connected,
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Pending => "pending",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// An operation advertised by a knowledge source during discovery.
///
/// `parameters` is the source's JSON Schema for the call parameters. The
/// engine does not validate against it; it is carried for diagnostics and
/// for callers that want to inspect the routing table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_schema")]
    pub parameters: Value,
}

fn empty_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: empty_schema(),
        }
    }
}

/// An evidence-shaped record as returned by a source's `invoke`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub title: String,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub citation_metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub raw_payload: Value,
}

impl EvidenceRecord {
    pub fn new(external_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            external_id: Some(external_id.into()),
            citation_metadata: BTreeMap::new(),
            raw_payload: Value::Null,
        }
    }
}

/// A single piece of evidence held in a [`SearchResult`](crate::result::SearchResult).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub source_name: String,
    pub external_id: Option<String>,
    pub title: String,
    pub citation_metadata: BTreeMap<String, Value>,
    pub raw_payload: Value,
    pub retrieved_at: DateTime<Utc>,
    pub resource_type: ResourceType,
    /// The `result_key` of the spec that produced this item.
    pub result_key: String,
}

impl EvidenceItem {
    /// Stamp a source record with where and when it was retrieved.
    pub fn from_record(
        record: EvidenceRecord,
        source_name: &str,
        resource_type: ResourceType,
        result_key: &str,
        retrieved_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source_name: source_name.to_string(),
            external_id: record.external_id.filter(|id| !id.trim().is_empty()),
            title: record.title,
            citation_metadata: record.citation_metadata,
            raw_payload: record.raw_payload,
            retrieved_at,
            resource_type,
            result_key: result_key.to_string(),
        }
    }

    /// Identity used for de-duplication.
    ///
    /// `(source_name, external_id)` when the source supplied an id, otherwise
    /// a SHA-256 over the title and the canonical JSON of the citation
    /// metadata (a `BTreeMap`, so key order is stable).
    pub fn dedup_key(&self) -> DedupKey {
        match &self.external_id {
            Some(id) => DedupKey::External {
                source_name: self.source_name.clone(),
                external_id: id.clone(),
            },
            None => DedupKey::Content(content_hash(&self.title, &self.citation_metadata)),
        }
    }
}

/// De-duplication identity of an [`EvidenceItem`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    External {
        source_name: String,
        external_id: String,
    },
    Content(String),
}

fn content_hash(title: &str, citation_metadata: &BTreeMap<String, Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update([0u8]);
    hasher.update(serde_json::to_string(citation_metadata).unwrap_or_default().as_bytes());
    format!("{:x}", hasher.finalize())
}
