//! Fixture knowledge source backed by a JSON file.
//!
//! Serves canned records for offline runs, demos, and tests. The file is read
//! on [`connect`](EvidenceSource::connect):
//!
//! ```json
//! {
//!   "operations": {
//!     "search_literature": {
//!       "description": "Search indexed abstracts",
//!       "filter_param": "query",
//!       "latency_ms": 250,
//!       "records": [
//!         { "external_id": "PMC101", "title": "Early sepsis bundles",
//!           "citation_metadata": { "year": 2022, "keywords": ["sepsis"] } }
//!       ]
//!     }
//!   }
//! }
//! ```
//!
//! With a `filter_param`, a record matches when its title or its
//! `citation_metadata.keywords` contain any word (3+ characters) of that
//! parameter's value, case-insensitively.

use async_trait::async_trait;
use evidence_core::models::{EvidenceRecord, ToolDescriptor};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::SourceFault;
use crate::traits::EvidenceSource;

#[derive(Debug, Deserialize)]
struct FixtureFile {
    #[serde(default)]
    operations: BTreeMap<String, FixtureOperation>,
}

#[derive(Debug, Deserialize)]
struct FixtureOperation {
    #[serde(default)]
    description: String,
    #[serde(default)]
    parameters: Option<Value>,
    #[serde(default)]
    filter_param: Option<String>,
    #[serde(default)]
    latency_ms: u64,
    #[serde(default)]
    records: Vec<EvidenceRecord>,
}

pub struct FixtureSource {
    name: String,
    path: PathBuf,
    loaded: RwLock<Option<Arc<FixtureFile>>>,
}

impl FixtureSource {
    pub fn new(name: String, path: PathBuf) -> Self {
        Self {
            name,
            path,
            loaded: RwLock::new(None),
        }
    }

    async fn fixture(&self) -> Result<Arc<FixtureFile>, SourceFault> {
        let cached = self.loaded.read().map_err(|_| poisoned())?.clone();
        if let Some(f) = cached {
            return Ok(f);
        }

        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            SourceFault::Transient(format!(
                "{}: cannot read fixture {}: {}",
                self.name,
                self.path.display(),
                e
            ))
        })?;
        let parsed: FixtureFile = serde_json::from_str(&content).map_err(|e| {
            SourceFault::Protocol(format!(
                "{}: invalid fixture {}: {}",
                self.name,
                self.path.display(),
                e
            ))
        })?;

        let parsed = Arc::new(parsed);
        *self.loaded.write().map_err(|_| poisoned())? = Some(parsed.clone());
        Ok(parsed)
    }
}

fn poisoned() -> SourceFault {
    SourceFault::Protocol("fixture cache lock poisoned".to_string())
}

#[async_trait]
impl EvidenceSource for FixtureSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_type(&self) -> &str {
        "fixture"
    }

    async fn connect(&self) -> Result<(), SourceFault> {
        self.fixture().await.map(|_| ())
    }

    async fn discover(&self) -> Result<Vec<ToolDescriptor>, SourceFault> {
        let fixture = self.fixture().await?;
        Ok(fixture
            .operations
            .iter()
            .map(|(name, op)| {
                let mut descriptor = ToolDescriptor::new(name.clone(), op.description.clone());
                if let Some(params) = &op.parameters {
                    descriptor.parameters = params.clone();
                }
                descriptor
            })
            .collect())
    }

    async fn invoke(
        &self,
        operation: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<Vec<EvidenceRecord>, SourceFault> {
        let fixture = self.fixture().await?;
        let op = fixture.operations.get(operation).ok_or_else(|| {
            SourceFault::OperationNotFound(format!("{}: {}", self.name, operation))
        })?;

        if op.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(op.latency_ms)).await;
        }

        let needle = op
            .filter_param
            .as_ref()
            .and_then(|p| params.get(p))
            .map(|v| search_terms(v));

        Ok(op
            .records
            .iter()
            .filter(|r| match &needle {
                Some(terms) => matches_terms(r, terms),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn close(&self) {
        if let Ok(mut guard) = self.loaded.write() {
            *guard = None;
        }
    }
}

fn search_terms(value: &str) -> Vec<String> {
    value
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(|w| w.to_lowercase())
        .collect()
}

fn matches_terms(record: &EvidenceRecord, terms: &[String]) -> bool {
    if terms.is_empty() {
        return true;
    }
    let mut haystack = record.title.to_lowercase();
    if let Some(Value::Array(keywords)) = record.citation_metadata.get("keywords") {
        for k in keywords.iter().filter_map(|k| k.as_str()) {
            haystack.push(' ');
            haystack.push_str(&k.to_lowercase());
        }
    }
    terms.iter().any(|t| haystack.contains(t.as_str()))
}
