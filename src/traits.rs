//! The knowledge-source capability trait and the source catalog.
//!
//! Every external knowledge source (a guideline service, a drug formulary,
//! a literature index) is reached through [`EvidenceSource`]. The engine
//! never inspects a source's transport; it only calls the four capability
//! methods below.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │              SourceCatalog               │
//! │  ┌─────────┐ ┌─────────┐ ┌────────────┐  │
//! │  │  HTTP   │ │ Fixture │ │  Custom    │  │
//! │  │ sources │ │ (JSON)  │ │  (Rust)    │  │
//! │  └─────────┘ └─────────┘ └────────────┘  │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!     ConnectionManager::connect() → ToolRegistry::discover()
//! ```
//!
//! # Usage
//!
//! ```rust
//! use clinical_evidence::traits::SourceCatalog;
//!
//! let mut sources = SourceCatalog::new();
//! // sources.register(Arc::new(MySource::new()));
//! assert!(sources.is_empty());
//! ```

use anyhow::Result;
use async_trait::async_trait;
use evidence_core::models::{EvidenceRecord, ToolDescriptor};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{Config, SourceConfig};
use crate::error::SourceFault;

// ═══════════════════════════════════════════════════════════════════════
// EvidenceSource Trait
// ═══════════════════════════════════════════════════════════════════════

/// A knowledge source the engine can connect to, discover, and invoke.
///
/// # Lifecycle
///
/// 1. The source is registered in a [`SourceCatalog`].
/// 2. [`connect`](EvidenceSource::connect) is called once per engine session.
/// 3. [`discover`](EvidenceSource::discover) lists the operations it serves.
/// 4. [`invoke`](EvidenceSource::invoke) is called for every routed search.
/// 5. [`close`](EvidenceSource::close) is called on engine shutdown.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use clinical_evidence::error::SourceFault;
/// use clinical_evidence::traits::EvidenceSource;
/// use evidence_core::models::{EvidenceRecord, ToolDescriptor};
/// use std::collections::BTreeMap;
///
/// pub struct FormularySource;
///
/// #[async_trait]
/// impl EvidenceSource for FormularySource {
///     fn name(&self) -> &str { "formulary" }
///
///     async fn discover(&self) -> Result<Vec<ToolDescriptor>, SourceFault> {
///         Ok(vec![ToolDescriptor::new("search_treatments", "Drug monographs")])
///     }
///
///     async fn invoke(
///         &self,
///         operation: &str,
///         _params: &BTreeMap<String, String>,
///     ) -> Result<Vec<EvidenceRecord>, SourceFault> {
///         match operation {
///             "search_treatments" => Ok(vec![]),
///             other => Err(SourceFault::OperationNotFound(other.to_string())),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait EvidenceSource: Send + Sync {
    /// Source id, matching the key used in `required_sources`.
    fn name(&self) -> &str;

    /// Transport type (e.g. `"http"`, `"fixture"`). Custom sources default to `"custom"`.
    fn source_type(&self) -> &str {
        "custom"
    }

    /// Establish the transport. Sources without a handshake keep the default.
    async fn connect(&self) -> Result<(), SourceFault> {
        Ok(())
    }

    /// List the operations this source serves.
    async fn discover(&self) -> Result<Vec<ToolDescriptor>, SourceFault>;

    /// Run `operation` with string parameters and return evidence records.
    async fn invoke(
        &self,
        operation: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<Vec<EvidenceRecord>, SourceFault>;

    /// Release transport resources.
    async fn close(&self) {}
}

// ═══════════════════════════════════════════════════════════════════════
// Source Catalog
// ═══════════════════════════════════════════════════════════════════════

/// All sources the engine knows how to reach, keyed by source id.
///
/// Use [`SourceCatalog::from_config`] to build the configured HTTP and
/// fixture sources, then optionally [`register`](SourceCatalog::register)
/// custom ones.
pub struct SourceCatalog {
    sources: Vec<Arc<dyn EvidenceSource>>,
}

impl SourceCatalog {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
        }
    }

    /// Build every source declared under `[sources]`.
    pub fn from_config(config: &Config) -> Result<Self> {
        use crate::source_fixture::FixtureSource;
        use crate::source_http::HttpSource;

        let mut catalog = Self::new();
        for (name, cfg) in &config.sources {
            match cfg {
                SourceConfig::Http(http) => {
                    catalog.register(Arc::new(HttpSource::new(name.clone(), http.clone())?));
                }
                SourceConfig::Fixture(fixture) => {
                    catalog.register(Arc::new(FixtureSource::new(
                        name.clone(),
                        fixture.path.clone(),
                    )));
                }
            }
        }
        Ok(catalog)
    }

    /// Register a source. A source with the same name is replaced.
    pub fn register(&mut self, source: Arc<dyn EvidenceSource>) {
        self.sources.retain(|s| s.name() != source.name());
        self.sources.push(source);
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn EvidenceSource>> {
        self.sources.iter().find(|s| s.name() == name).cloned()
    }

    pub fn sources(&self) -> &[Arc<dyn EvidenceSource>] {
        &self.sources
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }
}

impl Default for SourceCatalog {
    fn default() -> Self {
        Self::new()
    }
}
