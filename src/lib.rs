//! # Clinical Evidence
//!
//! Region-aware, tiered, federated search over clinical knowledge sources.
//!
//! Given a free-text clinical scenario and an optional region hint, the engine
//! picks the region's source list and tiered search plan, connects to the
//! sources, fans each tier's searches out concurrently, merges and
//! de-duplicates what comes back, and escalates to the next tier only while
//! too little evidence has been found.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌──────────────┐
//! │ RegionTable  │──▶│ ConnectionManager │──▶│ ToolRegistry │
//! │ (hint → plan)│   │ (concurrent, 1x)  │   │ (op → source)│
//! └──────────────┘   └──────────────────┘   └──────┬───────┘
//!                                                  │
//!                       ┌──────────────────────────┘
//!                       ▼
//!            ┌────────────────────────┐   ┌──────────────────┐
//!            │ FederatedSearchEngine  │──▶│ RetryingInvoker  │
//!            │ tier fan-out / fan-in  │   │ (transient only) │
//!            └───────────┬────────────┘   └──────────────────┘
//!                        ▼
//!              merge + dedup → SearchResult
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! evidence regions                          # list configured regions
//! evidence resolve en-GB                    # which region a hint picks
//! evidence sources --region GB              # connect, list operations
//! evidence search "adult with sepsis" --region GB
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Source fault taxonomy |
//! | [`traits`] | `EvidenceSource` trait and source catalog |
//! | [`source_http`] | HTTP tool-protocol source |
//! | [`source_fixture`] | JSON fixture source |
//! | [`connection`] | Source connections and the connection manager |
//! | [`routing`] | Operation discovery and routing table |
//! | [`retry`] | Retry policy and invoker |
//! | [`context`] | Engine context and session cache |
//! | [`engine`] | Federated, tiered search |
//!
//! Data types and the pure algorithms (region resolution, template
//! rendering, fallback policy, aggregation) live in `evidence_core`.

pub mod config;
pub mod connection;
pub mod context;
pub mod engine;
pub mod error;
pub mod retry;
pub mod routing;
pub mod source_fixture;
pub mod source_http;
pub mod traits;

pub use context::EngineContext;
pub use engine::{FederatedSearchEngine, SearchRequest};
pub use evidence_core::result::SearchResult;
