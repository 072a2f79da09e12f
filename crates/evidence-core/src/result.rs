//! Search results and diagnostics.
//!
//! A [`SearchResult`] is always returned, even when nothing was found or the
//! deadline expired. [`Diagnostics`] carries enough detail to explain the
//! outcome: which sources connected, which calls failed or were skipped and
//! why, how many attempts each call took, and whether the deadline fired.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::models::{ConnectionStatus, EvidenceItem};
use crate::policy::StopReason;

/// Classified failure category, as reported in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Transient,
    Protocol,
    Auth,
    OperationNotFound,
    NotRoutable,
    InvalidTemplate,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FaultKind::Transient => "transient",
            FaultKind::Protocol => "protocol",
            FaultKind::Auth => "auth",
            FaultKind::OperationNotFound => "operation_not_found",
            FaultKind::NotRoutable => "not_routable",
            FaultKind::InvalidTemplate => "invalid_template",
        };
        f.write_str(s)
    }
}

/// What the caller asked for, echoed back on the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryContext {
    pub request_id: Uuid,
    pub scenario_text: String,
    pub region_hint: Option<String>,
    /// Name of the region the hint resolved to.
    pub region_name: String,
    pub overrides: BTreeMap<String, String>,
    pub started_at: DateTime<Utc>,
}

/// How a single dispatched (or skipped) call ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallOutcome {
    Succeeded { items: usize },
    Failed { fault: FaultKind, message: String },
    Skipped { fault: FaultKind, message: String },
    Cancelled,
}

impl CallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Succeeded { .. })
    }
}

/// Per-call diagnostic record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallReport {
    pub tier_index: u32,
    pub result_key: String,
    pub operation_name: String,
    /// `None` when the spec was skipped before a source was chosen.
    pub source_name: Option<String>,
    pub required: bool,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub outcome: CallOutcome,
}

/// Overall state of a tier after fan-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierStatus {
    Completed,
    /// Some optional units failed.
    Degraded,
    /// A required spec failed, or a required tier produced no successful call.
    Failed,
    /// The deadline expired during fan-in.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierReport {
    pub tier_index: u32,
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub items_added: usize,
    pub elapsed_ms: u64,
    pub status: TierStatus,
}

/// Connection state of one source at the time of the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionReport {
    pub source_name: String,
    pub status: ConnectionStatus,
    pub last_error: Option<String>,
    pub operations: Vec<String>,
    pub connect_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub timed_out: bool,
    /// A required spec or required tier failed. Tiers that only lost
    /// optional calls report `TierStatus::Degraded` without setting this.
    pub required_failed: bool,
    pub stop_reason: Option<StopReason>,
    pub connections: Vec<ConnectionReport>,
    pub tiers: Vec<TierReport>,
    pub calls: Vec<CallReport>,
    /// Human-readable summary of every failure, in the order observed.
    pub errors: Vec<String>,
    pub elapsed_ms: u64,
}

impl Diagnostics {
    /// Total retries across all calls (attempts beyond the first).
    pub fn retry_count(&self) -> u32 {
        self.calls
            .iter()
            .map(|c| c.attempts.saturating_sub(1))
            .sum()
    }

    /// Calls that reached `source_name`.
    pub fn calls_to<'a>(&'a self, source_name: &'a str) -> impl Iterator<Item = &'a CallReport> + 'a {
        self.calls
            .iter()
            .filter(move |c| c.source_name.as_deref() == Some(source_name))
    }

    /// Record a call and mirror any failure into `errors`.
    pub fn record_call(&mut self, report: CallReport) {
        match &report.outcome {
            CallOutcome::Failed { fault, message } | CallOutcome::Skipped { fault, message } => {
                self.errors.push(format!(
                    "tier {} {} via {}: {}: {}",
                    report.tier_index,
                    report.operation_name,
                    report.source_name.as_deref().unwrap_or("-"),
                    fault,
                    message
                ));
            }
            CallOutcome::Cancelled => {
                self.errors.push(format!(
                    "tier {} {} via {}: cancelled by deadline",
                    report.tier_index,
                    report.operation_name,
                    report.source_name.as_deref().unwrap_or("-"),
                ));
            }
            CallOutcome::Succeeded { .. } => {}
        }
        self.calls.push(report);
    }
}

/// The value returned by every search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub query_context: QueryContext,
    pub tier_reached: u32,
    pub items: Vec<EvidenceItem>,
    pub diagnostics: Diagnostics,
}
