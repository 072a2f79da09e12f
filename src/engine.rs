//! Federated, tiered evidence search.
//!
//! [`FederatedSearchEngine::search_evidence`] turns a free-text clinical
//! scenario into a ranked, de-duplicated list of evidence items:
//!
//! ```text
//! resolve region ─▶ session (connect + discover, cached)
//!                        │
//!          ┌─────────────┴──────────────┐
//!          ▼                            │ escalate
//!   tier N: render templates            │
//!           route each spec             │
//!           fan out (JoinSet) ──▶ fan in ┤
//!           merge in dispatch order     │
//!           policy.decide() ────────────┘─▶ stop
//! ```
//!
//! Tier N+1 is never dispatched before tier N has been merged and evaluated.
//! Calls inside a tier run concurrently and never cancel each other; only
//! the request deadline aborts them.
//!
//! A search never fails. Call faults, unroutable specs, unreachable sources
//! and an expired deadline all end up in [`Diagnostics`], next to whatever
//! items were collected.

use chrono::Utc;
use evidence_core::aggregate::{distinct_count, merge_batch};
use evidence_core::models::{EvidenceItem, ResourceType};
use evidence_core::policy::{CascadingFallbackPolicy, StopReason, TierDecision};
use evidence_core::region::{SearchSpec, TierSpec};
use evidence_core::result::{
    CallOutcome, CallReport, Diagnostics, FaultKind, QueryContext, SearchResult, TierReport,
    TierStatus,
};
use evidence_core::template::render_params;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::SourceConnection;
use crate::context::EngineContext;
use crate::error::SourceFault;
use crate::retry::RetryingInvoker;
use crate::routing::RoutingTable;

/// A search request. Built with [`SearchRequest::new`] and the `with_*` setters.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub scenario_text: String,
    pub region_hint: Option<String>,
    pub overrides: BTreeMap<String, String>,
    /// Overrides the context's default deadline.
    pub deadline: Option<Duration>,
}

impl SearchRequest {
    pub fn new(scenario_text: impl Into<String>) -> Self {
        Self {
            scenario_text: scenario_text.into(),
            ..Self::default()
        }
    }

    pub fn with_region(mut self, region_hint: impl Into<String>) -> Self {
        self.region_hint = Some(region_hint.into());
        self
    }

    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

pub struct FederatedSearchEngine {
    context: Arc<EngineContext>,
}

/// Items from one successful call, tagged with its spec's dedup setting.
struct Batch {
    items: Vec<EvidenceItem>,
    deduplicate: bool,
}

struct CallResult {
    dispatch_index: usize,
    attempts: u32,
    elapsed: Duration,
    result: Result<Vec<EvidenceItem>, SourceFault>,
}

/// How one spec of a tier was planned: skipped up front, or dispatched as
/// one or more calls (by dispatch index).
struct SpecPlan<'a> {
    spec: &'a SearchSpec,
    skipped: Option<(FaultKind, String)>,
    calls: Vec<(usize, String)>,
}

struct TierRun {
    batches: Vec<Batch>,
    calls: Vec<CallReport>,
    report: TierReport,
    timed_out: bool,
}

impl FederatedSearchEngine {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    /// Search with the context's default deadline.
    pub async fn search_evidence(
        &self,
        scenario_text: &str,
        region_hint: Option<&str>,
        overrides: &BTreeMap<String, String>,
    ) -> SearchResult {
        self.search(SearchRequest {
            scenario_text: scenario_text.to_string(),
            region_hint: region_hint.map(str::to_string),
            overrides: overrides.clone(),
            deadline: None,
        })
        .await
    }

    pub async fn search(&self, request: SearchRequest) -> SearchResult {
        let started = Instant::now();
        let region = self.context.resolve(request.region_hint.as_deref());
        // A deadline past the clock's range means no deadline.
        let deadline = request
            .deadline
            .or(self.context.default_deadline())
            .and_then(|d| started.checked_add(d));

        let query_context = QueryContext {
            request_id: Uuid::new_v4(),
            scenario_text: request.scenario_text.clone(),
            region_hint: request.region_hint.clone(),
            region_name: region.region_name.clone(),
            overrides: request.overrides.clone(),
            started_at: Utc::now(),
        };
        info!(
            request_id = %query_context.request_id,
            region = %region.region_name,
            "search started"
        );

        let mut diagnostics = Diagnostics::default();
        let mut items: Vec<EvidenceItem> = Vec::new();
        let mut tier_reached = 0;

        let session = match deadline {
            Some(at) => tokio::time::timeout_at(at, self.context.session(region))
                .await
                .ok(),
            None => Some(self.context.session(region).await),
        };
        let Some(session) = session else {
            warn!(request_id = %query_context.request_id, "deadline expired while connecting");
            diagnostics.timed_out = true;
            diagnostics.stop_reason = Some(StopReason::DeadlineExpired);
            diagnostics
                .errors
                .push("deadline expired while connecting to sources".to_string());
            diagnostics.elapsed_ms = started.elapsed().as_millis() as u64;
            return SearchResult {
                query_context,
                tier_reached,
                items,
                diagnostics,
            };
        };

        for conn in session.connections.iter().filter(|c| !c.is_available()) {
            diagnostics.errors.push(format!(
                "source {} unavailable: {}",
                conn.source_name(),
                conn.last_error().unwrap_or_else(|| "not connected".to_string())
            ));
        }

        let policy = CascadingFallbackPolicy::new(region);
        if policy.tiers().is_empty() {
            diagnostics.stop_reason = Some(StopReason::NoTiers);
        }

        for (position, tier) in policy.tiers().iter().enumerate() {
            if deadline.is_some_and(|at| Instant::now() >= at) {
                diagnostics.timed_out = true;
                diagnostics.stop_reason = Some(StopReason::DeadlineExpired);
                break;
            }
            tier_reached = tier.tier_index;

            let run = self.run_tier(tier, &session.routes, &request, deadline).await;

            let before = items.len();
            for batch in run.batches {
                items = merge_batch(items, batch.items, batch.deduplicate);
            }
            let mut report = run.report;
            report.items_added = items.len() - before;
            if report.status == TierStatus::Failed {
                diagnostics.required_failed = true;
            }
            for call in run.calls {
                diagnostics.record_call(call);
            }
            info!(
                tier = tier.tier_index,
                status = ?report.status,
                dispatched = report.dispatched,
                succeeded = report.succeeded,
                items_added = report.items_added,
                "tier complete"
            );
            diagnostics.tiers.push(report);

            if run.timed_out {
                diagnostics.timed_out = true;
                diagnostics.stop_reason = Some(StopReason::DeadlineExpired);
                break;
            }

            let count = distinct_count(&items);
            match policy.decide(position, count) {
                TierDecision::Stop(reason) => {
                    diagnostics.stop_reason = Some(reason);
                    break;
                }
                TierDecision::Escalate => {
                    debug!(
                        tier = tier.tier_index,
                        count,
                        threshold = region.min_results_threshold,
                        "below threshold, escalating"
                    );
                }
            }
        }

        diagnostics.connections = session.connections.reports();
        diagnostics.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            request_id = %query_context.request_id,
            items = items.len(),
            tier_reached,
            timed_out = diagnostics.timed_out,
            stop_reason = ?diagnostics.stop_reason,
            "search finished"
        );

        SearchResult {
            query_context,
            tier_reached,
            items,
            diagnostics,
        }
    }

    /// Dispatch every spec of `tier` concurrently and wait for all of them,
    /// or for the deadline.
    async fn run_tier(
        &self,
        tier: &TierSpec,
        routes: &RoutingTable,
        request: &SearchRequest,
        deadline: Option<Instant>,
    ) -> TierRun {
        let started = Instant::now();
        let invoker = self.context.invoker();
        let call_timeout = self.context.call_timeout();

        let mut plans: Vec<SpecPlan<'_>> = Vec::with_capacity(tier.search_specs.len());
        let mut dispatched = 0;
        let mut tasks = JoinSet::new();

        for spec in &tier.search_specs {
            let params = match render_params(
                &spec.parameter_template,
                &request.scenario_text,
                &request.overrides,
            ) {
                Ok(params) => params,
                Err(e) => {
                    plans.push(SpecPlan {
                        spec,
                        skipped: Some((FaultKind::InvalidTemplate, e.to_string())),
                        calls: Vec::new(),
                    });
                    continue;
                }
            };

            let targets = routes.route(&spec.operation_name).map(|first| {
                if spec.fan_out {
                    routes.route_all(&spec.operation_name)
                } else {
                    vec![first]
                }
            });
            let targets = match targets {
                Ok(targets) => targets,
                Err(fault) => {
                    debug!(operation = %spec.operation_name, "spec not routable, skipping");
                    plans.push(SpecPlan {
                        spec,
                        skipped: Some((fault.kind(), fault.message().to_string())),
                        calls: Vec::new(),
                    });
                    continue;
                }
            };

            let mut calls = Vec::with_capacity(targets.len());
            for route in targets {
                let dispatch_index = dispatched;
                dispatched += 1;
                calls.push((dispatch_index, route.source_name.clone()));
                tasks.spawn(execute_call(
                    dispatch_index,
                    route.connection,
                    spec.operation_name.clone(),
                    params.clone(),
                    spec.resource_type,
                    spec.result_key.clone(),
                    invoker,
                    call_timeout,
                ));
            }
            plans.push(SpecPlan {
                spec,
                skipped: None,
                calls,
            });
        }

        // Fan-in, bounded by the request deadline.
        let mut results: Vec<Option<CallResult>> = (0..dispatched).map(|_| None).collect();
        let mut timed_out = false;
        loop {
            let joined = match deadline {
                Some(at) => tokio::select! {
                    biased;
                    joined = tasks.join_next() => joined,
                    _ = tokio::time::sleep_until(at) => {
                        timed_out = true;
                        None
                    }
                },
                None => tasks.join_next().await,
            };
            match joined {
                Some(Ok(call)) => {
                    let index = call.dispatch_index;
                    results[index] = Some(call);
                }
                Some(Err(e)) => warn!(tier = tier.tier_index, error = %e, "search task aborted"),
                None => break,
            }
        }
        if timed_out {
            warn!(tier = tier.tier_index, pending = tasks.len(), "deadline expired, cancelling calls");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        // Reports and batches in dispatch order.
        let mut report = TierReport {
            tier_index: tier.tier_index,
            dispatched,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            cancelled: 0,
            items_added: 0,
            elapsed_ms: 0,
            status: TierStatus::Completed,
        };
        let mut batches = Vec::new();
        let mut calls = Vec::new();
        let mut required_spec_failed = false;
        let mut any_success = false;

        for plan in plans {
            let spec = plan.spec;
            let base = |source_name: Option<String>, attempts: u32, elapsed: Duration, outcome: CallOutcome| {
                CallReport {
                    tier_index: tier.tier_index,
                    result_key: spec.result_key.clone(),
                    operation_name: spec.operation_name.clone(),
                    source_name,
                    required: spec.required,
                    attempts,
                    elapsed_ms: elapsed.as_millis() as u64,
                    outcome,
                }
            };

            if let Some((fault, message)) = plan.skipped {
                report.skipped += 1;
                required_spec_failed |= spec.required;
                calls.push(base(None, 0, Duration::ZERO, CallOutcome::Skipped { fault, message }));
                continue;
            }

            let mut spec_succeeded = false;
            for (index, source_name) in plan.calls {
                let entry = match results[index].take() {
                    Some(CallResult {
                        attempts,
                        elapsed,
                        result: Ok(items),
                        ..
                    }) => {
                        report.succeeded += 1;
                        spec_succeeded = true;
                        let count = items.len();
                        batches.push(Batch {
                            items,
                            deduplicate: spec.deduplicate,
                        });
                        base(Some(source_name), attempts, elapsed, CallOutcome::Succeeded { items: count })
                    }
                    Some(CallResult {
                        attempts,
                        elapsed,
                        result: Err(fault),
                        ..
                    }) => {
                        report.failed += 1;
                        base(
                            Some(source_name),
                            attempts,
                            elapsed,
                            CallOutcome::Failed {
                                fault: fault.kind(),
                                message: fault.message().to_string(),
                            },
                        )
                    }
                    None if timed_out => {
                        report.cancelled += 1;
                        base(Some(source_name), 0, started.elapsed(), CallOutcome::Cancelled)
                    }
                    None => {
                        report.failed += 1;
                        base(
                            Some(source_name),
                            0,
                            started.elapsed(),
                            CallOutcome::Failed {
                                fault: FaultKind::Protocol,
                                message: "search task aborted".to_string(),
                            },
                        )
                    }
                };
                calls.push(entry);
            }

            if spec_succeeded {
                any_success = true;
            } else {
                required_spec_failed |= spec.required;
            }
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        report.status = if timed_out {
            TierStatus::Cancelled
        } else if required_spec_failed
            || (tier.required && !tier.search_specs.is_empty() && !any_success)
        {
            TierStatus::Failed
        } else if report.failed + report.skipped > 0 {
            TierStatus::Degraded
        } else {
            TierStatus::Completed
        };

        TierRun {
            batches,
            calls,
            report,
            timed_out,
        }
    }
}

/// One routed call: retried, bounded per attempt by `call_timeout`.
#[allow(clippy::too_many_arguments)]
async fn execute_call(
    dispatch_index: usize,
    connection: Arc<SourceConnection>,
    operation: String,
    params: BTreeMap<String, String>,
    resource_type: ResourceType,
    result_key: String,
    invoker: RetryingInvoker,
    call_timeout: Duration,
) -> CallResult {
    let started = Instant::now();
    let label = format!("{}:{}", connection.source_name(), operation);

    let outcome = invoker
        .invoke_with_retry(&label, || {
            let connection = connection.clone();
            let operation = operation.clone();
            let params = params.clone();
            async move {
                match tokio::time::timeout(call_timeout, connection.invoke(&operation, &params)).await {
                    Ok(result) => result,
                    Err(_) => Err(SourceFault::Transient(format!(
                        "call timed out after {}s",
                        call_timeout.as_secs_f64()
                    ))),
                }
            }
        })
        .await;

    if let Err(fault) = &outcome.result {
        warn!(call = %label, attempts = outcome.attempts, error = %fault, "call failed");
        if fault.is_permanent() {
            connection.mark_failed(fault);
            connection.close().await;
        }
    }

    let retrieved_at = Utc::now();
    let result = outcome.result.map(|records| {
        records
            .into_iter()
            .map(|r| {
                EvidenceItem::from_record(
                    r,
                    connection.source_name(),
                    resource_type,
                    &result_key,
                    retrieved_at,
                )
            })
            .collect()
    });

    CallResult {
        dispatch_index,
        attempts: outcome.attempts,
        elapsed: started.elapsed(),
        result,
    }
}
