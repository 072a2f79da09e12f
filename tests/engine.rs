//! End-to-end tests of the federated search engine.
//!
//! Sources here are scripted in memory: each operation replays a list of
//! steps (delay + result), and every call is logged so tests can assert what
//! was dispatched, when, and with which parameters. Timing tests run on
//! tokio's paused clock.

use async_trait::async_trait;
use clinical_evidence::config::parse_config;
use clinical_evidence::error::SourceFault;
use clinical_evidence::traits::{EvidenceSource, SourceCatalog};
use clinical_evidence::{EngineContext, FederatedSearchEngine, SearchRequest};
use evidence_core::models::{ConnectionStatus, EvidenceRecord, ToolDescriptor};
use evidence_core::policy::StopReason;
use evidence_core::result::{CallOutcome, FaultKind, TierStatus};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

// ─── Scripted Source ────────────────────────────────────────────────

#[derive(Clone)]
struct Step {
    delay: Duration,
    result: Result<Vec<EvidenceRecord>, SourceFault>,
}

fn ok(records: Vec<EvidenceRecord>) -> Step {
    Step {
        delay: Duration::ZERO,
        result: Ok(records),
    }
}

fn slow(secs: u64, records: Vec<EvidenceRecord>) -> Step {
    Step {
        delay: Duration::from_secs(secs),
        result: Ok(records),
    }
}

fn fail(fault: SourceFault) -> Step {
    Step {
        delay: Duration::ZERO,
        result: Err(fault),
    }
}

#[derive(Clone, Debug)]
struct Call {
    params: BTreeMap<String, String>,
    at: Instant,
}

struct ScriptedSource {
    name: String,
    connect_fault: Option<SourceFault>,
    connect_delay: Duration,
    operations: BTreeMap<String, Vec<Step>>,
    log: Mutex<BTreeMap<String, Vec<Call>>>,
    connects: AtomicU32,
    closes: AtomicU32,
}

impl ScriptedSource {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            connect_fault: None,
            connect_delay: Duration::ZERO,
            operations: BTreeMap::new(),
            log: Mutex::new(BTreeMap::new()),
            connects: AtomicU32::new(0),
            closes: AtomicU32::new(0),
        }
    }

    fn op(self, operation: &str, records: Vec<EvidenceRecord>) -> Self {
        self.steps(operation, vec![ok(records)])
    }

    fn steps(mut self, operation: &str, steps: Vec<Step>) -> Self {
        self.operations.insert(operation.to_string(), steps);
        self
    }

    fn failing_connect(mut self, fault: SourceFault) -> Self {
        self.connect_fault = Some(fault);
        self
    }

    fn slow_connect(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    fn calls(&self, operation: &str) -> Vec<Call> {
        self.log
            .lock()
            .unwrap()
            .get(operation)
            .cloned()
            .unwrap_or_default()
    }

    fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl EvidenceSource for ScriptedSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), SourceFault> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.connect_delay).await;
        match &self.connect_fault {
            Some(fault) => Err(fault.clone()),
            None => Ok(()),
        }
    }

    async fn discover(&self) -> Result<Vec<ToolDescriptor>, SourceFault> {
        Ok(self
            .operations
            .keys()
            .map(|op| ToolDescriptor::new(op.clone(), "scripted"))
            .collect())
    }

    async fn invoke(
        &self,
        operation: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<Vec<EvidenceRecord>, SourceFault> {
        let steps = self
            .operations
            .get(operation)
            .ok_or_else(|| SourceFault::OperationNotFound(operation.to_string()))?;

        let n = {
            let mut log = self.log.lock().unwrap();
            let calls = log.entry(operation.to_string()).or_default();
            calls.push(Call {
                params: params.clone(),
                at: Instant::now(),
            });
            calls.len() - 1
        };

        let step = steps[n.min(steps.len() - 1)].clone();
        tokio::time::sleep(step.delay).await;
        step.result
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn rec(id: &str) -> EvidenceRecord {
    EvidenceRecord::new(id, format!("Evidence {}", id))
}

fn recs(ids: &[&str]) -> Vec<EvidenceRecord> {
    ids.iter().map(|id| rec(id)).collect()
}

fn engine(config: &str, sources: Vec<Arc<ScriptedSource>>) -> FederatedSearchEngine {
    let config = parse_config(config).unwrap();
    let mut catalog = SourceCatalog::new();
    for source in sources {
        catalog.register(source);
    }
    FederatedSearchEngine::new(Arc::new(EngineContext::new(&config, catalog).unwrap()))
}

fn ids(result: &clinical_evidence::SearchResult) -> Vec<String> {
    result
        .items
        .iter()
        .map(|i| i.external_id.clone().unwrap_or_default())
        .collect()
}

// ─── Configs ────────────────────────────────────────────────────────

/// Three tiers over one source: guidelines, then literature + trials, then preprints.
const CASCADE: &str = r#"
[[regions]]
region_name = "global"
required_sources = ["pubmed"]
min_results_threshold = 2

[[regions.tiers]]
tier_index = 0
[[regions.tiers.search_specs]]
resource_type = "guideline"
operation_name = "search_guidelines"
result_key = "guidelines"
parameter_template = { query = "{scenario}" }

[[regions.tiers]]
tier_index = 1
[[regions.tiers.search_specs]]
resource_type = "literature"
operation_name = "search_literature"
result_key = "papers"
parameter_template = { query = "{scenario}" }
[[regions.tiers.search_specs]]
resource_type = "literature"
operation_name = "search_trials"
result_key = "trials"
parameter_template = { query = "{scenario}" }

[[regions.tiers]]
tier_index = 2
[[regions.tiers.search_specs]]
resource_type = "literature"
operation_name = "search_preprints"
result_key = "preprints"
parameter_template = { query = "{scenario}" }
"#;

/// A single tier with one literature spec over two sources.
const LITERATURE: &str = r#"
[[regions]]
region_name = "global"
required_sources = ["pubmed", "europepmc"]
min_results_threshold = 1

[[regions.tiers]]
tier_index = 0
[[regions.tiers.search_specs]]
resource_type = "literature"
operation_name = "search_literature"
result_key = "papers"
parameter_template = { query = "{scenario}" }
"#;

/// Two regions, each with its own literature source.
const TWO_REGIONS: &str = r#"
[[regions]]
region_name = "global"
required_sources = ["pubmed"]
min_results_threshold = 1

[[regions.tiers]]
tier_index = 0
[[regions.tiers.search_specs]]
resource_type = "literature"
operation_name = "search_literature"
result_key = "papers"
parameter_template = { query = "{scenario}" }

[[regions]]
region_name = "sierra_leone"
country_codes = ["SL"]
required_sources = ["who_afro"]
min_results_threshold = 1

[[regions.tiers]]
tier_index = 0
[[regions.tiers.search_specs]]
resource_type = "literature"
operation_name = "search_literature"
result_key = "papers"
parameter_template = { query = "{scenario}" }
"#;

fn cascade_source() -> ScriptedSource {
    ScriptedSource::new("pubmed")
        .op("search_guidelines", recs(&["g1"]))
        .op("search_literature", vec![])
        .op("search_trials", vec![])
        .op("search_preprints", vec![])
}

// ─── Region resolution ──────────────────────────────────────────────

#[tokio::test]
async fn hints_resolve_to_configured_region_or_default() {
    let config = r#"
[[regions]]
region_name = "global"

[[regions]]
region_name = "uk"
country_codes = ["GB", "UK"]
"#;
    let engine = engine(config, vec![]);
    let ctx = engine.context();
    assert_eq!(ctx.resolve(Some("GB")).region_name, "uk");
    assert_eq!(ctx.resolve(Some("en-GB")).region_name, "uk");
    assert_eq!(ctx.resolve(Some("FR")).region_name, "global");
    assert_eq!(ctx.resolve(Some("")).region_name, "global");
    assert_eq!(ctx.resolve(None).region_name, "global");

    let result = engine
        .search(SearchRequest::new("adult with sepsis").with_region("UK"))
        .await;
    assert_eq!(result.query_context.region_name, "uk");
    assert_eq!(result.query_context.region_hint.as_deref(), Some("UK"));
}

// ─── Cascade ────────────────────────────────────────────────────────

#[tokio::test]
async fn threshold_met_in_tier_zero_skips_later_tiers() {
    let pubmed = cascade_source()
        .op("search_guidelines", recs(&["g1", "g2"]))
        .shared();
    let engine = engine(CASCADE, vec![pubmed.clone()]);

    let result = engine.search_evidence("sepsis", None, &BTreeMap::new()).await;

    assert_eq!(ids(&result), vec!["g1", "g2"]);
    assert_eq!(result.tier_reached, 0);
    assert_eq!(result.diagnostics.stop_reason, Some(StopReason::ThresholdMet));
    assert!(pubmed.calls("search_literature").is_empty());
    assert!(pubmed.calls("search_trials").is_empty());
    assert!(pubmed.calls("search_preprints").is_empty());
    assert_eq!(result.diagnostics.tiers.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn escalation_merges_and_deduplicates_in_dispatch_order() {
    // Literature is dispatched first but finishes last; its copy of the
    // shared record must still win.
    let pubmed = cascade_source()
        .steps("search_literature", vec![slow(2, recs(&["p1", "shared"]))])
        .op("search_trials", recs(&["shared", "t1", "t2"]))
        .shared();
    let engine = engine(CASCADE, vec![pubmed.clone()]);

    let result = engine.search_evidence("sepsis", None, &BTreeMap::new()).await;

    assert_eq!(ids(&result), vec!["g1", "p1", "shared", "t1", "t2"]);
    assert_eq!(result.items.len(), 5);
    assert_eq!(result.tier_reached, 1);
    assert_eq!(result.items[2].result_key, "papers");
    assert_eq!(result.diagnostics.stop_reason, Some(StopReason::ThresholdMet));
    assert!(pubmed.calls("search_preprints").is_empty());

    let tier1 = &result.diagnostics.tiers[1];
    assert_eq!(tier1.dispatched, 2);
    assert_eq!(tier1.items_added, 4);
    assert_eq!(tier1.status, TierStatus::Completed);
}

#[tokio::test]
async fn exhausting_all_tiers_returns_what_was_found() {
    let pubmed = cascade_source().shared();
    let engine = engine(CASCADE, vec![pubmed.clone()]);

    let result = engine.search_evidence("rare disease", None, &BTreeMap::new()).await;

    assert_eq!(ids(&result), vec!["g1"]);
    assert_eq!(result.tier_reached, 2);
    assert_eq!(result.diagnostics.stop_reason, Some(StopReason::LastTier));
    assert_eq!(result.diagnostics.tiers.len(), 3);
    assert!(!result.diagnostics.timed_out);
    assert_eq!(pubmed.calls("search_preprints").len(), 1);
}

#[tokio::test]
async fn disabled_fallback_stops_after_first_tier() {
    let config = CASCADE.replace(
        "min_results_threshold = 2",
        "min_results_threshold = 2\nfallback_enabled = false",
    );
    let pubmed = cascade_source().shared();
    let engine = engine(&config, vec![pubmed.clone()]);

    let result = engine.search_evidence("sepsis", None, &BTreeMap::new()).await;

    assert_eq!(result.tier_reached, 0);
    assert_eq!(result.diagnostics.stop_reason, Some(StopReason::FallbackDisabled));
    assert!(pubmed.calls("search_literature").is_empty());
}

#[tokio::test]
async fn at_or_below_boundary_escalates_on_exact_threshold() {
    let config = CASCADE.replace(
        "min_results_threshold = 2",
        "min_results_threshold = 2\nescalation = \"at_or_below\"",
    );
    let pubmed = cascade_source()
        .op("search_guidelines", recs(&["g1", "g2"]))
        .op("search_literature", recs(&["p1"]))
        .shared();
    let engine = engine(&config, vec![pubmed.clone()]);

    let result = engine.search_evidence("sepsis", None, &BTreeMap::new()).await;

    assert_eq!(result.tier_reached, 1);
    assert_eq!(ids(&result), vec!["g1", "g2", "p1"]);
}

#[tokio::test]
async fn region_without_tiers_returns_empty_result() {
    let config = r#"
[[regions]]
region_name = "global"
required_sources = ["pubmed"]
"#;
    let engine = engine(config, vec![cascade_source().shared()]);

    let result = engine.search_evidence("sepsis", None, &BTreeMap::new()).await;

    assert!(result.items.is_empty());
    assert_eq!(result.tier_reached, 0);
    assert_eq!(result.diagnostics.stop_reason, Some(StopReason::NoTiers));
    assert!(result.diagnostics.tiers.is_empty());
}

// ─── Concurrency and timing ─────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn sibling_specs_run_concurrently() {
    let pubmed = cascade_source()
        .steps("search_literature", vec![slow(3, recs(&["p1"]))])
        .steps("search_trials", vec![slow(3, recs(&["t1"]))])
        .op("search_guidelines", vec![])
        .shared();
    let engine = engine(CASCADE, vec![pubmed.clone()]);

    let started = Instant::now();
    let result = engine.search_evidence("sepsis", None, &BTreeMap::new()).await;
    let elapsed = started.elapsed();

    assert_eq!(result.tier_reached, 1);
    assert!(elapsed >= Duration::from_secs(3), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(4), "elapsed {:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_is_retried_after_base_delay() {
    let pubmed = ScriptedSource::new("pubmed")
        .steps(
            "search_literature",
            vec![
                fail(SourceFault::Transient("connection reset".into())),
                ok(recs(&["p1"])),
            ],
        )
        .shared();
    let europepmc = ScriptedSource::new("europepmc").shared();
    let engine = engine(LITERATURE, vec![pubmed.clone(), europepmc]);

    let result = engine.search_evidence("sepsis", None, &BTreeMap::new()).await;

    assert_eq!(ids(&result), vec!["p1"]);
    let calls = pubmed.calls("search_literature");
    assert_eq!(calls.len(), 2);
    let gap = calls[1].at - calls[0].at;
    assert!(gap >= Duration::from_secs(5), "gap {:?}", gap);
    assert!(gap < Duration::from_secs(10) + Duration::from_millis(100), "gap {:?}", gap);

    assert_eq!(result.diagnostics.calls[0].attempts, 2);
    assert_eq!(result.diagnostics.retry_count(), 1);
    assert!(result.diagnostics.errors.is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_calls_time_out_as_transient_faults() {
    let config = format!("[engine]\ncall_timeout_secs = 1\n{}", LITERATURE);
    let pubmed = ScriptedSource::new("pubmed")
        .steps("search_literature", vec![slow(5, recs(&["p1"]))])
        .shared();
    let engine = engine(&config, vec![pubmed.clone()]);

    let result = engine.search_evidence("sepsis", None, &BTreeMap::new()).await;

    assert!(result.items.is_empty());
    let call = &result.diagnostics.calls[0];
    assert_eq!(call.attempts, 3);
    match &call.outcome {
        CallOutcome::Failed { fault, message } => {
            assert_eq!(*fault, FaultKind::Transient);
            assert!(message.contains("timed out"), "{}", message);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(pubmed.calls("search_literature").len(), 3);
}

#[tokio::test(start_paused = true)]
async fn deadline_mid_tier_keeps_completed_calls() {
    let pubmed = cascade_source()
        .steps("search_guidelines", vec![slow(60, recs(&["g-slow"]))])
        .shared();
    let fast = ScriptedSource::new("nice")
        .steps("search_summaries", vec![Step {
            delay: Duration::from_millis(100),
            result: Ok(recs(&["s1"])),
        }])
        .shared();
    let config = r#"
[[regions]]
region_name = "global"
required_sources = ["nice", "pubmed"]

[[regions.tiers]]
tier_index = 0
[[regions.tiers.search_specs]]
resource_type = "guideline"
operation_name = "search_summaries"
result_key = "summaries"
[[regions.tiers.search_specs]]
resource_type = "guideline"
operation_name = "search_guidelines"
result_key = "guidelines"

[[regions.tiers]]
tier_index = 1
[[regions.tiers.search_specs]]
resource_type = "literature"
operation_name = "search_literature"
result_key = "papers"
"#;
    let engine = engine(config, vec![pubmed.clone(), fast]);

    let started = Instant::now();
    let result = engine
        .search(SearchRequest::new("sepsis").with_deadline(Duration::from_secs(5)))
        .await;

    assert!(started.elapsed() < Duration::from_secs(6));
    assert!(result.diagnostics.timed_out);
    assert_eq!(result.diagnostics.stop_reason, Some(StopReason::DeadlineExpired));
    assert_eq!(ids(&result), vec!["s1"]);
    assert_eq!(result.tier_reached, 0);
    assert_eq!(result.diagnostics.tiers[0].status, TierStatus::Cancelled);
    assert_eq!(result.diagnostics.tiers[0].cancelled, 1);
    let slow_call = result
        .diagnostics
        .calls
        .iter()
        .find(|c| c.operation_name == "search_guidelines")
        .unwrap();
    assert_eq!(slow_call.outcome, CallOutcome::Cancelled);
    assert!(pubmed.calls("search_literature").is_empty());
}

#[tokio::test(start_paused = true)]
async fn deadline_while_connecting_returns_empty_result() {
    let pubmed = cascade_source().slow_connect(Duration::from_secs(10)).shared();
    let engine = engine(CASCADE, vec![pubmed]);

    let result = engine
        .search(SearchRequest::new("sepsis").with_deadline(Duration::from_secs(2)))
        .await;

    assert!(result.diagnostics.timed_out);
    assert!(result.items.is_empty());
    assert!(result.diagnostics.tiers.is_empty());
}

#[tokio::test]
async fn concurrent_requests_share_one_connection() {
    let pubmed = cascade_source()
        .op("search_guidelines", recs(&["g1", "g2"]))
        .shared();
    let engine = engine(CASCADE, vec![pubmed.clone()]);
    let overrides = BTreeMap::new();

    let (a, b) = tokio::join!(
        engine.search_evidence("sepsis", None, &overrides),
        engine.search_evidence("asthma", None, &overrides),
    );

    assert_eq!(a.items.len(), 2);
    assert_eq!(b.items.len(), 2);
    assert_ne!(a.query_context.request_id, b.query_context.request_id);
    assert_eq!(pubmed.connects.load(Ordering::SeqCst), 1);
    assert_eq!(pubmed.calls("search_guidelines").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn slow_connect_in_one_region_does_not_block_another() {
    let pubmed = ScriptedSource::new("pubmed")
        .op("search_literature", recs(&["p1"]))
        .shared();
    let who_afro = ScriptedSource::new("who_afro")
        .op("search_literature", recs(&["w1"]))
        .slow_connect(Duration::from_secs(10))
        .shared();
    let engine = engine(TWO_REGIONS, vec![pubmed.clone(), who_afro.clone()]);

    let warm = engine.search_evidence("warm up", None, &BTreeMap::new()).await;
    assert_eq!(ids(&warm), vec!["p1"]);

    let (slow, fast) = tokio::join!(
        engine.search(SearchRequest::new("malaria").with_region("SL")),
        engine.search(SearchRequest::new("sepsis").with_deadline(Duration::from_secs(2))),
    );

    assert!(!fast.diagnostics.timed_out);
    assert_eq!(ids(&fast), vec!["p1"]);
    assert!(fast.diagnostics.elapsed_ms < 1000, "{}ms", fast.diagnostics.elapsed_ms);

    assert_eq!(ids(&slow), vec!["w1"]);
    assert!(slow.diagnostics.elapsed_ms >= 10_000);
    assert_eq!(pubmed.connects.load(Ordering::SeqCst), 1);
    assert_eq!(who_afro.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn abandoned_connect_still_fills_the_cache() {
    let pubmed = cascade_source().slow_connect(Duration::from_secs(10)).shared();
    let engine = engine(CASCADE, vec![pubmed.clone()]);

    let first = engine
        .search(SearchRequest::new("sepsis").with_deadline(Duration::from_secs(2)))
        .await;
    assert!(first.diagnostics.timed_out);

    let second = engine.search_evidence("sepsis", None, &BTreeMap::new()).await;
    assert_eq!(ids(&second), vec!["g1"]);
    assert_eq!(pubmed.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unrepresentable_deadline_means_no_deadline() {
    let pubmed = cascade_source()
        .op("search_guidelines", recs(&["g1", "g2"]))
        .shared();
    let engine = engine(CASCADE, vec![pubmed]);

    let result = engine
        .search(SearchRequest::new("sepsis").with_deadline(Duration::from_secs(u64::MAX)))
        .await;

    assert!(!result.diagnostics.timed_out);
    assert_eq!(ids(&result), vec!["g1", "g2"]);
}

// ─── Faults and routing ─────────────────────────────────────────────

#[tokio::test]
async fn auth_fault_removes_source_from_routing() {
    let pubmed = ScriptedSource::new("pubmed")
        .steps("search_literature", vec![fail(SourceFault::Auth("401 token expired".into()))])
        .shared();
    let europepmc = ScriptedSource::new("europepmc")
        .op("search_literature", recs(&["e1"]))
        .shared();
    let engine = engine(LITERATURE, vec![pubmed.clone(), europepmc.clone()]);

    let first = engine.search_evidence("sepsis", None, &BTreeMap::new()).await;
    assert!(first.items.is_empty());
    assert_eq!(first.diagnostics.calls[0].attempts, 1);
    assert_eq!(first.diagnostics.calls[0].source_name.as_deref(), Some("pubmed"));
    let pubmed_report = first
        .diagnostics
        .connections
        .iter()
        .find(|c| c.source_name == "pubmed")
        .unwrap();
    assert_eq!(pubmed_report.status, ConnectionStatus::Failed);
    assert_eq!(pubmed.closes.load(Ordering::SeqCst), 1);

    let second = engine.search_evidence("sepsis", None, &BTreeMap::new()).await;
    assert_eq!(ids(&second), vec!["e1"]);
    assert_eq!(second.diagnostics.calls[0].source_name.as_deref(), Some("europepmc"));
    assert_eq!(pubmed.calls("search_literature").len(), 1);

    engine.context().shutdown().await;
    assert_eq!(pubmed.closes.load(Ordering::SeqCst), 1);
    assert_eq!(europepmc.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn protocol_faults_are_not_retried() {
    let pubmed = ScriptedSource::new("pubmed")
        .steps("search_literature", vec![fail(SourceFault::Protocol("missing result".into()))])
        .shared();
    let engine = engine(LITERATURE, vec![pubmed.clone()]);

    let result = engine.search_evidence("sepsis", None, &BTreeMap::new()).await;

    assert!(result.items.is_empty());
    assert_eq!(pubmed.calls("search_literature").len(), 1);
    assert_eq!(result.diagnostics.errors.len(), 2);
    assert!(result
        .diagnostics
        .errors
        .iter()
        .any(|e| e.contains("protocol") && e.contains("missing result")));
}

#[tokio::test]
async fn failed_connection_falls_back_to_next_source() {
    let pubmed = ScriptedSource::new("pubmed")
        .op("search_literature", recs(&["p1"]))
        .failing_connect(SourceFault::Transient("connection refused".into()))
        .shared();
    let europepmc = ScriptedSource::new("europepmc")
        .op("search_literature", recs(&["e1"]))
        .shared();
    let engine = engine(LITERATURE, vec![pubmed.clone(), europepmc]);

    let result = engine.search_evidence("sepsis", None, &BTreeMap::new()).await;

    assert_eq!(ids(&result), vec!["e1"]);
    assert!(pubmed.calls("search_literature").is_empty());
    assert!(result
        .diagnostics
        .errors
        .iter()
        .any(|e| e.contains("pubmed") && e.contains("connection refused")));
    assert_eq!(result.diagnostics.connections[0].status, ConnectionStatus::Failed);
    assert_eq!(result.diagnostics.connections[1].status, ConnectionStatus::Connected);
}

#[tokio::test]
async fn unroutable_specs_are_skipped() {
    let config = r#"
[[regions]]
region_name = "global"
required_sources = ["pubmed"]
min_results_threshold = 1

[[regions.tiers]]
tier_index = 0
[[regions.tiers.search_specs]]
resource_type = "treatment"
operation_name = "search_formulary"
result_key = "drugs"
[[regions.tiers.search_specs]]
resource_type = "literature"
operation_name = "search_literature"
result_key = "papers"
"#;
    let pubmed = ScriptedSource::new("pubmed")
        .op("search_literature", recs(&["p1"]))
        .shared();
    let engine = engine(config, vec![pubmed]);

    let result = engine.search_evidence("sepsis", None, &BTreeMap::new()).await;

    assert_eq!(ids(&result), vec!["p1"]);
    let skipped = &result.diagnostics.calls[0];
    assert_eq!(skipped.operation_name, "search_formulary");
    assert!(skipped.source_name.is_none());
    assert!(matches!(
        skipped.outcome,
        CallOutcome::Skipped { fault: FaultKind::NotRoutable, .. }
    ));
    let tier = &result.diagnostics.tiers[0];
    assert_eq!(tier.skipped, 1);
    assert_eq!(tier.status, TierStatus::Degraded);
    assert!(!result.diagnostics.required_failed);
}

#[tokio::test]
async fn failing_required_spec_marks_tier_failed() {
    let config = CASCADE.replace(
        "operation_name = \"search_guidelines\"",
        "operation_name = \"search_guidelines\"\nrequired = true",
    );
    let pubmed = cascade_source()
        .steps("search_guidelines", vec![fail(SourceFault::OperationNotFound("gone".into()))])
        .op("search_literature", recs(&["p1", "p2"]))
        .shared();
    let engine = engine(&config, vec![pubmed]);

    let result = engine.search_evidence("sepsis", None, &BTreeMap::new()).await;

    assert_eq!(result.diagnostics.tiers[0].status, TierStatus::Failed);
    assert!(result.diagnostics.required_failed);
    // A failed tier still escalates like an empty one.
    assert_eq!(result.tier_reached, 1);
    assert_eq!(ids(&result), vec!["p1", "p2"]);
}

#[tokio::test]
async fn fan_out_specs_call_every_source_in_priority_order() {
    let config = LITERATURE.replace(
        "result_key = \"papers\"",
        "result_key = \"papers\"\nfan_out = true",
    );
    let pubmed = ScriptedSource::new("pubmed")
        .steps("search_literature", vec![Step {
            delay: Duration::from_millis(50),
            result: Ok(recs(&["a", "b"])),
        }])
        .shared();
    let europepmc = ScriptedSource::new("europepmc")
        .op("search_literature", recs(&["c"]))
        .shared();
    let engine = engine(&config, vec![pubmed, europepmc]);

    let result = engine.search_evidence("sepsis", None, &BTreeMap::new()).await;

    assert_eq!(ids(&result), vec!["a", "b", "c"]);
    let sources: Vec<_> = result
        .diagnostics
        .calls
        .iter()
        .map(|c| c.source_name.clone().unwrap())
        .collect();
    assert_eq!(sources, vec!["pubmed", "europepmc"]);
    assert_eq!(result.diagnostics.tiers[0].dispatched, 2);
}

#[tokio::test]
async fn identical_records_from_different_sources_are_both_kept() {
    let config = LITERATURE.replace(
        "result_key = \"papers\"",
        "result_key = \"papers\"\nfan_out = true",
    );
    let pubmed = ScriptedSource::new("pubmed")
        .op("search_literature", recs(&["PMC1"]))
        .shared();
    let europepmc = ScriptedSource::new("europepmc")
        .op("search_literature", recs(&["PMC1"]))
        .shared();
    let engine = engine(&config, vec![pubmed, europepmc]);

    let result = engine.search_evidence("sepsis", None, &BTreeMap::new()).await;

    assert_eq!(result.items.len(), 2);
    assert_eq!(result.items[0].source_name, "pubmed");
    assert_eq!(result.items[1].source_name, "europepmc");
}

// ─── Templates ──────────────────────────────────────────────────────

#[tokio::test]
async fn templates_render_scenario_and_overrides() {
    let config = r#"
[[regions]]
region_name = "global"
required_sources = ["pubmed"]

[[regions.tiers]]
tier_index = 0
[[regions.tiers.search_specs]]
resource_type = "literature"
operation_name = "search_literature"
result_key = "papers"
parameter_template = { query = "{scenario}", population = "{population}", filter = "{{raw}}" }
[[regions.tiers.search_specs]]
resource_type = "literature"
operation_name = "search_trials"
result_key = "trials"
parameter_template = { query = "{scenario} {phase}" }
"#;
    let pubmed = ScriptedSource::new("pubmed")
        .op("search_literature", recs(&["p1"]))
        .op("search_trials", recs(&["t1"]))
        .shared();
    let engine = engine(config, vec![pubmed.clone()]);

    let result = engine
        .search(SearchRequest::new("UTI in pregnancy").with_override("population", "pregnant"))
        .await;

    let calls = pubmed.calls("search_literature");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].params["query"], "UTI in pregnancy");
    assert_eq!(calls[0].params["population"], "pregnant");
    assert_eq!(calls[0].params["filter"], "{raw}");

    assert!(pubmed.calls("search_trials").is_empty());
    let skipped = result
        .diagnostics
        .calls
        .iter()
        .find(|c| c.operation_name == "search_trials")
        .unwrap();
    assert!(matches!(
        skipped.outcome,
        CallOutcome::Skipped { fault: FaultKind::InvalidTemplate, .. }
    ));
    assert_eq!(ids(&result), vec!["p1"]);
}

// ─── Session lifecycle ──────────────────────────────────────────────

#[tokio::test]
async fn sessions_are_cached_until_shutdown() {
    let pubmed = cascade_source()
        .op("search_guidelines", recs(&["g1", "g2"]))
        .shared();
    let engine = engine(CASCADE, vec![pubmed.clone()]);

    engine.search_evidence("a", None, &BTreeMap::new()).await;
    engine.search_evidence("b", None, &BTreeMap::new()).await;
    assert_eq!(pubmed.connects.load(Ordering::SeqCst), 1);

    engine.context().shutdown().await;
    assert_eq!(pubmed.closes.load(Ordering::SeqCst), 1);
    assert!(engine.context().connections().await.is_empty());

    let result = engine.search_evidence("c", None, &BTreeMap::new()).await;
    assert_eq!(result.items.len(), 2);
    assert_eq!(pubmed.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failed_sources_stay_failed_until_reset() {
    let pubmed = ScriptedSource::new("pubmed")
        .op("search_literature", recs(&["p1"]))
        .failing_connect(SourceFault::Transient("connection refused".into()))
        .shared();
    let europepmc = ScriptedSource::new("europepmc").shared();
    let engine = engine(LITERATURE, vec![pubmed.clone(), europepmc]);

    engine.search_evidence("a", None, &BTreeMap::new()).await;
    engine.search_evidence("b", None, &BTreeMap::new()).await;
    assert_eq!(pubmed.connects.load(Ordering::SeqCst), 1);

    assert_eq!(engine.context().reset_failed().await, 1);
    engine.search_evidence("c", None, &BTreeMap::new()).await;
    assert_eq!(pubmed.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unregistered_sources_are_reported_not_fatal() {
    let engine = engine(LITERATURE, vec![]);

    let result = engine.search_evidence("sepsis", None, &BTreeMap::new()).await;

    assert!(result.items.is_empty());
    assert_eq!(result.diagnostics.connections.len(), 2);
    assert!(result
        .diagnostics
        .connections
        .iter()
        .all(|c| c.status == ConnectionStatus::Failed));
    assert!(matches!(
        result.diagnostics.calls[0].outcome,
        CallOutcome::Skipped { fault: FaultKind::NotRoutable, .. }
    ));
}
