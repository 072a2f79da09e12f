//! Cascading fallback policy.
//!
//! After each tier's fan-in the engine asks the policy whether to stop or
//! escalate. The policy stops when any of these hold:
//!
//! 1. the cumulative distinct item count is past the escalation boundary,
//! 2. the tier just run is the last configured tier,
//! 3. fallback is disabled for the region.
//!
//! A tier whose calls all failed is indistinguishable here from one that
//! legitimately found nothing; only the count matters.

use serde::{Deserialize, Serialize};

use crate::region::{EscalationBoundary, RegionConfig, TierSpec};

/// Why the cascade stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    ThresholdMet,
    LastTier,
    FallbackDisabled,
    NoTiers,
    DeadlineExpired,
}

/// Outcome of evaluating a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierDecision {
    Stop(StopReason),
    Escalate,
}

/// The tiered plan of one region plus its stop rule.
#[derive(Debug, Clone, Copy)]
pub struct CascadingFallbackPolicy<'a> {
    region: &'a RegionConfig,
}

impl<'a> CascadingFallbackPolicy<'a> {
    pub fn new(region: &'a RegionConfig) -> Self {
        Self { region }
    }

    /// Tiers in execution order.
    pub fn tiers(&self) -> &'a [TierSpec] {
        &self.region.tiers
    }

    /// Whether `count` items are still short of the threshold.
    pub fn needs_more(&self, count: usize) -> bool {
        let threshold = self.region.min_results_threshold;
        match self.region.escalation {
            EscalationBoundary::Below => count < threshold,
            EscalationBoundary::AtOrBelow => count <= threshold,
        }
    }

    /// Decide after running the tier at `position` (position in `tiers()`,
    /// not its `tier_index`) with `count` cumulative distinct items.
    pub fn decide(&self, position: usize, count: usize) -> TierDecision {
        if !self.needs_more(count) {
            TierDecision::Stop(StopReason::ThresholdMet)
        } else if position + 1 >= self.region.tiers.len() {
            TierDecision::Stop(StopReason::LastTier)
        } else if !self.region.fallback_enabled {
            TierDecision::Stop(StopReason::FallbackDisabled)
        } else {
            TierDecision::Escalate
        }
    }
}
