//! Region configuration and resolution.
//!
//! A [`RegionConfig`] declares which knowledge sources a region consults and
//! the tiered plan used to search them. The [`RegionTable`] is the static,
//! validated set of regions loaded at startup; [`RegionTable::resolve`] maps a
//! location signal to exactly one region and never fails.
//!
//! # Resolution
//!
//! | Hint | Resolves to |
//! |------|-------------|
//! | `"GB"`, `" gb "` | region whose `country_codes` contains `GB` |
//! | `"en-GB"`, `"en_gb"` | same, via the trailing region subtag |
//! | `None`, `""`, `"ZZ"` | the default region |

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::models::ResourceType;

/// Where the escalation boundary sits relative to `min_results_threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationBoundary {
    /// Escalate while `count < threshold`.
    #[default]
    Below,
    /// Escalate while `count <= threshold`.
    AtOrBelow,
}

/// One abstract search to run inside a tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpec {
    pub resource_type: ResourceType,
    /// Operation name routed through the tool registry.
    pub operation_name: String,
    /// Call parameters; values may contain `{scenario}` and override placeholders.
    #[serde(default)]
    pub parameter_template: BTreeMap<String, String>,
    pub result_key: String,
    #[serde(default = "default_true")]
    pub deduplicate: bool,
    /// A failure of a required spec fails its whole tier.
    #[serde(default)]
    pub required: bool,
    /// Dispatch to every source exposing the operation instead of the best one.
    #[serde(default)]
    pub fan_out: bool,
}

/// One stage of the cascading plan. Specs inside a tier run concurrently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierSpec {
    pub tier_index: u32,
    #[serde(default)]
    pub search_specs: Vec<SearchSpec>,
    #[serde(default)]
    pub required: bool,
}

/// Static per-region search configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub region_name: String,
    #[serde(default)]
    pub country_codes: Vec<String>,
    /// Source ids in priority order.
    #[serde(default)]
    pub required_sources: Vec<String>,
    #[serde(default)]
    pub tiers: Vec<TierSpec>,
    #[serde(default = "default_min_results")]
    pub min_results_threshold: usize,
    #[serde(default = "default_true")]
    pub fallback_enabled: bool,
    #[serde(default)]
    pub escalation: EscalationBoundary,
}

fn default_true() -> bool {
    true
}

fn default_min_results() -> usize {
    2
}

impl RegionConfig {
    /// Check the invariants of a single region.
    pub fn validate(&self) -> Result<()> {
        if self.region_name.trim().is_empty() {
            bail!("region_name must not be empty");
        }

        let mut previous: Option<u32> = None;
        for tier in &self.tiers {
            if let Some(prev) = previous {
                if tier.tier_index <= prev {
                    bail!(
                        "region '{}': tier_index must be strictly increasing ({} follows {})",
                        self.region_name,
                        tier.tier_index,
                        prev
                    );
                }
            }
            previous = Some(tier.tier_index);

            for spec in &tier.search_specs {
                if spec.operation_name.trim().is_empty() {
                    bail!(
                        "region '{}' tier {}: operation_name must not be empty",
                        self.region_name,
                        tier.tier_index
                    );
                }
                if spec.result_key.trim().is_empty() {
                    bail!(
                        "region '{}' tier {}: result_key must not be empty for '{}'",
                        self.region_name,
                        tier.tier_index,
                        spec.operation_name
                    );
                }
            }
        }

        Ok(())
    }

    /// Index of the last configured tier, or 0 for a region without tiers.
    pub fn last_tier_index(&self) -> u32 {
        self.tiers.last().map(|t| t.tier_index).unwrap_or(0)
    }
}

/// The validated, immutable set of regions.
#[derive(Debug, Clone)]
pub struct RegionTable {
    regions: Vec<RegionConfig>,
    by_code: HashMap<String, usize>,
    default_index: usize,
}

impl RegionTable {
    /// Build the table, validating every region and the code map.
    ///
    /// Fails when `default_region` is not among `regions` or when a country
    /// code is claimed by more than one region.
    pub fn new(regions: Vec<RegionConfig>, default_region: &str) -> Result<Self> {
        if regions.is_empty() {
            bail!("at least one region must be configured");
        }

        let mut by_code = HashMap::new();
        let mut names = HashMap::new();
        for (idx, region) in regions.iter().enumerate() {
            region.validate()?;
            if names.insert(region.region_name.clone(), idx).is_some() {
                bail!("duplicate region_name '{}'", region.region_name);
            }
            for code in &region.country_codes {
                let code = code.trim().to_uppercase();
                if code.is_empty() {
                    bail!("region '{}' has an empty country code", region.region_name);
                }
                if let Some(other) = by_code.insert(code.clone(), idx) {
                    bail!(
                        "country code '{}' is claimed by both '{}' and '{}'",
                        code,
                        regions[other].region_name,
                        region.region_name
                    );
                }
            }
        }

        let default_index = match names.get(default_region) {
            Some(idx) => *idx,
            None => bail!("default region '{}' is not configured", default_region),
        };

        Ok(Self {
            regions,
            by_code,
            default_index,
        })
    }

    /// Map a location signal to a region. Total: unknown input yields the default.
    pub fn resolve(&self, region_hint: Option<&str>) -> &RegionConfig {
        region_hint
            .and_then(normalize_hint)
            .and_then(|code| self.by_code.get(&code))
            .map(|idx| &self.regions[*idx])
            .unwrap_or_else(|| self.default_region())
    }

    pub fn default_region(&self) -> &RegionConfig {
        &self.regions[self.default_index]
    }

    pub fn regions(&self) -> &[RegionConfig] {
        &self.regions
    }

    /// Find a region by its name.
    pub fn get(&self, region_name: &str) -> Option<&RegionConfig> {
        self.regions.iter().find(|r| r.region_name == region_name)
    }
}

/// Normalize a hint to an upper-case country code. `en-GB` → `GB`.
fn normalize_hint(hint: &str) -> Option<String> {
    let trimmed = hint.trim();
    if trimmed.is_empty() {
        return None;
    }
    let code = trimmed
        .rsplit(|c: char| c == '-' || c == '_')
        .next()
        .unwrap_or(trimmed);
    if code.is_empty() {
        return None;
    }
    Some(code.to_uppercase())
}
