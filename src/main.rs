//! # Clinical Evidence CLI (`evidence`)
//!
//! Command-line front end for the federated evidence engine.
//!
//! ## Usage
//!
//! ```bash
//! evidence --config ./config/evidence.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `evidence regions` | List configured regions and their tier plans |
//! | `evidence resolve <hint>` | Show which region a location hint resolves to |
//! | `evidence sources` | Connect to sources and list discovered operations |
//! | `evidence search "<scenario>"` | Run a tiered federated search |
//!
//! ## Examples
//!
//! ```bash
//! # Which region does a UK locale pick?
//! evidence resolve en-GB
//!
//! # Connection health for one region
//! evidence sources --region GB
//!
//! # Search with a template override and a 30s deadline, as JSON
//! evidence search "pregnant woman with UTI" --region GB \
//!     --set population=pregnancy --deadline-secs 30 --json
//! ```
//!
//! Logs go to stderr; set `RUST_LOG` (default `info`) to change verbosity.

use anyhow::Result;
use clap::{Parser, Subcommand};
use clinical_evidence::config::{self, Config};
use clinical_evidence::{EngineContext, FederatedSearchEngine, SearchRequest, SearchResult};
use evidence_core::result::CallOutcome;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Clinical Evidence: region-aware, tiered, federated search over clinical
/// knowledge sources.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/evidence.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "evidence",
    about = "Region-aware, tiered, federated search over clinical knowledge sources",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/evidence.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured regions, their country codes, sources and tiers.
    Regions,

    /// Show which region a location hint resolves to.
    ///
    /// Accepts country codes (`GB`) and locale tags (`en-GB`). Unknown or
    /// missing hints resolve to the default region.
    Resolve {
        /// Country code or locale tag.
        hint: Option<String>,
    },

    /// Connect to sources and list their status and operations.
    ///
    /// Without `--region`, every region's sources are connected.
    Sources {
        /// Only connect the sources of the region this hint resolves to.
        #[arg(long)]
        region: Option<String>,
    },

    /// Run a federated evidence search.
    Search {
        /// Free-text clinical scenario.
        scenario: String,

        /// Country code or locale tag used to pick the region.
        #[arg(long)]
        region: Option<String>,

        /// Template override as `key=value`; may be repeated.
        #[arg(long = "set", value_parser = parse_key_val)]
        overrides: Vec<(String, String)>,

        /// Abort pending calls after this many seconds (at most one day).
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..=config::MAX_DEADLINE_SECS))]
        deadline_secs: Option<u64>,

        /// Print the full result as JSON.
        #[arg(long)]
        json: bool,
    },
}

/// Parse a `key=value` pair for `--set` arguments.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Regions => list_regions(&cfg)?,
        Commands::Resolve { hint } => {
            let table = cfg.region_table()?;
            let region = table.resolve(hint.as_deref());
            println!("{}", region.region_name);
        }
        Commands::Sources { region } => {
            let context = EngineContext::from_config(&cfg)?;
            list_sources(&context, region.as_deref()).await;
            context.shutdown().await;
        }
        Commands::Search {
            scenario,
            region,
            overrides,
            deadline_secs,
            json,
        } => {
            let context = Arc::new(EngineContext::from_config(&cfg)?);
            let engine = FederatedSearchEngine::new(context.clone());

            let mut request = SearchRequest::new(scenario);
            request.region_hint = region;
            request.overrides = overrides.into_iter().collect();
            request.deadline = deadline_secs.map(Duration::from_secs);

            let result = engine.search(request).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_result(&result);
            }
            context.shutdown().await;
        }
    }

    Ok(())
}

fn list_regions(cfg: &Config) -> Result<()> {
    let table = cfg.region_table()?;
    let default = table.default_region().region_name.clone();

    for region in table.regions() {
        let marker = if region.region_name == default { " (default)" } else { "" };
        println!("{}{}", region.region_name, marker);
        println!("  countries:  {}", join_or_dash(&region.country_codes));
        println!("  sources:    {}", join_or_dash(&region.required_sources));
        println!(
            "  threshold:  {} ({:?}), fallback {}",
            region.min_results_threshold,
            region.escalation,
            if region.fallback_enabled { "on" } else { "off" }
        );
        for tier in &region.tiers {
            let ops: Vec<String> = tier
                .search_specs
                .iter()
                .map(|s| format!("{}→{}", s.operation_name, s.result_key))
                .collect();
            println!(
                "  tier {}{}: {}",
                tier.tier_index,
                if tier.required { " (required)" } else { "" },
                join_or_dash(&ops)
            );
        }
    }
    Ok(())
}

async fn list_sources(context: &EngineContext, hint: Option<&str>) {
    match hint {
        Some(hint) => {
            context.session(context.resolve(Some(hint))).await;
        }
        None => {
            for region in context.regions().regions() {
                context.session(region).await;
            }
        }
    }

    println!("{:<16} {:<10} {:>8}  OPERATIONS", "SOURCE", "STATUS", "MS");
    for conn in context.connections().await {
        let report = conn.report();
        let ms = report
            .connect_ms
            .map(|ms| ms.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<16} {:<10} {:>8}  {}",
            report.source_name,
            report.status.to_string().to_uppercase(),
            ms,
            join_or_dash(&report.operations)
        );
        if let Some(err) = report.last_error {
            println!("{:<16} error: {}", "", err);
        }
    }
}

fn print_result(result: &SearchResult) {
    let ctx = &result.query_context;
    let diag = &result.diagnostics;

    println!(
        "region: {}   tier reached: {}   items: {}   elapsed: {}ms",
        ctx.region_name,
        result.tier_reached,
        result.items.len(),
        diag.elapsed_ms
    );
    if let Some(reason) = diag.stop_reason {
        println!("stopped: {:?}", reason);
    }
    if diag.timed_out {
        println!("deadline expired: partial result");
    }
    if diag.required_failed {
        println!("required search failed");
    }

    if result.items.is_empty() {
        println!("\nNo evidence found.");
    } else {
        println!();
        for (i, item) in result.items.iter().enumerate() {
            println!(
                "{:>3}. [{}] {}",
                i + 1,
                item.resource_type,
                item.title
            );
            println!(
                "     {} {} ({})",
                item.source_name,
                item.external_id.as_deref().unwrap_or("-"),
                item.result_key
            );
        }
    }

    let retried = diag.retry_count();
    let failed = diag
        .calls
        .iter()
        .filter(|c| !matches!(c.outcome, CallOutcome::Succeeded { .. }))
        .count();
    println!(
        "\ncalls: {}   not succeeded: {}   retries: {}",
        diag.calls.len(),
        failed,
        retried
    );
    if !diag.errors.is_empty() {
        println!("errors:");
        for err in &diag.errors {
            println!("  - {}", err);
        }
    }
}

fn join_or_dash(items: &[String]) -> String {
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join(", ")
    }
}
