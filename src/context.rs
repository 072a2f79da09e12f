//! Engine context: configuration plus the session connection cache.
//!
//! An [`EngineContext`] owns everything a search needs that outlives a single
//! request: the region table, the source catalog, timeouts, the retry policy,
//! and one [`SourceConnection`] per source id once that source has been
//! connected. Several contexts may coexist in one process; nothing here is
//! global.
//!
//! Connections are opened lazily, the first time a region that needs them is
//! searched. Each source id has its own once-cell, so a request only waits
//! for sources it needs that are still connecting; the map lock is held just
//! long enough to look cells up. A source that failed to connect stays failed
//! for the rest of the session; call [`EngineContext::reset_failed`] to let
//! the next search try again.

use anyhow::Result;
use evidence_core::region::{RegionConfig, RegionTable};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tracing::{info, warn};

use crate::config::Config;
use crate::connection::{ConnectionManager, ConnectionSet, SourceConnection};
use crate::retry::{RetryPolicy, RetryingInvoker};
use crate::routing::{RoutingTable, ToolRegistry};
use crate::traits::SourceCatalog;

/// Connections and routes for one region, as seen by one request.
#[derive(Debug, Clone)]
pub struct Session {
    pub connections: ConnectionSet,
    pub routes: RoutingTable,
}

pub struct EngineContext {
    regions: RegionTable,
    catalog: Arc<SourceCatalog>,
    connections: ConnectionManager,
    registry: ToolRegistry,
    invoker: RetryingInvoker,
    connect_timeout: Duration,
    call_timeout: Duration,
    default_deadline: Option<Duration>,
    cache: Mutex<BTreeMap<String, Slot>>,
}

/// A source's connection, filled by whichever request reaches it first.
type Slot = Arc<OnceCell<Arc<SourceConnection>>>;

impl EngineContext {
    /// Build a context from a validated config and a source catalog.
    pub fn new(config: &Config, catalog: SourceCatalog) -> Result<Self> {
        config.validate()?;
        let regions = config.region_table()?;
        let invoker = RetryingInvoker::new(RetryPolicy::from(&config.retry));
        let catalog = Arc::new(catalog);
        let connect_timeout = config.engine.connect_timeout();

        Ok(Self {
            regions,
            connections: ConnectionManager::new(catalog.clone(), connect_timeout),
            registry: ToolRegistry::new(connect_timeout, invoker),
            catalog,
            invoker,
            connect_timeout,
            call_timeout: config.engine.call_timeout(),
            default_deadline: config.engine.deadline(),
            cache: Mutex::new(BTreeMap::new()),
        })
    }

    /// Build a context with the sources declared in `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config, SourceCatalog::from_config(config)?)
    }

    /// Replace the retry policy, e.g. to shorten delays in tests.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        let invoker = RetryingInvoker::new(policy);
        self.invoker = invoker;
        self.registry = ToolRegistry::new(self.connect_timeout, invoker);
        self
    }

    pub fn regions(&self) -> &RegionTable {
        &self.regions
    }

    pub fn catalog(&self) -> &SourceCatalog {
        &self.catalog
    }

    pub fn resolve(&self, region_hint: Option<&str>) -> &RegionConfig {
        self.regions.resolve(region_hint)
    }

    pub fn invoker(&self) -> RetryingInvoker {
        self.invoker
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn default_deadline(&self) -> Option<Duration> {
        self.default_deadline
    }

    /// Connect and discover any of `region`'s sources not yet in the cache,
    /// and return the session for that region.
    ///
    /// Concurrent callers needing the same source share one connect attempt.
    /// The attempt runs on its own task, so it still lands in the cache if
    /// this caller gives up first.
    pub async fn session(&self, region: &RegionConfig) -> Session {
        let slots: Vec<(String, Slot)> = {
            let mut cache = self.cache.lock().await;
            let mut seen = HashSet::new();
            region
                .required_sources
                .iter()
                .filter(|id| seen.insert(id.as_str()))
                .map(|id| (id.clone(), cache.entry(id.clone()).or_default().clone()))
                .collect()
        };

        let pending: Vec<&str> = slots
            .iter()
            .filter(|(_, slot)| !slot.initialized())
            .map(|(id, _)| id.as_str())
            .collect();
        if !pending.is_empty() {
            info!(region = %region.region_name, sources = ?pending, "opening connections");
        }

        let handles: Vec<_> = slots
            .into_iter()
            .map(|(id, slot)| {
                let connections = self.connections.clone();
                let registry = self.registry.clone();
                tokio::spawn(async move {
                    slot.get_or_init(|| async {
                        let conn = connections.connect_one(&id).await;
                        registry.discover(&ConnectionSet::new(vec![conn.clone()])).await;
                        conn
                    })
                    .await
                    .clone()
                })
            })
            .collect();

        let mut opened = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(conn) => opened.push(conn),
                Err(e) => warn!(region = %region.region_name, error = %e, "connection task failed"),
            }
        }

        let connections = ConnectionSet::new(opened);
        let routes = RoutingTable::build(&connections);

        Session {
            connections,
            routes,
        }
    }

    /// Every cached connection, sorted by source id.
    pub async fn connections(&self) -> Vec<Arc<SourceConnection>> {
        self.cache
            .lock()
            .await
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect()
    }

    /// Drop failed connections so the next search reconnects them.
    pub async fn reset_failed(&self) -> usize {
        let mut cache = self.cache.lock().await;
        let before = cache.len();
        cache.retain(|_, slot| slot.get().map_or(true, |conn| conn.is_available()));
        before - cache.len()
    }

    /// Close every transport and empty the cache.
    pub async fn shutdown(&self) {
        let slots: Vec<Slot> = {
            let mut cache = self.cache.lock().await;
            std::mem::take(&mut *cache).into_values().collect()
        };
        let mut closed = 0;
        for conn in slots.iter().filter_map(|slot| slot.get()) {
            conn.close().await;
            closed += 1;
        }
        info!(closed, "engine context shut down");
    }
}
