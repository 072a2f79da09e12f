//! Operation discovery and routing.
//!
//! [`ToolRegistry::discover`] asks every connected source which operations
//! it serves, concurrently. The resulting [`RoutingTable`] maps each
//! operation name to the sources that expose it, in the region's source
//! priority order, so a lookup always picks the highest-priority live source.
//!
//! A source whose discovery fails is marked failed and contributes no routes.
//! Routes are filtered by live status at lookup time, so a connection that
//! fails mid-session (e.g. on an auth fault) drops out of routing at once.

use evidence_core::models::ToolDescriptor;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::connection::{ConnectionSet, SourceConnection};
use crate::error::SourceFault;
use crate::retry::RetryingInvoker;

/// One source able to serve an operation.
#[derive(Clone)]
pub struct Route {
    pub source_name: String,
    pub signature: ToolDescriptor,
    pub connection: Arc<SourceConnection>,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("source_name", &self.source_name)
            .field("operation", &self.signature.name)
            .finish()
    }
}

/// Operation name → candidate routes in priority order.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: BTreeMap<String, Vec<Route>>,
}

impl RoutingTable {
    /// Index the discovered operations of every connection in `connections`.
    pub fn build(connections: &ConnectionSet) -> Self {
        let mut routes: BTreeMap<String, Vec<Route>> = BTreeMap::new();
        for conn in connections.iter() {
            for (name, signature) in conn.operations() {
                routes.entry(name).or_default().push(Route {
                    source_name: conn.source_name().to_string(),
                    signature,
                    connection: conn.clone(),
                });
            }
        }
        Self { routes }
    }

    /// The highest-priority live source for `operation`.
    pub fn route(&self, operation: &str) -> Result<Route, SourceFault> {
        self.route_all(operation)
            .into_iter()
            .next()
            .ok_or_else(|| not_routable(operation))
    }

    /// Every live source for `operation`, in priority order.
    pub fn route_all(&self, operation: &str) -> Vec<Route> {
        self.routes
            .get(operation)
            .map(|candidates| {
                candidates
                    .iter()
                    .filter(|r| r.connection.is_available())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All known operation names, sorted.
    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}

fn not_routable(operation: &str) -> SourceFault {
    SourceFault::NotRoutable(format!("no connected source exposes '{}'", operation))
}

/// Runs operation discovery against connected sources.
#[derive(Clone)]
pub struct ToolRegistry {
    discover_timeout: Duration,
    invoker: RetryingInvoker,
}

impl ToolRegistry {
    pub fn new(discover_timeout: Duration, invoker: RetryingInvoker) -> Self {
        Self {
            discover_timeout,
            invoker,
        }
    }

    /// Discover operations on every connected, not-yet-discovered source,
    /// then build the routing table for the whole set.
    pub async fn discover(&self, connections: &ConnectionSet) -> RoutingTable {
        let mut tasks = JoinSet::new();

        for conn in connections.available().filter(|c| !c.is_discovered()) {
            let Some(source) = conn.source() else {
                continue;
            };
            let conn = conn.clone();
            let timeout = self.discover_timeout;
            let invoker = self.invoker;
            tasks.spawn(async move {
                let label = format!("discover:{}", conn.source_name());
                let outcome = invoker
                    .invoke_with_retry(&label, || {
                        let source = source.clone();
                        async move {
                            match tokio::time::timeout(timeout, source.discover()).await {
                                Ok(result) => result,
                                Err(_) => Err(SourceFault::Transient(format!(
                                    "discovery timed out after {}s",
                                    timeout.as_secs_f64()
                                ))),
                            }
                        }
                    })
                    .await;

                match outcome.result {
                    Ok(operations) => {
                        debug!(
                            source = %conn.source_name(),
                            operations = operations.len(),
                            "discovered operations"
                        );
                        conn.set_discovered(operations);
                    }
                    Err(fault) => {
                        warn!(source = %conn.source_name(), error = %fault, "discovery failed");
                        conn.mark_failed(&fault);
                    }
                }
            });
        }

        while tasks.join_next().await.is_some() {}

        RoutingTable::build(connections)
    }
}
