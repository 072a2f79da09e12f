//! Source connections and the connection manager.
//!
//! A [`SourceConnection`] is the engine's handle to one knowledge source: the
//! transport, the operations discovered on it, and its status. The
//! [`ConnectionManager`] opens a set of them concurrently; one source failing
//! to connect never affects the others and never fails the call as a whole.
//!
//! ```text
//!  required_sources ──▶ ConnectionManager::connect()
//!                         │  (one task per source, own timeout)
//!                         ▼
//!                  ConnectionSet  [nice: connected, bnf: failed, pubmed: connected]
//! ```
//!
//! Connections are shared read-only between concurrent requests. The only
//! mutable part is the status, which an auth fault can flip to `Failed` for
//! the rest of the session.

use evidence_core::models::{ConnectionStatus, EvidenceRecord, ToolDescriptor};
use evidence_core::result::ConnectionReport;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::SourceFault;
use crate::traits::{EvidenceSource, SourceCatalog};

#[derive(Debug)]
struct ConnectionState {
    status: ConnectionStatus,
    last_error: Option<String>,
    discovered: bool,
    operations: BTreeMap<String, ToolDescriptor>,
}

/// A live (or failed) handle to one knowledge source.
pub struct SourceConnection {
    source_name: String,
    source: Option<Arc<dyn EvidenceSource>>,
    connect_elapsed: Option<Duration>,
    closed: AtomicBool,
    state: RwLock<ConnectionState>,
}

impl SourceConnection {
    fn with_state(
        source_name: String,
        source: Option<Arc<dyn EvidenceSource>>,
        status: ConnectionStatus,
        last_error: Option<String>,
        connect_elapsed: Option<Duration>,
    ) -> Self {
        Self {
            source_name,
            source,
            connect_elapsed,
            closed: AtomicBool::new(false),
            state: RwLock::new(ConnectionState {
                status,
                last_error,
                discovered: false,
                operations: BTreeMap::new(),
            }),
        }
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state
            .read()
            .map(|s| s.status)
            .unwrap_or(ConnectionStatus::Failed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.read().ok().and_then(|s| s.last_error.clone())
    }

    /// Connected and not since failed.
    pub fn is_available(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn is_discovered(&self) -> bool {
        self.state.read().map(|s| s.discovered).unwrap_or(false)
    }

    /// Operations discovered on this source, by name.
    pub fn operations(&self) -> BTreeMap<String, ToolDescriptor> {
        self.state
            .read()
            .map(|s| s.operations.clone())
            .unwrap_or_default()
    }

    pub(crate) fn source(&self) -> Option<Arc<dyn EvidenceSource>> {
        self.source.clone()
    }

    pub(crate) fn set_discovered(&self, operations: Vec<ToolDescriptor>) {
        if let Ok(mut state) = self.state.write() {
            state.operations = operations
                .into_iter()
                .map(|op| (op.name.clone(), op))
                .collect();
            state.discovered = true;
        }
    }

    /// Take the connection out of routing for the rest of the session.
    pub fn mark_failed(&self, fault: &SourceFault) {
        if let Ok(mut state) = self.state.write() {
            if state.status != ConnectionStatus::Failed {
                warn!(source = %self.source_name, error = %fault, "connection marked failed");
            }
            state.status = ConnectionStatus::Failed;
            state.last_error = Some(fault.to_string());
        }
    }

    /// Forward an invoke to the underlying source.
    pub async fn invoke(
        &self,
        operation: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<Vec<EvidenceRecord>, SourceFault> {
        match &self.source {
            Some(source) => source.invoke(operation, params).await,
            None => Err(SourceFault::NotRoutable(format!(
                "source '{}' is not registered",
                self.source_name
            ))),
        }
    }

    /// Close the transport. Later calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(source) = &self.source {
            source.close().await;
        }
    }

    pub fn report(&self) -> ConnectionReport {
        let (status, last_error, operations) = match self.state.read() {
            Ok(s) => (
                s.status,
                s.last_error.clone(),
                s.operations.keys().cloned().collect(),
            ),
            Err(_) => (ConnectionStatus::Failed, None, Vec::new()),
        };
        ConnectionReport {
            source_name: self.source_name.clone(),
            status,
            last_error,
            operations,
            connect_ms: self.connect_elapsed.map(|d| d.as_millis() as u64),
        }
    }
}

/// Connections in priority order (the region's `required_sources` order).
#[derive(Clone, Default)]
pub struct ConnectionSet {
    connections: Vec<Arc<SourceConnection>>,
}

impl ConnectionSet {
    pub fn new(connections: Vec<Arc<SourceConnection>>) -> Self {
        Self { connections }
    }

    pub fn get(&self, source_name: &str) -> Option<&Arc<SourceConnection>> {
        self.connections
            .iter()
            .find(|c| c.source_name() == source_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<SourceConnection>> {
        self.connections.iter()
    }

    pub fn available(&self) -> impl Iterator<Item = &Arc<SourceConnection>> {
        self.connections.iter().filter(|c| c.is_available())
    }

    pub fn reports(&self) -> Vec<ConnectionReport> {
        self.connections.iter().map(|c| c.report()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl std::fmt::Debug for ConnectionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.iter().map(|c| (c.source_name(), c.status())))
            .finish()
    }
}

/// Opens connections to catalog sources concurrently.
///
/// Each source gets one attempt bounded by `connect_timeout`. Retrying a
/// failed source is left to the caller.
#[derive(Clone)]
pub struct ConnectionManager {
    catalog: Arc<SourceCatalog>,
    connect_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(catalog: Arc<SourceCatalog>, connect_timeout: Duration) -> Self {
        Self {
            catalog,
            connect_timeout,
        }
    }

    /// Connect to a single source. Unknown ids come back `Failed`.
    pub async fn connect_one(&self, source_id: &str) -> Arc<SourceConnection> {
        let connection = match self.catalog.find(source_id) {
            Some(source) => open(source, self.connect_timeout).await,
            None => unregistered(source_id),
        };
        Arc::new(connection)
    }

    /// Connect to every listed source at once.
    ///
    /// The result holds one entry per distinct id, in the order given,
    /// including failed and unknown sources.
    pub async fn connect(&self, source_ids: &[String]) -> ConnectionSet {
        let mut seen = HashSet::new();
        let ids: Vec<&String> = source_ids.iter().filter(|id| seen.insert(*id)).collect();

        let mut slots: Vec<Option<SourceConnection>> = Vec::with_capacity(ids.len());
        let mut tasks = JoinSet::new();

        for (idx, id) in ids.iter().enumerate() {
            let Some(source) = self.catalog.find(id) else {
                slots.push(Some(unregistered(id)));
                continue;
            };
            slots.push(None);

            let timeout = self.connect_timeout;
            tasks.spawn(async move { (idx, open(source, timeout).await) });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Ok((idx, connection)) = joined {
                slots[idx] = Some(connection);
            }
        }

        let connections = slots
            .into_iter()
            .zip(ids)
            .map(|(slot, id)| {
                Arc::new(slot.unwrap_or_else(|| {
                    SourceConnection::with_state(
                        id.to_string(),
                        self.catalog.find(id),
                        ConnectionStatus::Failed,
                        Some("connection task aborted".to_string()),
                        None,
                    )
                }))
            })
            .collect();

        ConnectionSet::new(connections)
    }
}

fn unregistered(source_id: &str) -> SourceConnection {
    warn!(source = %source_id, "source is not registered");
    SourceConnection::with_state(
        source_id.to_string(),
        None,
        ConnectionStatus::Failed,
        Some(format!("source '{}' is not registered", source_id)),
        None,
    )
}

/// One connect attempt, bounded by `timeout`.
async fn open(source: Arc<dyn EvidenceSource>, timeout: Duration) -> SourceConnection {
    let started = Instant::now();
    let result = match tokio::time::timeout(timeout, source.connect()).await {
        Ok(result) => result,
        Err(_) => Err(SourceFault::Transient(format!(
            "connect timed out after {}s",
            timeout.as_secs_f64()
        ))),
    };
    let elapsed = started.elapsed();
    let name = source.name().to_string();

    match result {
        Ok(()) => {
            info!(source = %name, elapsed_ms = elapsed.as_millis() as u64, "connected");
            SourceConnection::with_state(
                name,
                Some(source),
                ConnectionStatus::Connected,
                None,
                Some(elapsed),
            )
        }
        Err(fault) => {
            warn!(source = %name, error = %fault, "connection failed");
            SourceConnection::with_state(
                name,
                Some(source),
                ConnectionStatus::Failed,
                Some(fault.to_string()),
                Some(elapsed),
            )
        }
    }
}
