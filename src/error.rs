//! Fault taxonomy for calls to knowledge sources.
//!
//! Every source adapter reports failures as a [`SourceFault`]. The variant
//! decides how the engine reacts:
//!
//! | Fault | Retried | Effect |
//! |-------|---------|--------|
//! | `Transient` | yes | call reported failed once attempts are exhausted |
//! | `Protocol` | no | that source's contribution to the search is dropped |
//! | `Auth` | no | connection marked failed for the rest of the session |
//! | `OperationNotFound` | no | call reported failed |
//! | `NotRoutable` | no | search spec skipped |

use evidence_core::result::FaultKind;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceFault {
    /// Connection reset, timeout, temporary unavailability.
    #[error("transient fault: {0}")]
    Transient(String),

    /// Malformed or unexpected response shape.
    #[error("protocol fault: {0}")]
    Protocol(String),

    /// Authentication or authorization rejected.
    #[error("auth fault: {0}")]
    Auth(String),

    /// The source does not know the requested operation.
    #[error("operation not found: {0}")]
    OperationNotFound(String),

    /// No connected source exposes the operation.
    #[error("not routable: {0}")]
    NotRoutable(String),
}

impl SourceFault {
    pub fn kind(&self) -> FaultKind {
        match self {
            SourceFault::Transient(_) => FaultKind::Transient,
            SourceFault::Protocol(_) => FaultKind::Protocol,
            SourceFault::Auth(_) => FaultKind::Auth,
            SourceFault::OperationNotFound(_) => FaultKind::OperationNotFound,
            SourceFault::NotRoutable(_) => FaultKind::NotRoutable,
        }
    }

    /// Default transient-fault classifier used by the retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceFault::Transient(_))
    }

    /// Faults that permanently disable a connection for the session.
    pub fn is_permanent(&self) -> bool {
        matches!(self, SourceFault::Auth(_))
    }

    /// The bare message without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            SourceFault::Transient(m)
            | SourceFault::Protocol(m)
            | SourceFault::Auth(m)
            | SourceFault::OperationNotFound(m)
            | SourceFault::NotRoutable(m) => m,
        }
    }
}
