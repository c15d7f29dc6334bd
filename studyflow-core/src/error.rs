//! Error types for the planner engine.
//!
//! Store, lifecycle, config and dispatch failures each get their own enum so
//! the orchestrator can tell a per-user failure from a batch-level one without
//! string matching.

use thiserror::Error;

use crate::session::{SessionAction, SessionStatus};

/// Failures reported by a [`crate::store::PlannerStore`] or [`crate::store::JobLock`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested row does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: u64 },

    /// The backing data source could not be reached or is corrupted.
    #[error("data source unavailable: {0}")]
    Unavailable(String),

    /// A write conflicted with the current state of the row.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Rejected session transitions. Terminal sessions never produce one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("cannot {action} a session that is {from}")]
    InvalidTransition {
        from: SessionStatus,
        action: SessionAction,
    },

    #[error("session {session_id} cannot be started outside its window ({reason})")]
    OutsideWindow { session_id: u64, reason: String },

    #[error("session {session_id} has an unresolvable local start time")]
    InvalidLocalTime { session_id: u64 },
}

/// Invalid planner configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("priority weights must sum to 1.0 (got {sum:.4})")]
    WeightsSum { sum: f64 },

    #[error("priority weight `{name}` must be non-negative (got {value})")]
    NegativeWeight { name: &'static str, value: f64 },

    #[error("invalid timezone: {0}")]
    Timezone(String),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// A notification could not be handed to the delivery channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dispatch failed: {0}")]
pub struct DispatchError(pub String);

/// Umbrella error surfaced by the engine and the orchestrator.
#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("lifecycle: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("job {job} failed after {attempts} attempts: {source}")]
    JobFailed {
        job: &'static str,
        attempts: u32,
        #[source]
        source: Box<PlannerError>,
    },
}

impl PlannerError {
    /// Whether this error is likely transient (worth retrying).
    pub fn is_transient(&self) -> bool {
        match self {
            PlannerError::Store(e) => e.is_transient(),
            PlannerError::Dispatch(_) => true,
            _ => false,
        }
    }
}
