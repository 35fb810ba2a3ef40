//! Typed failures surfaced by the engine. Nothing here is retried or logged
//! by the engine itself; callers own retry policy.

use crate::path::Conflicts;

/// Failures reported by collaborator stores and clients.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("backend: {0}")]
    Backend(String),
}

impl StoreError {
    /// Collapse an adapter-side `anyhow` chain into a backend error.
    pub fn backend(e: impl std::fmt::Display) -> Self { Self::Backend(e.to_string()) }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("got unexpected kind in {family} matcher: {kind}")]
    UnexpectedKind { family: &'static str, kind: String },

    #[error("{kind} {name} not found")]
    ReferenceNotFound { kind: String, name: String },

    #[error("pinned {family} ControllerRevision {name} not found")]
    PinnedRevisionMissing { family: &'static str, name: String },

    #[error("ControllerRevision {name} holds a {found}, expected a {family}")]
    UnexpectedRevisionPayload { family: &'static str, name: String, found: String },

    #[error("found existing ControllerRevision {name} with unexpected data")]
    RevisionIntegrity { name: String },

    #[error("failed to decode ControllerRevision {name}: {reason}")]
    Decode { name: String, reason: String },

    #[error("failed to encode {what}: {reason}")]
    Encode { what: String, reason: String },

    #[error("failed to upgrade ControllerRevisions: {}", render_failures(.failures))]
    Upgrade { failures: Vec<(String, String)> },

    #[error("{}", render_conflicts(.0))]
    FieldConflicts(Conflicts),

    #[error("failed to infer default {family}: {reason}")]
    Inference { family: &'static str, reason: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid quantity {value:?}: {reason}")]
    Quantity { value: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn render_failures(failures: &[(String, String)]) -> String {
    failures.iter().map(|(name, why)| format!("{}: {}", name, why)).collect::<Vec<_>>().join("; ")
}

fn render_conflicts(c: &Conflicts) -> String {
    if c.len() == 1 {
        format!("VM field {} conflicts with selected instance type", c)
    } else {
        format!("VM field(s) {} conflict with selected instance type", c)
    }
}

impl Error {
    pub fn decode(name: &str, reason: impl std::fmt::Display) -> Self {
        Self::Decode { name: name.to_string(), reason: reason.to_string() }
    }

    pub fn encode(what: &str, reason: impl std::fmt::Display) -> Self {
        Self::Encode { what: what.to_string(), reason: reason.to_string() }
    }

    /// Field conflicts from a workload-level apply, if that is what this is.
    pub fn conflicts(&self) -> Option<&Conflicts> {
        match self {
            Self::FieldConflicts(c) => Some(c),
            _ => None,
        }
    }
}
