use std::time::Duration;

use ulid::Ulid;

use crate::model::{EntityKind, Record};

/// Why an optimistic check failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    /// Someone else committed first. Carries the version that won so the caller can merge.
    StaleVersion { current: Box<Record> },
    /// The record was deleted underneath the caller.
    TargetGone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    NotFound(Ulid),
    DuplicateIdentity(Ulid),
    OptimisticConflict {
        id: Ulid,
        kind: ConflictKind,
    },
    DependentRecordsExist {
        id: Ulid,
        children: Vec<Ulid>,
    },
    MissingParent {
        child: Ulid,
        parent: Ulid,
    },
    Unauthorized {
        caller: String,
        action: &'static str,
        id: Option<Ulid>,
    },
    DeadlineExceeded(Duration),
    QueryFailure(String),
    Invalid(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub(crate) fn kind_mismatch(id: Ulid, expected: EntityKind, found: EntityKind) -> Self {
        EngineError::Invalid(format!("{id} is a {found}, not a {expected}"))
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::DuplicateIdentity(_) => "duplicate_identity",
            EngineError::OptimisticConflict { kind: ConflictKind::StaleVersion { .. }, .. } => {
                "stale_version"
            }
            EngineError::OptimisticConflict { kind: ConflictKind::TargetGone, .. } => "target_gone",
            EngineError::DependentRecordsExist { .. } => "dependent_records_exist",
            EngineError::MissingParent { .. } => "missing_parent",
            EngineError::Unauthorized { .. } => "unauthorized",
            EngineError::DeadlineExceeded(_) => "deadline_exceeded",
            EngineError::QueryFailure(_) => "query_failure",
            EngineError::Invalid(_) => "invalid",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::DuplicateIdentity(id) => write!(f, "already exists: {id}"),
            EngineError::OptimisticConflict { id, kind } => match kind {
                ConflictKind::StaleVersion { current } => write!(
                    f,
                    "stale version of {id}: current last_modified is {}",
                    current.last_modified
                ),
                ConflictKind::TargetGone => write!(f, "{id} was deleted by someone else"),
            },
            EngineError::DependentRecordsExist { id, children } => write!(
                f,
                "cannot delete {id}: {} dependent record(s) still reference it",
                children.len()
            ),
            EngineError::MissingParent { child, parent } => {
                write!(f, "{child} references {parent}, which does not exist")
            }
            EngineError::Unauthorized { caller, action, id } => match id {
                Some(id) => write!(f, "{caller} may not {action} {id}"),
                None => write!(f, "{caller} may not {action}"),
            },
            EngineError::DeadlineExceeded(d) => {
                write!(f, "no result within {}s; the query is still running", d.as_secs())
            }
            EngineError::QueryFailure(msg) => write!(f, "query failed: {msg}"),
            EngineError::Invalid(msg) => write!(f, "invalid request: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
