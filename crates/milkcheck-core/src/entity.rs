//! Shared entity vocabulary: status, dependency kinds and dependency
//! evaluation.
//!
//! Actions and services share one closed [`Status`] enum and the same
//! dependency join rules; the join is a pure function over `(kind, status)`
//! pairs so both graph layers evaluate identically.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Execution status of an entity (action or service).
///
/// `InProgress` and `Warning` are only ever assigned to services;
/// they live in the shared enum so a single propagation path covers both
/// entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Initial state; nothing decided yet.
    NoStatus,
    /// Dispatched, awaiting worker close (or delay timer).
    Waiting,
    /// A service whose action set is currently being driven.
    InProgress,
    /// Finished successfully.
    Done,
    /// Finished successfully despite a failed weak dependency.
    Warning,
    /// The worker reported a timeout.
    TimedOut,
    /// More per-node failures than the entity tolerates.
    TooManyErrors,
    /// Propagated failure: a strong dependency failed, the entity never ran.
    Error,
}

impl Status {
    /// Whether this status will not change again before a reset.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::NoStatus | Status::Waiting | Status::InProgress)
    }

    /// Whether this status counts as a failure for dependents.
    pub fn is_failed(self) -> bool {
        matches!(self, Status::Error | Status::TimedOut | Status::TooManyErrors)
    }

    /// Rank for picking the worst outcome of a run; higher is worse.
    pub fn severity(self) -> u8 {
        match self {
            Status::NoStatus | Status::Waiting | Status::InProgress | Status::Done => 0,
            Status::Warning => 1,
            Status::TimedOut => 2,
            Status::TooManyErrors => 3,
            Status::Error => 4,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::NoStatus => "NO_STATUS",
            Status::Waiting => "WAITING",
            Status::InProgress => "IN_PROGRESS",
            Status::Done => "DONE",
            Status::Warning => "WARNING",
            Status::TimedOut => "TIMED_OUT",
            Status::TooManyErrors => "TOO_MANY_ERRORS",
            Status::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Error returned when parsing an unknown dependency kind.
#[derive(Debug, Clone, Error)]
#[error("illegal dependency kind {0:?} (expected require, require_weak or check)")]
pub struct IllegalDependencyKind(pub String);

/// Kind of a dependency edge from a dependent entity to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepKind {
    /// Target must succeed before the dependent runs.
    Require,
    /// Target runs first but may fail; the dependent is downgraded to
    /// `Warning` when it succeeds anyway.
    RequireWeak,
    /// Target's `check` action must succeed before the dependent runs.
    Check,
}

impl DepKind {
    /// Strong kinds veto their dependent on failure.
    pub fn is_strong(self) -> bool {
        matches!(self, DepKind::Require | DepKind::Check)
    }
}

impl fmt::Display for DepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DepKind::Require => "require",
            DepKind::RequireWeak => "require_weak",
            DepKind::Check => "check",
        };
        f.write_str(s)
    }
}

impl FromStr for DepKind {
    type Err = IllegalDependencyKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "require" => Ok(DepKind::Require),
            "require_weak" => Ok(DepKind::RequireWeak),
            "check" => Ok(DepKind::Check),
            other => Err(IllegalDependencyKind(other.to_owned())),
        }
    }
}

/// A directional dependency edge.
///
/// `internal` marks edges between the nested services of one group; they
/// behave like regular edges but are not part of the group's outer surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency<Id> {
    pub target: Id,
    pub kind: DepKind,
    pub internal: bool,
}

impl<Id> Dependency<Id> {
    pub fn new(target: Id, kind: DepKind, internal: bool) -> Self {
        Self {
            target,
            kind,
            internal,
        }
    }

    pub fn is_strong(&self) -> bool {
        self.kind.is_strong()
    }
}

/// Joined view of an entity's outgoing dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepsStatus {
    /// A strong dependency failed; the dependent must not run.
    Error,
    /// Some dependency is still waiting or in progress.
    Waiting,
    /// Some dependency has not been driven yet.
    NoStatus,
    /// All resolved, but a weak dependency failed.
    Warnings,
    /// All resolved successfully.
    Done,
}

/// Join dependency states in a stable traversal order.
///
/// A failed strong target wins over everything; otherwise any waiting
/// target, then any untouched target, then weak failures, then success.
pub fn eval_dep_states<I>(states: I) -> DepsStatus
where
    I: IntoIterator<Item = (DepKind, Status)>,
{
    let mut waiting = false;
    let mut untouched = false;
    let mut warned = false;
    for (kind, status) in states {
        if status.is_failed() {
            if kind.is_strong() {
                return DepsStatus::Error;
            }
            warned = true;
        } else {
            match status {
                Status::Waiting | Status::InProgress => waiting = true,
                Status::NoStatus => untouched = true,
                _ => {}
            }
        }
    }
    if waiting {
        DepsStatus::Waiting
    } else if untouched {
        DepsStatus::NoStatus
    } else if warned {
        DepsStatus::Warnings
    } else {
        DepsStatus::Done
    }
}
