//! Leaf executable unit: one shell command targeted at a node set.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::{ActionId, ServiceId};
use crate::entity::{Dependency, Status};
use crate::runner::WorkerReport;
use crate::variables::VariableScope;

/// Error returned when a retry count is configured without a delay.
#[derive(Debug, Clone, Error)]
#[error("retry requires a nonzero delay")]
pub struct RetryWithoutDelay;

/// An action owned by exactly one service.
///
/// `command` is stored unexpanded; `%{...}` interpolation happens at
/// dispatch time against the chained variable scope. A `None` command
/// marks a pure dependency link that resolves without dispatching.
#[derive(Debug, Clone)]
pub struct Action {
    pub name: String,
    pub service: ServiceId,
    pub command: Option<String>,
    /// Raw target expression; `None` runs locally.
    pub target: Option<String>,
    /// Per-node wall-time limit; zero disables the timeout.
    pub timeout: Duration,
    /// Dispatch delay; also the pause between retries.
    pub delay: Duration,
    /// Tolerated number of failing nodes before `TooManyErrors`.
    pub errors: usize,
    pub fanout: Option<usize>,
    pub simulate: bool,
    pub status: Status,
    pub deps: Vec<Dependency<ActionId>>,
    pub dependents: Vec<ActionId>,
    pub start_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
    pub report: Option<WorkerReport>,
    pub variables: VariableScope,
    retry: u32,
    retry_backup: Option<u32>,
}

impl Action {
    pub fn new(name: impl Into<String>, service: ServiceId) -> Self {
        Self {
            name: name.into(),
            service,
            command: None,
            target: None,
            timeout: Duration::ZERO,
            delay: Duration::ZERO,
            errors: 0,
            fanout: None,
            simulate: false,
            status: Status::NoStatus,
            deps: Vec::new(),
            dependents: Vec::new(),
            start_time: None,
            stop_time: None,
            report: None,
            variables: VariableScope::new(),
            retry: 0,
            retry_backup: None,
        }
    }

    /// Configure the retry budget. The first assignment is kept as the
    /// backup that [`Action::reset`] restores. A retry budget only makes
    /// sense together with a delay between attempts.
    pub fn set_retry(&mut self, retry: u32) -> Result<(), RetryWithoutDelay> {
        if retry > 0 && self.delay.is_zero() {
            return Err(RetryWithoutDelay);
        }
        self.retry = retry;
        if self.retry_backup.is_none() {
            self.retry_backup = Some(retry);
        }
        Ok(())
    }

    pub fn retry(&self) -> u32 {
        self.retry
    }

    /// Consume one retry attempt.
    pub fn consume_retry(&mut self) {
        debug_assert!(self.retry > 0);
        self.retry -= 1;
    }

    /// Return the action to its pristine state for a new run.
    pub fn reset(&mut self) {
        self.status = Status::NoStatus;
        self.start_time = None;
        self.stop_time = None;
        self.report = None;
        self.retry = self.retry_backup.unwrap_or(0);
    }

    /// Wall time of the last run in seconds, once both stamps exist.
    pub fn duration(&self) -> Option<f64> {
        let (start, stop) = (self.start_time?, self.stop_time?);
        Some((stop - start).num_milliseconds() as f64 / 1000.0)
    }

    pub fn has_timed_out(&self) -> bool {
        self.report.as_ref().is_some_and(|r| r.timed_out)
    }

    /// Whether the last report exceeded the per-node failure tolerance.
    pub fn has_too_many_errors(&self) -> bool {
        self.report
            .as_ref()
            .is_some_and(|r| r.error_count() > self.errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodeset::NodeSet;

    fn action_with_delay(delay_secs: u64) -> Action {
        let mut a = Action::new("start", ServiceId(0));
        a.delay = Duration::from_secs(delay_secs);
        a
    }

    #[test]
    fn retry_without_delay_is_rejected() {
        let mut a = action_with_delay(0);
        assert!(a.set_retry(2).is_err());
    }

    #[test]
    fn zero_retry_without_delay_is_fine() {
        let mut a = action_with_delay(0);
        assert!(a.set_retry(0).is_ok());
    }

    #[test]
    fn reset_restores_retry_from_first_assignment() {
        let mut a = action_with_delay(3);
        a.set_retry(2).unwrap();
        a.consume_retry();
        a.consume_retry();
        assert_eq!(a.retry(), 0);
        a.reset();
        assert_eq!(a.retry(), 2);
    }

    #[test]
    fn reset_clears_run_state() {
        let mut a = action_with_delay(0);
        a.status = Status::Done;
        a.start_time = Some(Utc::now());
        a.stop_time = Some(Utc::now());
        a.report = Some(WorkerReport::local(0, ""));
        a.reset();
        assert_eq!(a.status, Status::NoStatus);
        assert!(a.start_time.is_none());
        assert!(a.stop_time.is_none());
        assert!(a.report.is_none());
    }

    #[test]
    fn tolerance_boundary_is_strict() {
        let mut a = action_with_delay(0);
        a.errors = 2;
        let failing = |n: &str| WorkerReport {
            retcodes: vec![(1, NodeSet::parse(n).unwrap())],
            outputs: Vec::new(),
            timed_out: false,
            local: false,
        };
        a.report = Some(failing("node[1-2]"));
        assert!(!a.has_too_many_errors());
        a.report = Some(failing("node[1-3]"));
        assert!(a.has_too_many_errors());
    }

    #[test]
    fn duration_needs_both_stamps() {
        let mut a = action_with_delay(0);
        assert!(a.duration().is_none());
        let start = Utc::now();
        a.start_time = Some(start);
        assert!(a.duration().is_none());
        a.stop_time = Some(start + chrono::Duration::milliseconds(1500));
        assert_eq!(a.duration(), Some(1.5));
    }
}
