//! Composite entity: a named action set plus dependencies on other
//! services. A service with nested members is a service group.

use std::time::Duration;

use super::{ActionId, ServiceId};
use crate::entity::{Dependency, Status};
use crate::variables::VariableScope;

#[derive(Debug, Clone)]
pub struct Service {
    /// Short name; nested services are indexed by `group.name`.
    pub name: String,
    pub desc: Option<String>,
    /// Raw target expression inherited by actions without their own.
    pub target: Option<String>,
    pub fanout: Option<usize>,
    pub errors: usize,
    pub timeout: Duration,
    pub delay: Duration,
    /// Simulated services never dispatch; their status is derived from
    /// dependency evaluation alone.
    pub simulate: bool,
    pub status: Status,
    /// Verb this service is being driven with in the current run.
    pub last_action: Option<String>,
    pub actions: Vec<ActionId>,
    pub deps: Vec<Dependency<ServiceId>>,
    /// Back-references from services depending on this one.
    pub dependents: Vec<ServiceId>,
    /// Nested services; non-empty marks a service group.
    pub members: Vec<ServiceId>,
    /// Owning group, if nested.
    pub group: Option<ServiceId>,
    pub variables: VariableScope,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            desc: None,
            target: None,
            fanout: None,
            errors: 0,
            timeout: Duration::ZERO,
            delay: Duration::ZERO,
            simulate: false,
            status: Status::NoStatus,
            last_action: None,
            actions: Vec::new(),
            deps: Vec::new(),
            dependents: Vec::new(),
            members: Vec::new(),
            group: None,
            variables: VariableScope::new(),
        }
    }

    pub fn is_group(&self) -> bool {
        !self.members.is_empty()
    }

    /// Return the service to its pristine state for a new run.
    pub fn reset(&mut self) {
        self.status = Status::NoStatus;
        self.last_action = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_service_has_no_status() {
        let svc = Service::new("nfs");
        assert_eq!(svc.status, Status::NoStatus);
        assert!(!svc.is_group());
    }

    #[test]
    fn reset_clears_status_and_verb() {
        let mut svc = Service::new("nfs");
        svc.status = Status::Error;
        svc.last_action = Some("start".to_owned());
        svc.reset();
        assert_eq!(svc.status, Status::NoStatus);
        assert!(svc.last_action.is_none());
    }
}
