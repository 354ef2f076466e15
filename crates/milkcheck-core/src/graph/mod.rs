//! Flat arena of services and actions.
//!
//! Entities are stored in `Vec`s and addressed by stable ids; dependency
//! edges carry `(id, kind, internal)` and dependents hold bare ids as
//! back-references, so the cyclic entity↔dependent relationship never
//! forms an ownership cycle. Dependency lists keep insertion order, which
//! fixes the traversal order everywhere it matters.

mod action;
mod service;

pub use action::{Action, RetryWithoutDelay};
pub use service::Service;

use std::collections::HashMap;

use thiserror::Error;

use crate::entity::{DepKind, Dependency, Status};

/// Stable index of a service in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(pub usize);

/// Stable index of an action in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(pub usize);

/// Errors raised while wiring the graph.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("service {0:?} is already defined")]
    DuplicateService(String),

    #[error("action {action:?} is already defined on service {service:?}")]
    DuplicateAction { service: String, action: String },

    #[error("dependency {target:?} is already referenced by {dependent:?}")]
    DuplicateDependency { dependent: String, target: String },

    #[error("dependency cycle detected involving: {0}")]
    Cycle(String),
}

/// Registry of every service and action taking part in a run.
#[derive(Debug, Default)]
pub struct ServiceGraph {
    services: Vec<Service>,
    actions: Vec<Action>,
    /// Fullname (`group.name` for nested services) to id.
    index: HashMap<String, ServiceId>,
    /// Global variable scope, outermost link of every chain.
    pub variables: crate::variables::VariableScope,
}

impl ServiceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------

    /// Register a service. Nested services must carry their `group` id;
    /// membership is wired here.
    pub fn add_service(&mut self, service: Service) -> Result<ServiceId, GraphError> {
        let id = ServiceId(self.services.len());
        let fullname = match service.group {
            Some(gid) => format!("{}.{}", self.fullname(gid), service.name),
            None => service.name.clone(),
        };
        if self.index.contains_key(&fullname) {
            return Err(GraphError::DuplicateService(fullname));
        }
        if let Some(gid) = service.group {
            self.services[gid.0].members.push(id);
        }
        self.index.insert(fullname, id);
        self.services.push(service);
        Ok(id)
    }

    /// Register an action on its owning service.
    pub fn add_action(&mut self, action: Action) -> Result<ActionId, GraphError> {
        let sid = action.service;
        if self.find_action(sid, &action.name).is_some() {
            return Err(GraphError::DuplicateAction {
                service: self.fullname(sid),
                action: action.name,
            });
        }
        let id = ActionId(self.actions.len());
        self.services[sid.0].actions.push(id);
        self.actions.push(action);
        Ok(id)
    }

    /// Add a dependency edge between two services.
    pub fn add_service_dep(
        &mut self,
        from: ServiceId,
        to: ServiceId,
        kind: DepKind,
        internal: bool,
    ) -> Result<(), GraphError> {
        if self.services[from.0].deps.iter().any(|d| d.target == to) {
            return Err(GraphError::DuplicateDependency {
                dependent: self.fullname(from),
                target: self.fullname(to),
            });
        }
        self.services[from.0]
            .deps
            .push(Dependency::new(to, kind, internal));
        self.services[to.0].dependents.push(from);
        Ok(())
    }

    /// Add a dependency edge between two actions of the same service.
    pub fn add_action_dep(
        &mut self,
        from: ActionId,
        to: ActionId,
        kind: DepKind,
    ) -> Result<(), GraphError> {
        if self.actions[from.0].deps.iter().any(|d| d.target == to) {
            return Err(GraphError::DuplicateDependency {
                dependent: self.action_label(from),
                target: self.action_label(to),
            });
        }
        self.actions[from.0]
            .deps
            .push(Dependency::new(to, kind, false));
        self.actions[to.0].dependents.push(from);
        Ok(())
    }

    // -------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------

    pub fn service(&self, id: ServiceId) -> &Service {
        &self.services[id.0]
    }

    pub fn service_mut(&mut self, id: ServiceId) -> &mut Service {
        &mut self.services[id.0]
    }

    pub fn action(&self, id: ActionId) -> &Action {
        &self.actions[id.0]
    }

    pub fn action_mut(&mut self, id: ActionId) -> &mut Action {
        &mut self.actions[id.0]
    }

    /// Resolve a service by fullname (`db` or `db.mysql`).
    pub fn service_by_name(&self, name: &str) -> Option<ServiceId> {
        self.index.get(name).copied()
    }

    /// Fullname of a service, prefixed by its group chain.
    pub fn fullname(&self, id: ServiceId) -> String {
        let svc = &self.services[id.0];
        match svc.group {
            Some(gid) => format!("{}.{}", self.fullname(gid), svc.name),
            None => svc.name.clone(),
        }
    }

    /// `service.action` label for logs and runner specs.
    pub fn action_label(&self, id: ActionId) -> String {
        let action = &self.actions[id.0];
        format!("{}.{}", self.fullname(action.service), action.name)
    }

    /// Find an action of a service by name.
    pub fn find_action(&self, sid: ServiceId, name: &str) -> Option<ActionId> {
        self.services[sid.0]
            .actions
            .iter()
            .copied()
            .find(|aid| self.actions[aid.0].name == name)
    }

    /// Services that are not nested inside a group, in definition order.
    pub fn top_level_services(&self) -> Vec<ServiceId> {
        (0..self.services.len())
            .map(ServiceId)
            .filter(|id| self.services[id.0].group.is_none())
            .collect()
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Status of a service looked up by fullname (test convenience).
    pub fn service_status(&self, name: &str) -> Option<Status> {
        self.service_by_name(name).map(|id| self.services[id.0].status)
    }

    // -------------------------------------------------------------------
    // Traversal views
    // -------------------------------------------------------------------

    /// Kind of the edge `from -> to`, if present.
    pub fn dep_kind(&self, from: ServiceId, to: ServiceId) -> Option<DepKind> {
        self.services[from.0]
            .deps
            .iter()
            .find(|d| d.target == to)
            .map(|d| d.kind)
    }

    /// Dependencies of a service for the requested traversal direction.
    ///
    /// A reverse run (stop-class verb) flips `require`/`require_weak`
    /// edges while preserving their kind; `check` edges always keep their
    /// original direction.
    pub fn deps_for(&self, sid: ServiceId, reverse: bool) -> Vec<(ServiceId, DepKind)> {
        let svc = &self.services[sid.0];
        if !reverse {
            return svc.deps.iter().map(|d| (d.target, d.kind)).collect();
        }
        let mut out = Vec::new();
        for &dependent in &svc.dependents {
            match self.dep_kind(dependent, sid) {
                Some(DepKind::Check) | None => {}
                Some(kind) => out.push((dependent, kind)),
            }
        }
        for d in &svc.deps {
            if d.kind == DepKind::Check {
                out.push((d.target, DepKind::Check));
            }
        }
        out
    }

    /// Services to consider triggering once `sid` resolves, mirroring
    /// [`Self::deps_for`].
    pub fn dependents_for(&self, sid: ServiceId, reverse: bool) -> Vec<ServiceId> {
        let svc = &self.services[sid.0];
        if !reverse {
            return svc.dependents.clone();
        }
        let mut out: Vec<ServiceId> = svc
            .deps
            .iter()
            .filter(|d| d.kind != DepKind::Check)
            .map(|d| d.target)
            .collect();
        for &dependent in &svc.dependents {
            if self.dep_kind(dependent, sid) == Some(DepKind::Check) {
                out.push(dependent);
            }
        }
        out
    }

    /// Dependency closure of the given roots, members included, in visit
    /// order.
    pub fn reachable(&self, roots: &[ServiceId], reverse: bool) -> Vec<ServiceId> {
        let mut visited = vec![false; self.services.len()];
        let mut order = Vec::new();
        let mut queue: Vec<ServiceId> = roots.to_vec();
        while let Some(sid) = queue.pop() {
            if visited[sid.0] {
                continue;
            }
            visited[sid.0] = true;
            order.push(sid);
            for (target, _) in self.deps_for(sid, reverse) {
                queue.push(target);
            }
            for &member in &self.services[sid.0].members {
                queue.push(member);
            }
        }
        order
    }

    /// Reset a service and all of its actions for a new run.
    pub fn reset(&mut self, sid: ServiceId) {
        let actions = self.services[sid.0].actions.clone();
        self.services[sid.0].reset();
        for aid in actions {
            self.actions[aid.0].reset();
        }
    }

    // -------------------------------------------------------------------
    // Validation
    // -------------------------------------------------------------------

    /// Reject dependency cycles, both across services and between the
    /// actions of each service (Kahn's algorithm).
    pub fn check_cycles(&self) -> Result<(), GraphError> {
        // Service layer.
        let n = self.services.len();
        let mut in_degree = vec![0usize; n];
        let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, svc) in self.services.iter().enumerate() {
            for dep in &svc.deps {
                // Edge: target -> dependent (target resolves first).
                adj[dep.target.0].push(i);
                in_degree[i] += 1;
            }
        }
        if let Some(stuck) = kahn_residue(&adj, &mut in_degree) {
            let names: Vec<String> = stuck
                .into_iter()
                .map(|i| self.fullname(ServiceId(i)))
                .collect();
            return Err(GraphError::Cycle(names.join(", ")));
        }

        // Action layer.
        let n = self.actions.len();
        let mut in_degree = vec![0usize; n];
        let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, action) in self.actions.iter().enumerate() {
            for dep in &action.deps {
                adj[dep.target.0].push(i);
                in_degree[i] += 1;
            }
        }
        if let Some(stuck) = kahn_residue(&adj, &mut in_degree) {
            let names: Vec<String> = stuck
                .into_iter()
                .map(|i| self.action_label(ActionId(i)))
                .collect();
            return Err(GraphError::Cycle(names.join(", ")));
        }
        Ok(())
    }
}

/// Run Kahn's algorithm; `None` when the graph is a DAG, otherwise the
/// indices left with nonzero in-degree (the cycle participants).
fn kahn_residue(adj: &[Vec<usize>], in_degree: &mut [usize]) -> Option<Vec<usize>> {
    let mut queue: Vec<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| i)
        .collect();
    let mut sorted = 0usize;
    while let Some(node) = queue.pop() {
        sorted += 1;
        for &next in &adj[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push(next);
            }
        }
    }
    if sorted == adj.len() {
        None
    } else {
        Some(
            in_degree
                .iter()
                .enumerate()
                .filter(|(_, d)| **d > 0)
                .map(|(i, _)| i)
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_services() -> (ServiceGraph, ServiceId, ServiceId) {
        let mut graph = ServiceGraph::new();
        let a = graph.add_service(Service::new("a")).unwrap();
        let b = graph.add_service(Service::new("b")).unwrap();
        (graph, a, b)
    }

    #[test]
    fn duplicate_service_is_rejected() {
        let mut graph = ServiceGraph::new();
        graph.add_service(Service::new("a")).unwrap();
        let err = graph.add_service(Service::new("a")).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateService(ref n) if n == "a"));
    }

    #[test]
    fn duplicate_dependency_is_rejected() {
        let (mut graph, a, b) = two_services();
        graph.add_service_dep(a, b, DepKind::Require, false).unwrap();
        let err = graph
            .add_service_dep(a, b, DepKind::RequireWeak, false)
            .unwrap_err();
        assert!(matches!(err, GraphError::DuplicateDependency { .. }));
    }

    #[test]
    fn duplicate_action_is_rejected() {
        let mut graph = ServiceGraph::new();
        let a = graph.add_service(Service::new("a")).unwrap();
        graph.add_action(Action::new("start", a)).unwrap();
        let err = graph.add_action(Action::new("start", a)).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateAction { .. }));
    }

    #[test]
    fn nested_service_gets_dotted_fullname() {
        let mut graph = ServiceGraph::new();
        let g = graph.add_service(Service::new("db")).unwrap();
        let mut member = Service::new("mysql");
        member.group = Some(g);
        let m = graph.add_service(member).unwrap();
        assert_eq!(graph.fullname(m), "db.mysql");
        assert_eq!(graph.service_by_name("db.mysql"), Some(m));
        assert!(graph.service(g).is_group());
    }

    #[test]
    fn direct_cycle_is_detected() {
        let (mut graph, a, b) = two_services();
        graph.add_service_dep(a, b, DepKind::Require, false).unwrap();
        graph.add_service_dep(b, a, DepKind::Require, false).unwrap();
        assert!(matches!(graph.check_cycles(), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn transitive_cycle_is_detected() {
        let mut graph = ServiceGraph::new();
        let a = graph.add_service(Service::new("a")).unwrap();
        let b = graph.add_service(Service::new("b")).unwrap();
        let c = graph.add_service(Service::new("c")).unwrap();
        graph.add_service_dep(a, b, DepKind::Require, false).unwrap();
        graph.add_service_dep(b, c, DepKind::Require, false).unwrap();
        graph.add_service_dep(c, a, DepKind::Require, false).unwrap();
        assert!(matches!(graph.check_cycles(), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn diamond_is_a_dag() {
        let mut graph = ServiceGraph::new();
        let a = graph.add_service(Service::new("a")).unwrap();
        let b = graph.add_service(Service::new("b")).unwrap();
        let c = graph.add_service(Service::new("c")).unwrap();
        let d = graph.add_service(Service::new("d")).unwrap();
        graph.add_service_dep(b, a, DepKind::Require, false).unwrap();
        graph.add_service_dep(c, a, DepKind::Require, false).unwrap();
        graph.add_service_dep(d, b, DepKind::Require, false).unwrap();
        graph.add_service_dep(d, c, DepKind::RequireWeak, false).unwrap();
        assert!(graph.check_cycles().is_ok());
    }

    #[test]
    fn action_cycle_is_detected() {
        let mut graph = ServiceGraph::new();
        let s = graph.add_service(Service::new("s")).unwrap();
        let x = graph.add_action(Action::new("mount", s)).unwrap();
        let y = graph.add_action(Action::new("start", s)).unwrap();
        graph.add_action_dep(x, y, DepKind::Require).unwrap();
        graph.add_action_dep(y, x, DepKind::Require).unwrap();
        assert!(matches!(graph.check_cycles(), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn reverse_view_flips_require_edges() {
        let (mut graph, a, b) = two_services();
        // a requires b: forward order b then a; stop order a then b.
        graph.add_service_dep(a, b, DepKind::Require, false).unwrap();

        assert_eq!(graph.deps_for(a, false), vec![(b, DepKind::Require)]);
        assert!(graph.deps_for(a, true).is_empty());
        assert_eq!(graph.deps_for(b, true), vec![(a, DepKind::Require)]);

        assert_eq!(graph.dependents_for(a, true), vec![b]);
        assert_eq!(graph.dependents_for(b, false), vec![a]);
    }

    #[test]
    fn check_edges_keep_direction_on_reverse() {
        let (mut graph, a, b) = two_services();
        graph.add_service_dep(a, b, DepKind::Check, false).unwrap();
        assert_eq!(graph.deps_for(a, true), vec![(b, DepKind::Check)]);
        assert!(graph.deps_for(b, true).is_empty());
        assert_eq!(graph.dependents_for(b, true), vec![a]);
    }

    #[test]
    fn reachable_includes_deps_and_members() {
        let mut graph = ServiceGraph::new();
        let g = graph.add_service(Service::new("g")).unwrap();
        let mut member = Service::new("m");
        member.group = Some(g);
        let m = graph.add_service(member).unwrap();
        let dep = graph.add_service(Service::new("dep")).unwrap();
        let lone = graph.add_service(Service::new("lone")).unwrap();
        graph.add_service_dep(g, dep, DepKind::Require, false).unwrap();

        let reachable = graph.reachable(&[g], false);
        assert!(reachable.contains(&g));
        assert!(reachable.contains(&m));
        assert!(reachable.contains(&dep));
        assert!(!reachable.contains(&lone));
    }
}
