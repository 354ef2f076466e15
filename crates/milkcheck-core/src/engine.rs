//! Graph-aware execution engine: runs a verb across services in
//! dependency order, propagating status through the graph.
//!
//! All entity mutation happens inside [`Engine::call_services`], a single
//! loop draining runtime events one at a time. Everything between two
//! events runs to completion, so no entity requires locking.

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{ActionManager, DEFAULT_FANOUT};
use crate::entity::{DepKind, DepsStatus, Status, eval_dep_states};
use crate::graph::{ActionId, ServiceGraph, ServiceId};
use crate::nodeset::{NodeSet, NodeSetParseError};
use crate::runner::{CommandSpec, RuntimeEvent, TaskRunner, WorkerReport};
use crate::variables::{VariableError, expand};
use crate::view::{ActionSnapshot, EntitySnapshot, ServiceSnapshot, UserView};

/// Verb whose runs traverse the dependency graph in reverse.
const REVERSE_VERB: &str = "stop";
/// Verb allowed to resolve a service without a matching action.
const DIAGNOSTIC_VERB: &str = "status";
/// Verb driven on the target of a `check` dependency.
const CHECK_VERB: &str = "check";

/// Errors surfaced while driving a run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("service {0:?} is not referenced in the configuration")]
    ServiceNotFound(String),

    #[error("service {service:?} has no {action:?} action")]
    ActionNotFound { service: String, action: String },

    #[error(transparent)]
    Variable(#[from] VariableError),

    #[error("invalid target on {entity}: {source}")]
    BadTarget {
        entity: String,
        source: NodeSetParseError,
    },

    #[error("the task runtime closed its event channel")]
    RunnerClosed,
}

/// Node filters and simulation switches applying to a whole run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Keep only these nodes in every action target.
    pub restrict: Option<NodeSet>,
    /// Remove these nodes from every action target.
    pub exclude: Option<NodeSet>,
    /// Treat every entity as simulated: evaluate the graph, dispatch
    /// nothing.
    pub dry_run: bool,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every reachable entity resolved; `status` is the worst status among
    /// the requested services.
    Completed { status: Status },
    /// The cancellation token tripped mid-run.
    Interrupted,
}

/// The dependency-driven execution engine.
///
/// Owns the service graph, the fan-out bookkeeping, the task runner and
/// the observer. Built once from loaded configuration and reused across
/// runs; every run starts by resetting the reachable part of the graph.
pub struct Engine {
    graph: ServiceGraph,
    manager: ActionManager,
    runner: Box<dyn TaskRunner>,
    events: UnboundedReceiver<RuntimeEvent>,
    view: Box<dyn UserView>,
    options: RunOptions,
    verb: String,
    reverse: bool,
    /// Services taking part in the current run; dependents outside this
    /// set are never triggered.
    reachable: Vec<bool>,
}

impl Engine {
    pub fn new(
        graph: ServiceGraph,
        runner: Box<dyn TaskRunner>,
        events: UnboundedReceiver<RuntimeEvent>,
        view: Box<dyn UserView>,
    ) -> Self {
        Self {
            graph,
            manager: ActionManager::new(DEFAULT_FANOUT),
            runner,
            events,
            view,
            options: RunOptions::default(),
            verb: String::new(),
            reverse: false,
            reachable: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_default_fanout(mut self, fanout: usize) -> Self {
        self.manager = ActionManager::new(fanout);
        self
    }

    pub fn graph(&self) -> &ServiceGraph {
        &self.graph
    }

    // -------------------------------------------------------------------
    // Entry point
    // -------------------------------------------------------------------

    /// Drive `verb` across the named services (all top-level services when
    /// empty) and block until every reachable entity is resolved.
    pub async fn call_services(
        &mut self,
        names: &[String],
        verb: &str,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let roots: Vec<ServiceId> = if names.is_empty() {
            self.graph.top_level_services()
        } else {
            names
                .iter()
                .map(|name| {
                    self.graph
                        .service_by_name(name)
                        .ok_or_else(|| EngineError::ServiceNotFound(name.clone()))
                })
                .collect::<Result<_, _>>()?
        };

        self.verb = verb.to_owned();
        self.reverse = verb == REVERSE_VERB;

        // Stale events from an aborted previous run must not drive this one.
        while self.events.try_recv().is_ok() {}

        let reachable = self.graph.reachable(&roots, self.reverse);
        self.reachable = vec![false; self.graph.service_count()];
        for &sid in &reachable {
            self.reachable[sid.0] = true;
            self.graph.reset(sid);
        }

        tracing::info!(verb, services = roots.len(), "starting run");
        let run_verb = self.verb.clone();
        for &sid in &roots {
            self.prepare_service(sid, &run_verb)?;
        }

        while !self.manager.is_idle() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::warn!(verb = %self.verb, "run interrupted");
                    return Ok(RunOutcome::Interrupted);
                }
                event = self.events.recv() => match event {
                    None => return Err(EngineError::RunnerClosed),
                    Some(RuntimeEvent::WorkerClosed { action, report }) => {
                        self.on_worker_closed(action, report)?;
                    }
                    Some(RuntimeEvent::TimerFired { action }) => {
                        self.on_timer_fired(action)?;
                    }
                },
            }
        }

        let status = roots
            .iter()
            .map(|sid| self.graph.service(*sid).status)
            .max_by_key(|s| s.severity())
            .unwrap_or(Status::Done);
        tracing::info!(verb = %self.verb, %status, "run finished");
        Ok(RunOutcome::Completed { status })
    }

    // -------------------------------------------------------------------
    // Service layer
    // -------------------------------------------------------------------

    /// Recursive leaves-first walk: drive this service if its deps are
    /// resolved, otherwise descend into the unresolved ones.
    fn prepare_service(&mut self, sid: ServiceId, verb: &str) -> Result<(), EngineError> {
        let status = self.graph.service(sid).status;
        if status.is_terminal() || status == Status::InProgress {
            return Ok(());
        }

        // Pin the verb on first touch; a later prepare through another
        // path (e.g. a check edge racing a require edge) keeps the first.
        if self.graph.service(sid).last_action.is_none() {
            self.graph.service_mut(sid).last_action = Some(verb.to_owned());
        }
        let verb = self
            .graph
            .service(sid)
            .last_action
            .clone()
            .unwrap_or_else(|| verb.to_owned());

        let deps = self.graph.deps_for(sid, self.reverse);
        let states: Vec<(DepKind, Status)> = deps
            .iter()
            .map(|(tid, kind)| (*kind, self.graph.service(*tid).status))
            .collect();
        match eval_dep_states(states) {
            DepsStatus::Error => {
                tracing::debug!(
                    service = %self.graph.fullname(sid),
                    "strong dependency failed, skipping"
                );
                self.set_service_status(sid, Status::Error)
            }
            DepsStatus::Waiting => Ok(()),
            DepsStatus::NoStatus => {
                for (tid, kind) in deps {
                    if self.graph.service(tid).status == Status::NoStatus {
                        let dep_verb = if kind == DepKind::Check {
                            CHECK_VERB
                        } else {
                            verb.as_str()
                        };
                        self.prepare_service(tid, dep_verb)?;
                    }
                }
                Ok(())
            }
            DepsStatus::Done | DepsStatus::Warnings => self.start_service(sid, &verb),
        }
    }

    /// Dependencies are resolved: enter the in-progress phase and drive
    /// the verb's action (or the members, for a group).
    fn start_service(&mut self, sid: ServiceId, verb: &str) -> Result<(), EngineError> {
        self.graph.service_mut(sid).status = Status::InProgress;
        let snapshot = EntitySnapshot::Service(self.service_snapshot(sid));
        self.view.ev_started(&snapshot);
        tracing::info!(service = %self.graph.fullname(sid), verb, "service started");

        if self.graph.service(sid).is_group() {
            let members = self.graph.service(sid).members.clone();
            for member in members {
                self.prepare_service(member, verb)?;
            }
            // Members may have resolved synchronously (simulate chains).
            return self.maybe_finish_group(sid);
        }

        match self.graph.find_action(sid, verb) {
            Some(aid) => self.prepare_action(aid),
            None if verb == DIAGNOSTIC_VERB => self.set_service_status(sid, Status::Done),
            None => Err(EngineError::ActionNotFound {
                service: self.graph.fullname(sid),
                action: verb.to_owned(),
            }),
        }
    }

    /// Join member statuses once every member of a group is terminal.
    fn maybe_finish_group(&mut self, gid: ServiceId) -> Result<(), EngineError> {
        if self.graph.service(gid).status != Status::InProgress {
            return Ok(());
        }
        let members = self.graph.service(gid).members.clone();
        if members
            .iter()
            .any(|m| !self.graph.service(*m).status.is_terminal())
        {
            return Ok(());
        }
        let mut joined = Status::Done;
        for member in &members {
            let status = self.graph.service(*member).status;
            let mapped = if status.is_failed() {
                Status::Error
            } else if status == Status::Warning {
                Status::Warning
            } else {
                Status::Done
            };
            if mapped.severity() > joined.severity() {
                joined = mapped;
            }
        }
        self.set_service_status(gid, joined)
    }

    /// Assign a service status, escalate `Done` to `Warning` when a weak
    /// dependency failed, and trigger resolved dependents.
    fn set_service_status(&mut self, sid: ServiceId, status: Status) -> Result<(), EngineError> {
        let mut status = status;
        if status == Status::Done {
            let states: Vec<(DepKind, Status)> = self
                .graph
                .deps_for(sid, self.reverse)
                .iter()
                .map(|(tid, kind)| (*kind, self.graph.service(*tid).status))
                .collect();
            if eval_dep_states(states) == DepsStatus::Warnings {
                status = Status::Warning;
            }
        }

        self.graph.service_mut(sid).status = status;
        let snapshot = EntitySnapshot::Service(self.service_snapshot(sid));
        self.view.ev_status_changed(&snapshot);
        if !status.is_terminal() {
            return Ok(());
        }
        tracing::info!(service = %self.graph.fullname(sid), %status, "service resolved");
        self.view.ev_complete(&snapshot);

        if let Some(gid) = self.graph.service(sid).group {
            self.maybe_finish_group(gid)?;
        }

        for did in self.graph.dependents_for(sid, self.reverse) {
            if !self.reachable[did.0] {
                continue;
            }
            if self.graph.service(did).status != Status::NoStatus {
                continue;
            }
            let verb = self
                .graph
                .service(did)
                .last_action
                .clone()
                .unwrap_or_else(|| self.verb.clone());
            let triggered = EntitySnapshot::Service(self.service_snapshot(did));
            self.view.ev_trigger_dep(&snapshot, &triggered);
            tracing::debug!(
                source = %self.graph.fullname(sid),
                triggered = %self.graph.fullname(did),
                "dependency resolved, triggering dependent"
            );
            self.prepare_service(did, &verb)?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Action layer
    // -------------------------------------------------------------------

    /// Recursive leaves-first walk over the action graph of one service.
    fn prepare_action(&mut self, aid: ActionId) -> Result<(), EngineError> {
        if self.graph.action(aid).status != Status::NoStatus {
            return Ok(());
        }
        let deps: Vec<(ActionId, DepKind)> = self
            .graph
            .action(aid)
            .deps
            .iter()
            .map(|d| (d.target, d.kind))
            .collect();
        let states: Vec<(DepKind, Status)> = deps
            .iter()
            .map(|(tid, kind)| (*kind, self.graph.action(*tid).status))
            .collect();
        match eval_dep_states(states) {
            DepsStatus::Waiting => Ok(()),
            DepsStatus::NoStatus => {
                for (tid, _) in deps {
                    if self.graph.action(tid).status == Status::NoStatus {
                        self.prepare_action(tid)?;
                    }
                }
                Ok(())
            }
            joined @ (DepsStatus::Error | DepsStatus::Done | DepsStatus::Warnings) => {
                let action = self.graph.action(aid);
                let simulate = action.simulate || self.options.dry_run;
                if action.command.is_none() || simulate {
                    // Nothing to dispatch; a failed strong dependency in
                    // the chain resolves straight to Error.
                    let status = if joined == DepsStatus::Error {
                        Status::Error
                    } else {
                        Status::Done
                    };
                    self.update_action_status(aid, status)
                } else {
                    // A dispatchable action still runs after a failed
                    // action dependency; the service is classified by
                    // its last action.
                    self.graph.action_mut(aid).status = Status::Waiting;
                    self.schedule(aid, true)
                }
            }
        }
    }

    /// Hand the action to the dispatcher, honoring its delay on the first
    /// pass and after a retry.
    fn schedule(&mut self, aid: ActionId, allow_delay: bool) -> Result<(), EngineError> {
        if self.graph.action(aid).start_time.is_none() {
            self.graph.action_mut(aid).start_time = Some(Utc::now());
        }
        let delay = self.graph.action(aid).delay;
        if allow_delay && !delay.is_zero() {
            self.manager.delay(aid);
            self.runner.timer(delay, aid);
            let snapshot = self.action_snapshot(aid);
            self.view.ev_delayed(&snapshot);
            tracing::debug!(
                action = %self.graph.action_label(aid),
                delay_s = delay.as_secs_f64(),
                "action delayed"
            );
            Ok(())
        } else {
            self.perform(aid)
        }
    }

    /// Dispatch now: resolve command and target, raise the fan-out cap if
    /// needed, ship the spec to the runner.
    fn perform(&mut self, aid: ActionId) -> Result<(), EngineError> {
        let Some(raw_command) = self.graph.action(aid).command.clone() else {
            return self.update_action_status(aid, Status::Done);
        };
        let command = self.interpolate_for(aid, &raw_command)?;
        let nodes = self.resolve_target(aid)?;
        if let Some(ns) = &nodes {
            if ns.is_empty() {
                // Node filters removed every target; nothing to run.
                return self.update_action_status(aid, Status::Done);
            }
        }

        let action = self.graph.action(aid);
        let fanout_setting = action.fanout;
        let fanout = match &nodes {
            Some(ns) => fanout_setting
                .unwrap_or_else(|| self.manager.default_fanout())
                .min(ns.len()),
            None => 1,
        };
        let timeout = Some(action.timeout).filter(|t| !t.is_zero());
        let label = self.graph.action_label(aid);

        if let Some(cap) = self.manager.add(aid, fanout_setting) {
            self.runner.set_fanout(cap);
        }
        self.runner.dispatch(CommandSpec {
            action: aid,
            label: label.clone(),
            command,
            nodes,
            timeout,
            fanout,
        });
        let snapshot = EntitySnapshot::Action(self.action_snapshot(aid));
        self.view.ev_started(&snapshot);
        self.publish_running();
        tracing::debug!(action = %label, "action dispatched");
        Ok(())
    }

    /// A delay timer elapsed: dispatch for real this time.
    fn on_timer_fired(&mut self, aid: ActionId) -> Result<(), EngineError> {
        self.manager.undelay(aid);
        tracing::debug!(action = %self.graph.action_label(aid), "delay timer fired");
        self.schedule(aid, false)
    }

    /// A worker closed: collect the report, apply retry policy or settle
    /// the action status.
    fn on_worker_closed(
        &mut self,
        aid: ActionId,
        report: WorkerReport,
    ) -> Result<(), EngineError> {
        self.graph.action_mut(aid).stop_time = Some(Utc::now());
        if let Some(cap) = self.manager.remove(aid) {
            self.runner.set_fanout(cap);
        }
        self.publish_running();
        self.graph.action_mut(aid).report = Some(report);

        let action = self.graph.action(aid);
        let too_many = action.has_too_many_errors();
        let timed_out = action.has_timed_out();
        if (too_many || timed_out) && action.retry() > 0 {
            self.graph.action_mut(aid).consume_retry();
            tracing::info!(
                action = %self.graph.action_label(aid),
                remaining = self.graph.action(aid).retry(),
                "action failed, retrying"
            );
            return self.schedule(aid, true);
        }

        let status = if too_many {
            Status::TooManyErrors
        } else if timed_out {
            Status::TimedOut
        } else {
            Status::Done
        };
        tracing::debug!(action = %self.graph.action_label(aid), %status, "worker closed");
        self.update_action_status(aid, status)
    }

    /// Assign an action status; on terminal, trigger ready dependent
    /// actions, or notify the owning service when this was the last one.
    fn update_action_status(&mut self, aid: ActionId, status: Status) -> Result<(), EngineError> {
        self.graph.action_mut(aid).status = status;
        let snapshot = EntitySnapshot::Action(self.action_snapshot(aid));
        self.view.ev_status_changed(&snapshot);
        if !status.is_terminal() {
            return Ok(());
        }
        self.view.ev_complete(&snapshot);

        let dependents = self.graph.action(aid).dependents.clone();
        if dependents.is_empty() {
            let sid = self.graph.action(aid).service;
            return self.finish_service_action(sid, status);
        }
        for did in dependents {
            let dependent = self.graph.action(did);
            if dependent.status != Status::NoStatus {
                continue;
            }
            let ready = dependent
                .deps
                .iter()
                .all(|d| self.graph.action(d.target).status.is_terminal());
            if !ready {
                continue;
            }
            let triggered = EntitySnapshot::Action(self.action_snapshot(did));
            self.view.ev_trigger_dep(&snapshot, &triggered);
            self.prepare_action(did)?;
        }
        Ok(())
    }

    /// The last action of the current verb settled; classify the service.
    fn finish_service_action(&mut self, sid: ServiceId, status: Status) -> Result<(), EngineError> {
        if self.graph.service(sid).status.is_terminal() {
            return Ok(());
        }
        self.set_service_status(sid, status)
    }

    // -------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------

    fn interpolate_for(&self, aid: ActionId, text: &str) -> Result<String, VariableError> {
        let action = self.graph.action(aid);
        let service = self.graph.service(action.service);
        expand(
            text,
            &[&action.variables, &service.variables, &self.graph.variables],
        )
    }

    /// Resolved, filtered node set of an action; `None` means local.
    fn resolve_target(&self, aid: ActionId) -> Result<Option<NodeSet>, EngineError> {
        let raw = match &self.graph.action(aid).target {
            Some(raw) => raw.clone(),
            None => return Ok(None),
        };
        let expanded = self.interpolate_for(aid, &raw)?;
        let mut nodes = NodeSet::parse(&expanded).map_err(|source| EngineError::BadTarget {
            entity: self.graph.action_label(aid),
            source,
        })?;
        if let Some(only) = &self.options.restrict {
            nodes = nodes.intersect(only);
        }
        if let Some(excluded) = &self.options.exclude {
            nodes = nodes.subtract(excluded);
        }
        Ok(Some(nodes))
    }

    fn publish_running(&mut self) {
        let names: Vec<String> = self
            .manager
            .running_ids()
            .iter()
            .map(|aid| self.graph.fullname(self.graph.action(*aid).service))
            .collect();
        self.view.ev_running(&names);
    }

    fn action_snapshot(&self, aid: ActionId) -> ActionSnapshot {
        let action = self.graph.action(aid);
        let resolve = |raw: &String| {
            self.interpolate_for(aid, raw)
                .unwrap_or_else(|_| raw.clone())
        };
        ActionSnapshot {
            name: action.name.clone(),
            service: self.graph.fullname(action.service),
            status: action.status,
            command: action.command.as_ref().map(resolve),
            target: action.target.as_ref().map(resolve),
            delay: action.delay,
            duration: action.duration(),
            report: action.report.clone(),
        }
    }

    fn service_snapshot(&self, sid: ServiceId) -> ServiceSnapshot {
        let service = self.graph.service(sid);
        ServiceSnapshot {
            name: self.graph.fullname(sid),
            status: service.status,
            simulate: service.simulate || self.options.dry_run,
        }
    }
}
