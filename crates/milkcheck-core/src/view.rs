//! The observer seam between the engine and a front end.
//!
//! The engine publishes lifecycle events with owned snapshots so a
//! renderer can branch on the entity kind and format output without
//! reaching back into engine state.

use std::time::Duration;

use crate::entity::Status;
use crate::runner::WorkerReport;

/// Point-in-time copy of an action, taken when an event fires.
#[derive(Debug, Clone)]
pub struct ActionSnapshot {
    pub name: String,
    /// Fullname of the owning service.
    pub service: String,
    pub status: Status,
    /// Command after variable expansion, when resolvable.
    pub command: Option<String>,
    /// Resolved target, `None` for local runs.
    pub target: Option<String>,
    pub delay: Duration,
    /// Wall time of the last attempt in seconds, once finished.
    pub duration: Option<f64>,
    pub report: Option<WorkerReport>,
}

/// Point-in-time copy of a service, taken when an event fires.
#[derive(Debug, Clone)]
pub struct ServiceSnapshot {
    /// Fullname, group chain included.
    pub name: String,
    pub status: Status,
    pub simulate: bool,
}

/// Tagged union handed to every observer callback.
#[derive(Debug, Clone)]
pub enum EntitySnapshot {
    Action(ActionSnapshot),
    Service(ServiceSnapshot),
}

impl EntitySnapshot {
    pub fn name(&self) -> &str {
        match self {
            EntitySnapshot::Action(a) => &a.name,
            EntitySnapshot::Service(s) => &s.name,
        }
    }

    pub fn status(&self) -> Status {
        match self {
            EntitySnapshot::Action(a) => a.status,
            EntitySnapshot::Service(s) => s.status,
        }
    }
}

/// Observer interface the engine publishes to.
///
/// All methods default to no-ops so observers implement only what they
/// render.
pub trait UserView: Send {
    /// An entity started: a service entered its in-progress phase or an
    /// action was handed to the task runtime.
    fn ev_started(&mut self, _entity: &EntitySnapshot) {}

    /// An entity reached a terminal status.
    fn ev_complete(&mut self, _entity: &EntitySnapshot) {}

    /// An entity's status was assigned.
    fn ev_status_changed(&mut self, _entity: &EntitySnapshot) {}

    /// An action was parked behind its delay timer.
    fn ev_delayed(&mut self, _action: &ActionSnapshot) {}

    /// A resolved entity triggered a dependent.
    fn ev_trigger_dep(&mut self, _source: &EntitySnapshot, _triggered: &EntitySnapshot) {}

    /// The set of dispatched actions changed; `running` holds the owning
    /// service fullnames in dispatch order.
    fn ev_running(&mut self, _running: &[String]) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default)]
pub struct NoopView;

impl UserView for NoopView {}
