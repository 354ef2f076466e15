//! The task-runtime seam: how the engine ships commands to nodes.
//!
//! The engine never runs a process itself. It hands a [`CommandSpec`] to a
//! [`TaskRunner`] and later receives a [`RuntimeEvent`] on the channel the
//! runner was built with. Implementations spawn whatever machinery they
//! need; the engine only requires that every dispatched spec eventually
//! produces exactly one `WorkerClosed` event and every armed timer exactly
//! one `TimerFired` event.

mod exec;

pub use exec::ExecRunner;

use std::time::Duration;

use crate::graph::ActionId;
use crate::nodeset::NodeSet;

/// One command dispatch, fully resolved (variables expanded, node filters
/// applied).
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub action: ActionId,
    /// `service.action` label, for logging and scripted runners.
    pub label: String,
    pub command: String,
    /// Target nodes; `None` runs the command locally.
    pub nodes: Option<NodeSet>,
    /// Per-node wall-time limit; `None` disables the timeout.
    pub timeout: Option<Duration>,
    /// Per-dispatch concurrency cap, already clamped to the node count.
    pub fanout: usize,
}

/// What a worker observed, grouped the way remote transports report it.
#[derive(Debug, Clone, Default)]
pub struct WorkerReport {
    /// Exit codes grouped by the nodes that returned them. Nodes that timed
    /// out do not appear here.
    pub retcodes: Vec<(i32, NodeSet)>,
    /// Captured output grouped by the nodes that produced it.
    pub outputs: Vec<(String, NodeSet)>,
    /// Whether any node hit the per-node timeout.
    pub timed_out: bool,
    /// Whether the command ran locally rather than over the wire.
    pub local: bool,
}

impl WorkerReport {
    /// Report for a local run with a single exit code.
    pub fn local(retcode: i32, output: impl Into<String>) -> Self {
        let mut nodes = NodeSet::new();
        nodes.push("localhost");
        let output = output.into();
        Self {
            retcodes: vec![(retcode, nodes.clone())],
            outputs: if output.is_empty() {
                Vec::new()
            } else {
                vec![(output, nodes)]
            },
            timed_out: false,
            local: true,
        }
    }

    /// Number of nodes that returned a nonzero exit code.
    pub fn error_count(&self) -> usize {
        self.retcodes
            .iter()
            .filter(|(rc, _)| *rc != 0)
            .map(|(_, nodes)| nodes.len())
            .sum()
    }
}

/// Events flowing from the task runtime back into the engine loop.
#[derive(Debug)]
pub enum RuntimeEvent {
    /// A dispatched worker finished (success, failure or timeout).
    WorkerClosed {
        action: ActionId,
        report: WorkerReport,
    },
    /// A delay timer armed with [`TaskRunner::timer`] elapsed.
    TimerFired { action: ActionId },
}

/// Transport abstraction the engine drives.
///
/// Methods are synchronous on purpose: a runner must never block the
/// engine loop, so dispatching means recording or spawning, with results
/// delivered asynchronously through the event channel.
pub trait TaskRunner: Send {
    /// Start executing a command on its target nodes.
    fn dispatch(&mut self, spec: CommandSpec);

    /// Arm a one-shot timer for a delayed action.
    fn timer(&mut self, delay: Duration, action: ActionId);

    /// Adjust the global concurrent-worker cap.
    fn set_fanout(&mut self, limit: usize);
}

// Compile-time assertion: TaskRunner must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn TaskRunner) {}
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_count_sums_failing_nodes() {
        let report = WorkerReport {
            retcodes: vec![
                (0, NodeSet::parse("node[1-3]").unwrap()),
                (1, NodeSet::parse("node[4-5]").unwrap()),
                (2, NodeSet::parse("node6").unwrap()),
            ],
            outputs: Vec::new(),
            timed_out: false,
            local: false,
        };
        assert_eq!(report.error_count(), 3);
    }

    #[test]
    fn local_report_has_one_node() {
        let report = WorkerReport::local(0, "ok\n");
        assert!(report.local);
        assert_eq!(report.error_count(), 0);
        assert_eq!(report.retcodes.len(), 1);
        assert!(report.retcodes[0].1.contains("localhost"));
    }

    #[test]
    fn local_report_drops_empty_output() {
        let report = WorkerReport::local(1, "");
        assert!(report.outputs.is_empty());
        assert_eq!(report.error_count(), 1);
    }
}
