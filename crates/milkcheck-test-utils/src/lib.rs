//! Shared test utilities: a deterministic scripted task runner.
//!
//! The scripted runner resolves every dispatch synchronously from a
//! per-action outcome queue and delivers events through the engine's
//! channel in FIFO order, so a test run is fully reproducible: same
//! config, same script, same dispatch order, same statuses.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use milkcheck_core::Engine;
use milkcheck_core::graph::ActionId;
use milkcheck_core::nodeset::NodeSet;
use milkcheck_core::runner::{CommandSpec, RuntimeEvent, TaskRunner, WorkerReport};
use milkcheck_core::view::{NoopView, UserView};

/// Scripted result of one dispatch attempt.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Every targeted node exits with this code.
    Exit(i32),
    /// Per-node exit codes; unlisted nodes exit 0.
    ExitNodes(Vec<(&'static str, i32)>),
    /// The worker closes with its timeout flag set.
    TimedOut,
}

/// Everything the scripted runner observed, for assertions.
#[derive(Debug, Default)]
pub struct ScriptLog {
    /// `service.action` labels in dispatch order.
    pub dispatches: Vec<String>,
    /// Folded target of each dispatch, `None` for local runs.
    pub targets: Vec<Option<String>>,
    /// Every fan-out cap pushed through `set_fanout`, in order.
    pub fanouts: Vec<usize>,
    /// Delays of armed timers, in order.
    pub timers: Vec<Duration>,
}

/// Task runner that answers dispatches from a scripted outcome queue.
///
/// Unscripted actions succeed with exit 0. Timers fire immediately (the
/// event is queued behind whatever is already in flight), keeping runs
/// instantaneous and deterministic.
pub struct ScriptedRunner {
    events: UnboundedSender<RuntimeEvent>,
    script: HashMap<String, VecDeque<Outcome>>,
    log: Arc<Mutex<ScriptLog>>,
}

impl ScriptedRunner {
    pub fn new(events: UnboundedSender<RuntimeEvent>) -> Self {
        Self {
            events,
            script: HashMap::new(),
            log: Arc::new(Mutex::new(ScriptLog::default())),
        }
    }

    /// Queue outcomes for an action label (`service.action`), one per
    /// dispatch attempt.
    pub fn with_outcomes(mut self, label: &str, outcomes: Vec<Outcome>) -> Self {
        self.script.insert(label.to_owned(), outcomes.into());
        self
    }

    /// Shared handle onto the observation log.
    pub fn log(&self) -> Arc<Mutex<ScriptLog>> {
        Arc::clone(&self.log)
    }
}

impl TaskRunner for ScriptedRunner {
    fn dispatch(&mut self, spec: CommandSpec) {
        {
            let mut log = self.log.lock().unwrap();
            log.dispatches.push(spec.label.clone());
            log.targets.push(spec.nodes.as_ref().map(|n| n.to_string()));
        }
        let outcome = self
            .script
            .get_mut(&spec.label)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Outcome::Exit(0));
        let report = report_for(&spec, &outcome);
        let _ = self.events.send(RuntimeEvent::WorkerClosed {
            action: spec.action,
            report,
        });
    }

    fn timer(&mut self, delay: Duration, action: ActionId) {
        self.log.lock().unwrap().timers.push(delay);
        let _ = self.events.send(RuntimeEvent::TimerFired { action });
    }

    fn set_fanout(&mut self, limit: usize) {
        self.log.lock().unwrap().fanouts.push(limit);
    }
}

fn report_for(spec: &CommandSpec, outcome: &Outcome) -> WorkerReport {
    let local = spec.nodes.is_none();
    let nodes = spec.nodes.clone().unwrap_or_else(|| {
        let mut set = NodeSet::new();
        set.push("localhost");
        set
    });
    match outcome {
        Outcome::Exit(rc) => WorkerReport {
            retcodes: vec![(*rc, nodes)],
            outputs: Vec::new(),
            timed_out: false,
            local,
        },
        Outcome::ExitNodes(pairs) => {
            let mut by_rc: BTreeMap<i32, NodeSet> = BTreeMap::new();
            for node in nodes.iter() {
                let rc = pairs
                    .iter()
                    .find(|(n, _)| *n == node)
                    .map(|(_, rc)| *rc)
                    .unwrap_or(0);
                by_rc.entry(rc).or_default().push(node);
            }
            WorkerReport {
                retcodes: by_rc.into_iter().collect(),
                outputs: Vec::new(),
                timed_out: false,
                local,
            }
        }
        Outcome::TimedOut => WorkerReport {
            retcodes: Vec::new(),
            outputs: Vec::new(),
            timed_out: true,
            local,
        },
    }
}

/// Build an engine over an inline YAML config and a scripted runner.
///
/// Panics on config errors: fixtures are part of the test.
pub fn build_engine(
    yaml: &str,
    outcomes: Vec<(&str, Vec<Outcome>)>,
) -> (Engine, Arc<Mutex<ScriptLog>>) {
    build_engine_with_view(yaml, outcomes, Box::new(NoopView))
}

/// Like [`build_engine`], with a caller-provided observer.
pub fn build_engine_with_view(
    yaml: &str,
    outcomes: Vec<(&str, Vec<Outcome>)>,
    view: Box<dyn UserView>,
) -> (Engine, Arc<Mutex<ScriptLog>>) {
    let graph = milkcheck_core::config::load_str(yaml).expect("fixture config should load");
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let mut runner = ScriptedRunner::new(tx);
    for (label, outs) in outcomes {
        runner = runner.with_outcomes(label, outs);
    }
    let log = runner.log();
    let engine = Engine::new(graph, Box::new(runner), rx, view);
    (engine, log)
}
