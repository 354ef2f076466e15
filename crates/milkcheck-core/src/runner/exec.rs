//! Process-based transport: local `sh -c` and per-node ssh dispatch.
//!
//! One tokio task per node, bounded by a resizable global semaphore (the
//! fan-out gate) plus a per-dispatch cap. Per-node timeouts kill the
//! process and flag the report; the engine decides what a timeout means.

use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;

use super::{CommandSpec, RuntimeEvent, TaskRunner, WorkerReport};
use crate::graph::ActionId;
use crate::nodeset::NodeSet;

/// Exit code reported when a process cannot be spawned or awaited,
/// matching what ssh itself returns on connection failure.
const SPAWN_FAILURE_RC: i32 = 255;

/// Task runner executing commands as local shells or ssh sessions.
pub struct ExecRunner {
    events: UnboundedSender<RuntimeEvent>,
    gate: Arc<Semaphore>,
    cap: usize,
}

impl ExecRunner {
    pub fn new(events: UnboundedSender<RuntimeEvent>, fanout: usize) -> Self {
        Self {
            events,
            gate: Arc::new(Semaphore::new(fanout)),
            cap: fanout,
        }
    }
}

impl TaskRunner for ExecRunner {
    fn dispatch(&mut self, spec: CommandSpec) {
        let events = self.events.clone();
        let gate = Arc::clone(&self.gate);
        tokio::spawn(async move {
            let report = run_spec(&spec, &gate).await;
            let _ = events.send(RuntimeEvent::WorkerClosed {
                action: spec.action,
                report,
            });
        });
    }

    fn timer(&mut self, delay: Duration, action: ActionId) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(RuntimeEvent::TimerFired { action });
        });
    }

    fn set_fanout(&mut self, limit: usize) {
        if limit > self.cap {
            self.gate.add_permits(limit - self.cap);
        } else {
            // Takes effect as running workers release their permits.
            self.gate.forget_permits(self.cap - limit);
        }
        self.cap = limit;
    }
}

/// What one node's process produced. `rc` is `None` when the process was
/// killed on timeout.
struct NodeOutcome {
    rc: Option<i32>,
    output: String,
    timed_out: bool,
}

async fn run_spec(spec: &CommandSpec, gate: &Arc<Semaphore>) -> WorkerReport {
    match &spec.nodes {
        None => {
            let _permit = gate.acquire().await.ok();
            let outcome = run_shell(None, &spec.command, spec.timeout).await;
            let mut localhost = NodeSet::new();
            localhost.push("localhost");
            WorkerReport {
                retcodes: outcome.rc.map(|rc| (rc, localhost.clone())).into_iter().collect(),
                outputs: if outcome.output.is_empty() {
                    Vec::new()
                } else {
                    vec![(outcome.output, localhost)]
                },
                timed_out: outcome.timed_out,
                local: true,
            }
        }
        Some(nodes) => run_remote(spec, nodes, gate).await,
    }
}

async fn run_remote(spec: &CommandSpec, nodes: &NodeSet, gate: &Arc<Semaphore>) -> WorkerReport {
    let per_dispatch = Arc::new(Semaphore::new(spec.fanout.max(1)));
    let mut join = JoinSet::new();
    for node in nodes.iter() {
        let node = node.to_owned();
        let command = spec.command.clone();
        let timeout = spec.timeout;
        let gate = Arc::clone(gate);
        let per_dispatch = Arc::clone(&per_dispatch);
        join.spawn(async move {
            let _global = gate.acquire_owned().await.ok();
            let _local = per_dispatch.acquire_owned().await.ok();
            let outcome = run_shell(Some(&node), &command, timeout).await;
            (node, outcome)
        });
    }

    let mut outcomes: HashMap<String, NodeOutcome> = HashMap::new();
    while let Some(joined) = join.join_next().await {
        if let Ok((node, outcome)) = joined {
            outcomes.insert(node, outcome);
        }
    }

    // Group in node-set order so reports are deterministic.
    let mut timed_out = false;
    let mut by_rc: BTreeMap<i32, NodeSet> = BTreeMap::new();
    let mut by_output: BTreeMap<String, NodeSet> = BTreeMap::new();
    for node in nodes.iter() {
        let Some(outcome) = outcomes.get(node) else {
            continue;
        };
        timed_out |= outcome.timed_out;
        if let Some(rc) = outcome.rc {
            by_rc.entry(rc).or_default().push(node);
        }
        if !outcome.output.is_empty() {
            by_output.entry(outcome.output.clone()).or_default().push(node);
        }
    }

    WorkerReport {
        retcodes: by_rc.into_iter().collect(),
        outputs: by_output.into_iter().collect(),
        timed_out,
        local: false,
    }
}

/// Run one command, locally through `sh -c` or remotely through ssh.
async fn run_shell(node: Option<&str>, command: &str, timeout: Option<Duration>) -> NodeOutcome {
    let mut cmd = match node {
        None => {
            let mut c = Command::new("sh");
            c.arg("-c").arg(command);
            c
        }
        Some(node) => {
            let mut c = Command::new("ssh");
            c.arg("-oBatchMode=yes").arg(node).arg(command);
            c
        }
    };
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return NodeOutcome {
                rc: Some(SPAWN_FAILURE_RC),
                output: format!("failed to spawn: {e}"),
                timed_out: false,
            };
        }
    };

    let wait = child.wait_with_output();
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, wait).await {
            Ok(done) => done,
            Err(_elapsed) => {
                // kill_on_drop reaped the process when the future dropped.
                return NodeOutcome {
                    rc: None,
                    output: String::new(),
                    timed_out: true,
                };
            }
        },
        None => wait.await,
    };

    match result {
        Ok(output) => {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            NodeOutcome {
                rc: Some(output.status.code().unwrap_or(SPAWN_FAILURE_RC)),
                output: text.trim_end().to_owned(),
                timed_out: false,
            }
        }
        Err(e) => NodeOutcome {
            rc: Some(SPAWN_FAILURE_RC),
            output: format!("failed to collect output: {e}"),
            timed_out: false,
        },
    }
}
