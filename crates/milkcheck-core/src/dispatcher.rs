//! Fan-out-limited action bookkeeping.
//!
//! The [`ActionManager`] tracks which actions are dispatched or sitting
//! behind a delay timer, and derives the global concurrent-worker cap as
//! the maximum fan-out over the running set. A low-concurrency action must
//! not throttle the whole run, so the cap rises when a wider action joins
//! and falls back once it leaves.

use crate::graph::ActionId;

/// Default concurrent-worker cap when no running action specifies one.
pub const DEFAULT_FANOUT: usize = 64;

/// Running and delayed action sets plus fan-out accounting.
#[derive(Debug)]
pub struct ActionManager {
    /// Dispatched actions with their effective fan-out, insertion order.
    running: Vec<(ActionId, usize)>,
    /// Actions parked behind a delay timer.
    delayed: Vec<ActionId>,
    default_fanout: usize,
    current_cap: usize,
}

impl ActionManager {
    pub fn new(default_fanout: usize) -> Self {
        Self {
            running: Vec::new(),
            delayed: Vec::new(),
            default_fanout,
            current_cap: default_fanout,
        }
    }

    pub fn default_fanout(&self) -> usize {
        self.default_fanout
    }

    /// Register a dispatched action. Returns the new global cap when the
    /// registration changes it.
    pub fn add(&mut self, id: ActionId, fanout: Option<usize>) -> Option<usize> {
        self.running.push((id, fanout.unwrap_or(self.default_fanout)));
        self.recompute_cap()
    }

    /// Deregister a closed action. Returns the new global cap when the
    /// removal lowers it.
    pub fn remove(&mut self, id: ActionId) -> Option<usize> {
        self.running.retain(|(aid, _)| *aid != id);
        self.recompute_cap()
    }

    /// Park an action behind its delay timer.
    pub fn delay(&mut self, id: ActionId) {
        if !self.delayed.contains(&id) {
            self.delayed.push(id);
        }
    }

    /// Unpark an action whose timer fired.
    pub fn undelay(&mut self, id: ActionId) {
        self.delayed.retain(|aid| *aid != id);
    }

    /// Whether an action is currently running or delayed.
    pub fn is_scheduled(&self, id: ActionId) -> bool {
        self.delayed.contains(&id) || self.running.iter().any(|(aid, _)| *aid == id)
    }

    /// Whether nothing is running or delayed.
    pub fn is_idle(&self) -> bool {
        self.running.is_empty() && self.delayed.is_empty()
    }

    /// Snapshot of dispatched actions, insertion order.
    pub fn running_ids(&self) -> Vec<ActionId> {
        self.running.iter().map(|(id, _)| *id).collect()
    }

    fn recompute_cap(&mut self) -> Option<usize> {
        let cap = self
            .running
            .iter()
            .map(|(_, fanout)| *fanout)
            .max()
            .unwrap_or(self.default_fanout);
        if cap != self.current_cap {
            self.current_cap = cap;
            Some(cap)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle_at_default_cap() {
        let mgr = ActionManager::new(64);
        assert!(mgr.is_idle());
        assert_eq!(mgr.default_fanout(), 64);
    }

    #[test]
    fn cap_is_max_over_running_set() {
        let mut mgr = ActionManager::new(64);
        assert_eq!(mgr.add(ActionId(0), Some(16)), Some(16));
        // A narrower action does not lower the cap while the wide one runs.
        assert_eq!(mgr.add(ActionId(1), Some(4)), None);
        // The wide action closing lowers the cap.
        assert_eq!(mgr.remove(ActionId(0)), Some(4));
        // Last one out restores the default.
        assert_eq!(mgr.remove(ActionId(1)), Some(64));
    }

    #[test]
    fn unspecified_fanout_uses_default() {
        let mut mgr = ActionManager::new(32);
        assert_eq!(mgr.add(ActionId(0), None), None);
        assert_eq!(mgr.add(ActionId(1), Some(8)), None);
        assert_eq!(mgr.remove(ActionId(0)), Some(8));
    }

    #[test]
    fn scheduled_covers_running_and_delayed() {
        let mut mgr = ActionManager::new(64);
        mgr.delay(ActionId(0));
        assert!(mgr.is_scheduled(ActionId(0)));
        assert!(!mgr.is_idle());
        mgr.undelay(ActionId(0));
        mgr.add(ActionId(0), None);
        assert!(mgr.is_scheduled(ActionId(0)));
        mgr.remove(ActionId(0));
        assert!(!mgr.is_scheduled(ActionId(0)));
        assert!(mgr.is_idle());
    }

    #[test]
    fn running_snapshot_keeps_insertion_order() {
        let mut mgr = ActionManager::new(64);
        mgr.add(ActionId(2), None);
        mgr.add(ActionId(0), None);
        mgr.add(ActionId(1), None);
        assert_eq!(
            mgr.running_ids(),
            vec![ActionId(2), ActionId(0), ActionId(1)]
        );
    }
}
