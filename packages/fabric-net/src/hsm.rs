//! A small hierarchical state machine, generic enough to back both the
//! relay listener's per-registration lifecycle and a framed connection's
//! lifecycle. States are named by string rather than by a closed Rust enum
//! because states and sub-machines are composed at construction time, the
//! same way the teacher composes its middleware pipeline from a list of
//! layers rather than a fixed type.

use std::collections::HashMap;
use std::sync::Arc;

use crate::observer::Observable;

/// What happens to a composite state's internal state when it is
/// re-entered: start fresh from its initial state, or resume the leaf it
/// was in when last left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryLevel {
    Reset,
    RestoreLast,
}

struct Transition {
    event: String,
    from: String,
    to: String,
    history: HistoryLevel,
}

/// A state, together with an optional nested machine describing its
/// internal structure (a composite state).
struct StateNode {
    sub_machine: Option<StateMachine>,
}

/// A nested state machine: typed events, named states, and transitions
/// between them, with history-aware re-entry of composite states.
///
/// Events are delivered to the deepest active sub-machine first; if it
/// does not consume the event, the event bubbles up to this machine's own
/// transition table (spec §4.2).
pub struct StateMachine {
    states: HashMap<String, StateNode>,
    events: Vec<String>,
    transitions: Vec<Transition>,
    initial_state: Option<String>,
    current: Option<String>,
    last_leaf: HashMap<String, String>,
    pub on_enter: Arc<Observable<String>>,
    pub on_leave: Arc<Observable<String>>,
    pub on_change: Arc<Observable<(String, String)>>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
            events: Vec::new(),
            transitions: Vec::new(),
            initial_state: None,
            current: None,
            last_leaf: HashMap::new(),
            on_enter: Arc::new(Observable::new()),
            on_leave: Arc::new(Observable::new()),
            on_change: Arc::new(Observable::new()),
        }
    }

    pub fn add_state(&mut self, name: impl Into<String>, sub_machine: Option<StateMachine>) {
        self.states.insert(name.into(), StateNode { sub_machine });
    }

    pub fn add_event(&mut self, name: impl Into<String>) {
        self.events.push(name.into());
    }

    pub fn add_transition(
        &mut self,
        event: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        history: HistoryLevel,
    ) {
        self.transitions.push(Transition {
            event: event.into(),
            from: from.into(),
            to: to.into(),
            history,
        });
    }

    pub fn set_initial_state(&mut self, name: impl Into<String>) {
        self.initial_state = Some(name.into());
    }

    /// Enters the configured initial state. Must be called once before
    /// `handle_event`.
    pub fn start(&mut self) {
        if let Some(initial) = self.initial_state.clone() {
            self.enter(&initial, HistoryLevel::Reset);
        }
    }

    #[must_use]
    pub fn current_state(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Follows the active sub-machine chain down to its innermost active
    /// leaf, returning the full path (spec §4.2, `locateState`).
    #[must_use]
    pub fn locate_state(&self) -> Vec<String> {
        let mut path = Vec::new();
        let mut cursor = self;
        while let Some(current) = cursor.current.clone() {
            path.push(current.clone());
            match cursor.states.get(&current).and_then(|n| n.sub_machine.as_ref()) {
                Some(sub) => cursor = sub,
                None => break,
            }
        }
        path
    }

    /// Delivers `event`, innermost sub-machine first. Returns whether the
    /// event was consumed anywhere in the chain (spec §4.2: "bubble up
    /// until consumed or rejected").
    pub fn handle_event(&mut self, event: &str) -> bool {
        let current = match self.current.clone() {
            Some(c) => c,
            None => return false,
        };

        if let Some(node) = self.states.get_mut(&current) {
            if let Some(sub) = node.sub_machine.as_mut() {
                if sub.handle_event(event) {
                    return true;
                }
            }
        }

        let matched = self
            .transitions
            .iter()
            .find(|t| t.event == event && t.from == current)
            .map(|t| (t.to.clone(), t.history));

        match matched {
            Some((to, history)) => {
                self.leave(&current);
                self.enter(&to, history);
                self.on_change.emit(&(current, to));
                true
            }
            None => false,
        }
    }

    fn leave(&mut self, state: &str) {
        if let Some(node) = self.states.get_mut(state) {
            if let Some(sub) = node.sub_machine.as_mut() {
                if let Some(leaf) = sub.current.clone() {
                    self.last_leaf.insert(state.to_string(), leaf);
                }
            }
        }
        self.on_leave.emit(&state.to_string());
    }

    fn enter(&mut self, state: &str, history: HistoryLevel) {
        self.current = Some(state.to_string());
        self.on_enter.emit(&state.to_string());

        let remembered = self.last_leaf.get(state).cloned();
        if let Some(node) = self.states.get_mut(state) {
            if let Some(sub) = node.sub_machine.as_mut() {
                match (history, remembered) {
                    (HistoryLevel::RestoreLast, Some(leaf)) => sub.enter(&leaf, HistoryLevel::Reset),
                    _ => sub.start(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_machine() -> StateMachine {
        let mut sm = StateMachine::new();
        sm.add_state("idle", None);
        sm.add_state("running", None);
        sm.add_state("done", None);
        sm.add_event("start");
        sm.add_event("finish");
        sm.add_transition("start", "idle", "running", HistoryLevel::Reset);
        sm.add_transition("finish", "running", "done", HistoryLevel::Reset);
        sm.set_initial_state("idle");
        sm.start();
        sm
    }

    #[test]
    fn transitions_on_matching_event() {
        let mut sm = simple_machine();
        assert_eq!(sm.current_state(), Some("idle"));
        assert!(sm.handle_event("start"));
        assert_eq!(sm.current_state(), Some("running"));
        assert!(sm.handle_event("finish"));
        assert_eq!(sm.current_state(), Some("done"));
    }

    #[test]
    fn unmatched_event_is_rejected() {
        let mut sm = simple_machine();
        assert!(!sm.handle_event("finish"));
        assert_eq!(sm.current_state(), Some("idle"));
    }

    #[test]
    fn nested_events_consumed_innermost_first() {
        let mut inner = StateMachine::new();
        inner.add_state("a", None);
        inner.add_state("b", None);
        inner.add_event("inner_go");
        inner.add_transition("inner_go", "a", "b", HistoryLevel::Reset);
        inner.set_initial_state("a");

        let mut outer = StateMachine::new();
        outer.add_state("composite", Some(inner));
        outer.add_state("other", None);
        outer.add_event("inner_go");
        outer.add_event("outer_go");
        outer.add_transition("outer_go", "composite", "other", HistoryLevel::Reset);
        outer.set_initial_state("composite");
        outer.start();

        // "inner_go" is consumed by the nested machine, not bubbled.
        assert!(outer.handle_event("inner_go"));
        assert_eq!(outer.current_state(), Some("composite"));
        assert_eq!(outer.locate_state(), vec!["composite".to_string(), "b".to_string()]);

        assert!(outer.handle_event("outer_go"));
        assert_eq!(outer.current_state(), Some("other"));
    }

    #[test]
    fn history_restore_resumes_last_leaf() {
        let mut inner = StateMachine::new();
        inner.add_state("a", None);
        inner.add_state("b", None);
        inner.add_event("advance");
        inner.add_transition("advance", "a", "b", HistoryLevel::Reset);
        inner.set_initial_state("a");

        let mut outer = StateMachine::new();
        outer.add_state("composite", Some(inner));
        outer.add_state("other", None);
        outer.add_event("advance");
        outer.add_event("leave");
        outer.add_event("return");
        outer.add_transition("leave", "composite", "other", HistoryLevel::Reset);
        outer.add_transition("return", "other", "composite", HistoryLevel::RestoreLast);
        outer.set_initial_state("composite");
        outer.start();

        outer.handle_event("advance"); // composite/a -> composite/b
        outer.handle_event("leave"); // composite -> other (remembers "b")
        outer.handle_event("return"); // other -> composite, restored at "b"

        assert_eq!(outer.locate_state(), vec!["composite".to_string(), "b".to_string()]);
    }
}
