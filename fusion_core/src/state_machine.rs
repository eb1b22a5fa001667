//! Generic trigger-driven state machine.
//!
//! One implementation serves both machine shapes in the system: the
//! algorithm-level machine (context = [`AlgorithmContext`]) and the
//! per-task machines owned by each task. The machine is parameterized by
//! the context type `C` handed to guards and hooks.
//!
//! Semantics:
//! - transitions are scanned in registration order; the first whose
//!   `from` matches the current state, whose trigger matches, and whose
//!   guard passes, wins
//! - effect order on a firing transition: current state's `on_exit`, the
//!   transition `action`, current-state switch, new state's `on_enter`
//! - self-loops are legal and fire exit/enter like any other transition
//! - an unmatched trigger is a silent no-op returning `false`
//!
//! [`AlgorithmContext`]: crate::context::AlgorithmContext

use std::collections::HashMap;

/// Hook invoked with mutable access to the machine's context.
pub type Hook<C> = Box<dyn Fn(&mut C) + Send + Sync>;

/// Predicate deciding whether a transition may fire.
pub type Guard<C> = Box<dyn Fn(&C) -> bool + Send + Sync>;

/// A named state with optional lifecycle hooks.
pub struct State<C> {
    name: String,
    on_enter: Option<Hook<C>>,
    on_exit: Option<Hook<C>>,
    on_update: Option<Hook<C>>,
}

impl<C> State<C> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            on_enter: None,
            on_exit: None,
            on_update: None,
        }
    }

    pub fn on_enter(mut self, hook: impl Fn(&mut C) + Send + Sync + 'static) -> Self {
        self.on_enter = Some(Box::new(hook));
        self
    }

    pub fn on_exit(mut self, hook: impl Fn(&mut C) + Send + Sync + 'static) -> Self {
        self.on_exit = Some(Box::new(hook));
        self
    }

    pub fn on_update(mut self, hook: impl Fn(&mut C) + Send + Sync + 'static) -> Self {
        self.on_update = Some(Box::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A trigger-driven edge between two states.
pub struct Transition<C> {
    from: String,
    to: String,
    trigger: String,
    guard: Option<Guard<C>>,
    action: Option<Hook<C>>,
}

impl<C> Transition<C> {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        trigger: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            trigger: trigger.into(),
            guard: None,
            action: None,
        }
    }

    pub fn with_guard(mut self, guard: impl Fn(&C) -> bool + Send + Sync + 'static) -> Self {
        self.guard = Some(Box::new(guard));
        self
    }

    pub fn with_action(mut self, action: impl Fn(&mut C) + Send + Sync + 'static) -> Self {
        self.action = Some(Box::new(action));
        self
    }
}

/// Trigger-driven state machine over a context type `C`.
pub struct StateMachine<C> {
    states: HashMap<String, State<C>>,
    transitions: Vec<Transition<C>>,
    initial: String,
    current: String,
}

impl<C> StateMachine<C> {
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
            transitions: Vec::new(),
            initial: String::new(),
            current: String::new(),
        }
    }

    /// Adds a state. The first state added becomes the initial state
    /// unless [`initial_state`](Self::initial_state) overrides it.
    pub fn add_state(mut self, state: State<C>) -> Self {
        if self.initial.is_empty() {
            self.initial = state.name.clone();
            self.current = state.name.clone();
        }
        self.states.insert(state.name.clone(), state);
        self
    }

    /// Adds a transition. Registration order is the match order.
    pub fn add_transition(mut self, transition: Transition<C>) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn initial_state(mut self, name: impl Into<String>) -> Self {
        self.initial = name.into();
        self.current = self.initial.clone();
        self
    }

    pub fn current(&self) -> &str {
        &self.current
    }

    pub fn initial(&self) -> &str {
        &self.initial
    }

    /// Resets to the initial state and fires its `on_enter`.
    pub fn start(&mut self, ctx: &mut C) {
        self.current = self.initial.clone();
        if let Some(state) = self.states.get(&self.current) {
            if let Some(hook) = &state.on_enter {
                hook(ctx);
            }
        }
    }

    /// Fires the first registered transition matching the current state,
    /// the trigger, and its guard. Returns `false` (leaving the state
    /// untouched) when nothing matches.
    pub fn try_transition(&mut self, ctx: &mut C, trigger: &str) -> bool {
        let matched = self.transitions.iter().position(|t| {
            t.from == self.current
                && t.trigger == trigger
                && t.guard.as_ref().map_or(true, |g| g(ctx))
        });

        let Some(idx) = matched else {
            return false;
        };

        if let Some(state) = self.states.get(&self.current) {
            if let Some(hook) = &state.on_exit {
                hook(ctx);
            }
        }

        if let Some(action) = &self.transitions[idx].action {
            action(ctx);
        }

        self.current = self.transitions[idx].to.clone();

        if let Some(state) = self.states.get(&self.current) {
            if let Some(hook) = &state.on_enter {
                hook(ctx);
            }
        }

        true
    }

    /// Runs the current state's `on_update` hook, if any.
    pub fn update(&self, ctx: &mut C) {
        if let Some(state) = self.states.get(&self.current) {
            if let Some(hook) = &state.on_update {
                hook(ctx);
            }
        }
    }
}

impl<C> Default for StateMachine<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> std::fmt::Debug for StateMachine<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("current", &self.current)
            .field("states", &self.states.len())
            .field("transitions", &self.transitions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Trace = Vec<String>;

    fn traced(name: &str, log: &'static str) -> State<Trace> {
        let enter = format!("enter:{log}");
        let exit = format!("exit:{log}");
        State::new(name)
            .on_enter(move |t: &mut Trace| t.push(enter.clone()))
            .on_exit(move |t: &mut Trace| t.push(exit.clone()))
    }

    #[test]
    fn effect_order_is_exit_action_enter() {
        let mut sm = StateMachine::new()
            .add_state(traced("A", "A"))
            .add_state(traced("B", "B"))
            .add_transition(
                Transition::new("A", "B", "go")
                    .with_action(|t: &mut Trace| t.push("action".into())),
            );

        let mut trace = Trace::new();
        sm.start(&mut trace);
        assert!(sm.try_transition(&mut trace, "go"));

        assert_eq!(trace, vec!["enter:A", "exit:A", "action", "enter:B"]);
        assert_eq!(sm.current(), "B");
    }

    #[test]
    fn unknown_trigger_is_a_silent_noop() {
        let mut sm = StateMachine::new().add_state(traced("A", "A"));
        let mut trace = Trace::new();
        sm.start(&mut trace);

        assert!(!sm.try_transition(&mut trace, "nope"));
        assert_eq!(sm.current(), "A");
    }

    #[test]
    fn guard_blocks_and_first_registered_match_wins() {
        let mut sm = StateMachine::new()
            .add_state(State::new("A"))
            .add_state(State::new("B"))
            .add_state(State::new("C"))
            .add_transition(
                Transition::new("A", "B", "go").with_guard(|allowed: &bool| *allowed),
            )
            .add_transition(Transition::new("A", "C", "go"));

        // Guard open: the earlier-registered A->B wins over A->C.
        let mut allowed = true;
        sm.start(&mut allowed);
        assert!(sm.try_transition(&mut allowed, "go"));
        assert_eq!(sm.current(), "B");

        // Guard closed: scan falls through to A->C.
        let mut sm2 = StateMachine::new()
            .add_state(State::new("A"))
            .add_state(State::new("B"))
            .add_state(State::new("C"))
            .add_transition(
                Transition::new("A", "B", "go").with_guard(|allowed: &bool| *allowed),
            )
            .add_transition(Transition::new("A", "C", "go"));
        let mut blocked = false;
        sm2.start(&mut blocked);
        assert!(sm2.try_transition(&mut blocked, "go"));
        assert_eq!(sm2.current(), "C");
    }

    #[test]
    fn self_loop_fires_exit_and_enter() {
        let mut sm = StateMachine::new()
            .add_state(traced("A", "A"))
            .add_transition(Transition::new("A", "A", "reset"));

        let mut trace = Trace::new();
        sm.start(&mut trace);
        trace.clear();

        assert!(sm.try_transition(&mut trace, "reset"));
        assert_eq!(trace, vec!["exit:A", "enter:A"]);
        assert_eq!(sm.current(), "A");
    }

    #[test]
    fn update_runs_only_the_current_state_hook() {
        let mut sm = StateMachine::new()
            .add_state(State::new("A").on_update(|t: &mut Trace| t.push("tick:A".into())))
            .add_state(State::new("B").on_update(|t: &mut Trace| t.push("tick:B".into())))
            .add_transition(Transition::new("A", "B", "go"));

        let mut trace = Trace::new();
        sm.start(&mut trace);
        sm.update(&mut trace);
        sm.try_transition(&mut trace, "go");
        sm.update(&mut trace);

        assert_eq!(trace, vec!["tick:A", "tick:B"]);
    }
}
