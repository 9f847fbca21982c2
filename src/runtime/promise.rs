// File: src/runtime/promise.rs
//
// Promise state machine. A promise transitions exactly once from pending to
// resolved or rejected. Continuations are drained through the event loop,
// never run synchronously; which queue a reaction sits in decides how the
// driver interprets it.

use crate::runtime::value::Value;
use crate::vm::FrameSnapshot;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone)]
pub enum PromiseState {
    Pending,
    Resolved(Value),
    Rejected(Value),
}

/// A then/catch registration. Drained from the resolve queue: the callback
/// (identity when None) runs with the value and its result settles `target`.
/// Drained from the reject queue: a present callback handles the rejection
/// and resolves `target`; an absent one propagates the rejection to `target`.
pub struct Reaction {
    pub callback: Option<Value>,
    pub target: Option<Rc<RefCell<Promise>>>,
}

/// A frame suspended on this promise; resumes with the settled value placed
/// in `dest`, or re-enters as a throw on rejection.
pub struct Awaiter {
    pub snapshot: Box<FrameSnapshot>,
    pub dest: u8,
}

pub struct Promise {
    state: PromiseState,
    pub on_resolve: Vec<Reaction>,
    pub on_reject: Vec<Reaction>,
    pub awaiters: Vec<Awaiter>,
}

impl Promise {
    pub fn new() -> Rc<RefCell<Promise>> {
        Rc::new(RefCell::new(Promise {
            state: PromiseState::Pending,
            on_resolve: Vec::new(),
            on_reject: Vec::new(),
            awaiters: Vec::new(),
        }))
    }

    pub fn resolved(value: Value) -> Rc<RefCell<Promise>> {
        let promise = Promise::new();
        promise.borrow_mut().state = PromiseState::Resolved(value);
        promise
    }

    pub fn rejected(reason: Value) -> Rc<RefCell<Promise>> {
        let promise = Promise::new();
        promise.borrow_mut().state = PromiseState::Rejected(reason);
        promise
    }

    pub fn state(&self) -> PromiseState {
        self.state.clone()
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, PromiseState::Pending)
    }

    pub fn state_name(&self) -> &'static str {
        match self.state {
            PromiseState::Pending => "pending",
            PromiseState::Resolved(_) => "resolved",
            PromiseState::Rejected(_) => "rejected",
        }
    }

    /// Transition to resolved, returning the reactions and awaiters to
    /// schedule. Empty when already settled.
    pub fn settle_resolved(&mut self, value: Value) -> (Vec<Reaction>, Vec<Awaiter>) {
        if !self.is_pending() {
            return (Vec::new(), Vec::new());
        }
        self.state = PromiseState::Resolved(value);
        self.on_reject.clear();
        (std::mem::take(&mut self.on_resolve), std::mem::take(&mut self.awaiters))
    }

    /// Transition to rejected, returning the reactions and awaiters to
    /// schedule.
    pub fn settle_rejected(&mut self, reason: Value) -> (Vec<Reaction>, Vec<Awaiter>) {
        if !self.is_pending() {
            return (Vec::new(), Vec::new());
        }
        self.state = PromiseState::Rejected(reason);
        self.on_resolve.clear();
        (std::mem::take(&mut self.on_reject), std::mem::take(&mut self.awaiters))
    }
}

impl std::fmt::Debug for Promise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Promise({})", self.state_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settles_exactly_once() {
        let promise = Promise::new();
        promise.borrow_mut().settle_resolved(Value::Number(1.0));
        assert_eq!(promise.borrow().state_name(), "resolved");

        let (reactions, awaiters) = promise.borrow_mut().settle_rejected(Value::str("late"));
        assert!(reactions.is_empty() && awaiters.is_empty());
        assert_eq!(promise.borrow().state_name(), "resolved");
    }

    #[test]
    fn resolution_drains_only_resolve_reactions() {
        let promise = Promise::new();
        promise.borrow_mut().on_resolve.push(Reaction { callback: None, target: None });
        promise.borrow_mut().on_reject.push(Reaction { callback: None, target: None });
        let (reactions, _) = promise.borrow_mut().settle_resolved(Value::Number(1.0));
        assert_eq!(reactions.len(), 1);
        assert!(promise.borrow().on_reject.is_empty());
    }
}
