//! Table-driven finite state machine with async transition callbacks.
//!
//! A transition is keyed by `(from, event)`. Emitting an event moves the
//! machine to `to` first and then runs the transition's callbacks in order.
//! Emits are serialized: a second `emit` waits until the first one's
//! callbacks have finished. Callbacks must not call `emit` on the same
//! machine; post follow-up events through a queue instead.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tokio::sync::Mutex;

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Side effect run after a transition's state change.
pub type Callback = Arc<dyn Fn() -> BoxFuture + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FsmError<S: Debug, E: Debug> {
    #[error("no transition from state {from:?} on event {event:?}")]
    NoSuchTransition { from: S, event: E },
}

pub struct Transition<S, E> {
    pub event: E,
    pub from: S,
    pub to: S,
    pub callbacks: Vec<Callback>,
}

impl<S, E> Transition<S, E> {
    pub fn new(event: E, from: S, to: S) -> Self {
        Self {
            event,
            from,
            to,
            callbacks: Vec::new(),
        }
    }

    pub fn then(mut self, callback: Callback) -> Self {
        self.callbacks.push(callback);
        self
    }
}

pub struct Fsm<S, E> {
    state: RwLock<S>,
    transitions: HashMap<(S, E), (S, Vec<Callback>)>,
    gate: Mutex<()>,
}

impl<S, E> Fsm<S, E>
where
    S: Copy + Eq + Hash + Debug + Send + Sync,
    E: Copy + Eq + Hash + Debug + Send + Sync,
{
    /// Later entries for the same `(from, event)` pair replace earlier ones.
    pub fn new(initial: S, transitions: Vec<Transition<S, E>>) -> Self {
        let transitions = transitions
            .into_iter()
            .map(|t| ((t.from, t.event), (t.to, t.callbacks)))
            .collect();
        Self {
            state: RwLock::new(initial),
            transitions,
            gate: Mutex::new(()),
        }
    }

    /// Current state; never blocks on a running transition.
    pub fn state(&self) -> S {
        match self.state.read() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Applies `event`, returning the new state.
    ///
    /// With no transition for the current state the machine stays put and
    /// no callback runs.
    pub async fn emit(&self, event: E) -> Result<S, FsmError<S, E>> {
        let _gate = self.gate.lock().await;
        let from = self.state();
        let Some((to, callbacks)) = self.transitions.get(&(from, event)) else {
            return Err(FsmError::NoSuchTransition { from, event });
        };

        self.set_state(*to);
        tracing::debug!(?from, to = ?*to, ?event, "state transition");
        for callback in callbacks {
            callback().await;
        }
        Ok(*to)
    }

    fn set_state(&self, next: S) {
        match self.state.write() {
            Ok(mut state) => *state = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}
