use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::EngineError;

type Continuation<T> = Box<dyn FnOnce(&Result<T, EngineError>) + Send>;

enum State<T> {
    Pending(Vec<Continuation<T>>),
    Settled(Arc<Result<T, EngineError>>),
}

/// A single-assignment result: pending until its [`Completer`] settles it exactly once.
///
/// Continuations registered while pending run once, in registration order, on the thread
/// that settles. Continuations registered afterwards run immediately on the caller's thread.
pub struct DeferredResult<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for DeferredResult<T> {
    fn clone(&self) -> Self {
        Self { state: self.state.clone() }
    }
}

/// The write side of a [`DeferredResult`]. Dropping it unsettled fails the result.
pub struct Completer<T> {
    state: Arc<Mutex<State<T>>>,
    settled: bool,
}

pub fn deferred<T>() -> (Completer<T>, DeferredResult<T>) {
    let state = Arc::new(Mutex::new(State::Pending(Vec::new())));
    (
        Completer { state: state.clone(), settled: false },
        DeferredResult { state },
    )
}

impl<T> Completer<T> {
    pub fn complete(self, value: T) {
        self.settle(Ok(value));
    }

    pub fn fail(self, error: EngineError) {
        self.settle(Err(error));
    }

    pub fn settle(mut self, outcome: Result<T, EngineError>) {
        self.settled = true;
        settle(&self.state, outcome);
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if !self.settled {
            settle(
                &self.state,
                Err(EngineError::QueryFailure("producer dropped before completing".into())),
            );
        }
    }
}

fn settle<T>(state: &Mutex<State<T>>, outcome: Result<T, EngineError>) {
    let outcome = Arc::new(outcome);
    let waiting = {
        let mut guard = state.lock();
        match &mut *guard {
            State::Settled(_) => return,
            State::Pending(waiting) => {
                let waiting = std::mem::take(waiting);
                *guard = State::Settled(outcome.clone());
                waiting
            }
        }
    };
    // Outside the lock: a continuation may register further continuations.
    for continuation in waiting {
        continuation(&outcome);
    }
}

impl<T> DeferredResult<T> {
    /// Run `f` once with the outcome.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(&Result<T, EngineError>) + Send + 'static,
    {
        let settled = {
            let mut guard = self.state.lock();
            match &mut *guard {
                State::Pending(waiting) => {
                    waiting.push(Box::new(f));
                    return;
                }
                State::Settled(outcome) => outcome.clone(),
            }
        };
        f(&settled);
    }

    pub fn is_settled(&self) -> bool {
        matches!(*self.state.lock(), State::Settled(_))
    }

    /// A new result derived from this one. Failures pass through unchanged.
    pub fn map<U, F>(&self, f: F) -> DeferredResult<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> U + Send + 'static,
    {
        let (completer, derived) = deferred();
        self.on_complete(move |outcome| match outcome {
            Ok(value) => completer.complete(f(value)),
            Err(e) => completer.fail(e.clone()),
        });
        derived
    }
}

impl<T: Clone> DeferredResult<T> {
    /// The outcome if already settled.
    pub fn peek(&self) -> Option<Result<T, EngineError>> {
        match &*self.state.lock() {
            State::Pending(_) => None,
            State::Settled(outcome) => Some((**outcome).clone()),
        }
    }
}

impl<T> DeferredResult<T> {
    pub fn completed(value: T) -> Self {
        let (completer, result) = deferred();
        completer.complete(value);
        result
    }

    pub fn failed(error: EngineError) -> Self {
        let (completer, result) = deferred();
        completer.fail(error);
        result
    }
}
