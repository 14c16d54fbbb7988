//! The cross-thread handle between a calling thread and the reactor.

use super::error::{CommandError, CommandResult};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

type Callback<T> = Box<dyn FnOnce(CommandResult<T>) + Send>;

enum State<T> {
    Pending(Option<Callback<T>>),
    Done(CommandResult<T>),
    Taken,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    done: Condvar,
}

impl<T> Shared<T> {
    /// Store the outcome unless one is already recorded. Returns whether
    /// this call decided it.
    fn finish(&self, result: CommandResult<T>) -> bool {
        let mut state = self.state.lock();
        let callback = match &mut *state {
            State::Pending(callback) => callback.take(),
            State::Done(_) | State::Taken => return false,
        };

        if let Some(callback) = callback {
            *state = State::Taken;
            drop(state);
            callback(result);
        } else {
            *state = State::Done(result);
            drop(state);
            self.done.notify_all();
        }
        true
    }
}

/// Caller side of an operation executed by the reactor.
///
/// Any thread may wait on it or cancel it. Non-blocking callers drop it or
/// attach a callback with [`PendingOperation::on_complete`]; blocking callers
/// use [`PendingOperation::await_result`].
pub struct PendingOperation<T> {
    shared: Arc<Shared<T>>,
}

/// Reactor side of an operation. Consumed by the single call that decides
/// the outcome; dropping it undecided fails the operation.
pub struct Completion<T> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T> PendingOperation<T> {
    /// Create a linked operation and completion.
    #[must_use]
    pub fn new() -> (Self, Completion<T>) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::Pending(None)),
            done: Condvar::new(),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            Completion {
                shared: Some(shared),
            },
        )
    }

    /// An operation that already failed.
    #[must_use]
    pub fn failed(error: CommandError) -> Self {
        let (op, completion) = Self::new();
        completion.fail(error);
        op
    }

    /// Block until the reactor completes the operation or `timeout` elapses.
    ///
    /// A timeout leaves the operation running on the reactor; its eventual
    /// result is discarded unless this is called again.
    ///
    /// # Errors
    ///
    /// Returns the recorded failure, [`CommandError::Timeout`], or
    /// [`CommandError::Engine`] if the result was already taken.
    pub fn await_result(&self, timeout: Duration) -> CommandResult<T> {
        let mut state = self.shared.state.lock();
        self.shared
            .done
            .wait_while_for(&mut state, |s| matches!(s, State::Pending(_)), timeout);

        match std::mem::replace(&mut *state, State::Taken) {
            State::Done(result) => result,
            pending @ State::Pending(_) => {
                *state = pending;
                Err(CommandError::Timeout(timeout))
            },
            State::Taken => Err(CommandError::Engine("result already taken".to_string())),
        }
    }

    /// Take the result if the operation has completed.
    pub fn try_result(&self) -> Option<CommandResult<T>> {
        let mut state = self.shared.state.lock();
        match std::mem::replace(&mut *state, State::Taken) {
            State::Done(result) => Some(result),
            other => {
                *state = other;
                None
            },
        }
    }

    /// Whether an outcome has been recorded.
    #[must_use]
    pub fn is_done(&self) -> bool {
        !matches!(*self.shared.state.lock(), State::Pending(_))
    }

    /// Force completion with [`CommandError::Cancelled`]. Returns `false` if
    /// the operation had already completed.
    pub fn cancel(&self) -> bool {
        self.shared.finish(Err(CommandError::Cancelled))
    }

    /// Run `callback` with the outcome instead of waiting for it.
    ///
    /// Runs on the reactor thread when the reactor completes the operation,
    /// or immediately on this thread if it already has.
    pub fn on_complete<F>(self, callback: F)
    where
        F: FnOnce(CommandResult<T>) + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        match std::mem::replace(&mut *state, State::Taken) {
            State::Pending(_) => *state = State::Pending(Some(Box::new(callback))),
            State::Done(result) => {
                drop(state);
                callback(result);
            },
            State::Taken => {},
        }
    }
}

impl<T> std::fmt::Debug for PendingOperation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingOperation")
            .field("done", &self.is_done())
            .finish()
    }
}

impl<T> Completion<T> {
    /// Complete with a value.
    pub fn complete(mut self, value: T) -> bool {
        self.shared
            .take()
            .is_some_and(|shared| shared.finish(Ok(value)))
    }

    /// Complete with a failure.
    pub fn fail(mut self, error: CommandError) -> bool {
        self.shared
            .take()
            .is_some_and(|shared| shared.finish(Err(error)))
    }

    /// Whether the caller already cancelled (or otherwise decided) the
    /// operation, so executing it would be wasted work.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared
            .as_ref()
            .map_or(true, |shared| !matches!(*shared.state.lock(), State::Pending(_)))
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            let error = if std::thread::panicking() {
                CommandError::Panicked("operation dropped while unwinding".to_string())
            } else {
                CommandError::Cancelled
            };
            shared.finish(Err(error));
        }
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
