//! Commands queued for the reactor thread.

use super::event_loop::Reactor;
use crate::command::{CommandError, Completion};
use crate::packet::MqttResult;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, error, trace};

/// A unit of work executed on the reactor thread.
pub(crate) trait Command: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Run against the reactor. Must not block.
    fn execute(self: Box<Self>, reactor: &mut Reactor);

    /// Resolve the waiting caller without running.
    fn cancel(self: Box<Self>, error: CommandError);
}

/// A closure-backed command resolving a [`Completion`].
///
/// The body returns `Ok(Some(value))` to complete immediately. To complete
/// later, for example when an acknowledgment arrives, it takes the completion
/// out of the slot and returns `Ok(None)`.
pub(crate) struct Operation<T, F> {
    name: &'static str,
    completion: Completion<T>,
    body: F,
}

impl<T, F> Operation<T, F>
where
    T: Send + 'static,
    F: FnOnce(&mut Reactor, &mut Option<Completion<T>>) -> MqttResult<Option<T>> + Send + 'static,
{
    pub(crate) fn new(name: &'static str, completion: Completion<T>, body: F) -> Self {
        Self {
            name,
            completion,
            body,
        }
    }
}

impl<T, F> Command for Operation<T, F>
where
    T: Send + 'static,
    F: FnOnce(&mut Reactor, &mut Option<Completion<T>>) -> MqttResult<Option<T>> + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn execute(self: Box<Self>, reactor: &mut Reactor) {
        let Self {
            name,
            completion,
            body,
        } = *self;

        if completion.is_cancelled() {
            trace!(command = name, "Skipping cancelled command");
            return;
        }

        let mut slot = Some(completion);
        let outcome = catch_unwind(AssertUnwindSafe(|| body(reactor, &mut slot)));
        let Some(completion) = slot else {
            return;
        };

        match outcome {
            Ok(Ok(Some(value))) => {
                completion.complete(value);
            },
            Ok(Ok(None)) => {
                completion.fail(CommandError::Engine(format!("{name} produced no result")));
            },
            Ok(Err(e)) => {
                debug!(command = name, error = %e, "Command failed");
                completion.fail(CommandError::Fault(e));
            },
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(command = name, panic = %message, "Command panicked");
                completion.fail(CommandError::Panicked(message));
            },
        }
    }

    fn cancel(self: Box<Self>, error: CommandError) {
        trace!(command = self.name, "Cancelling command");
        self.completion.fail(error);
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
