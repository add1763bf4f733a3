//! Native execution context: a dedicated OS thread.
//!
//! Each spawned context owns a [`WorkerState`] on its own thread and
//! reads envelopes from an `mpsc` queue. Dropping the sender ends the
//! thread after the message it is working on.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, error};
use verdant_worker::{Envelope, WorkerState};

use crate::channel::{ChannelError, ContextFactory, ExecutionContext, Inbox};

/// Default thread name prefix.
pub const DEFAULT_THREAD_NAME: &str = "verdant-inference";

/// Spawns [`ThreadContext`]s.
#[derive(Debug, Clone)]
pub struct ThreadContextFactory {
    name: String,
}

impl Default for ThreadContextFactory {
    fn default() -> Self {
        Self::new(DEFAULT_THREAD_NAME)
    }
}

impl ThreadContextFactory {
    /// Threads are named `{name}-{epoch}`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl ContextFactory for ThreadContextFactory {
    type Context = ThreadContext;

    fn spawn(&self, inbox: Inbox) -> Result<ThreadContext, ChannelError> {
        let (sender, receiver) = mpsc::channel();
        let name = format!("{}-{}", self.name, inbox.epoch());
        std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let mut state = WorkerState::new();
                serve(&receiver, &inbox, |envelope| state.handle(envelope));
            })
            .map_err(|e| ChannelError::Spawn(format!("failed to start {name}: {e}")))?;
        debug!(thread = %name, "inference thread started");
        Ok(ThreadContext {
            sender: Mutex::new(Some(sender)),
        })
    }
}

/// Answer envelopes until the queue closes. A panic in `handler` fails
/// the context and stops the loop.
fn serve(
    receiver: &Receiver<Envelope>,
    inbox: &Inbox,
    mut handler: impl FnMut(Envelope) -> Envelope,
) {
    for envelope in receiver {
        match panic::catch_unwind(AssertUnwindSafe(|| handler(envelope))) {
            Ok(reply) => {
                inbox.deliver(&reply);
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!(epoch = inbox.epoch(), %reason, "inference thread panicked");
                inbox.fail(format!("inference thread panicked: {reason}"));
                return;
            }
        }
    }
    debug!(epoch = inbox.epoch(), "inference thread stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned())
}

/// Handle to an inference thread.
#[derive(Debug)]
pub struct ThreadContext {
    sender: Mutex<Option<Sender<Envelope>>>,
}

impl ExecutionContext for ThreadContext {
    fn post(&self, envelope: Envelope) -> Result<(), ChannelError> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else {
            return Err(ChannelError::Post("context was terminated".into()));
        };
        sender
            .send(envelope)
            .map_err(|_| ChannelError::Post("inference thread has exited".into()))
    }

    fn terminate(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
