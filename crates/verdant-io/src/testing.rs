//! Scripted execution contexts for unit tests.
//!
//! A [`Script`] decides synchronously, inside `post`, how a context
//! reacts to each request. Tests keep an `Arc<Script>` to inspect what was
//! posted and to inject late deliveries or failures through the stored
//! inboxes.

#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use verdant_pipeline::RgbaImage;
use verdant_worker::{Envelope, ModelSource, Request, Response};

use crate::channel::{Channel, ChannelConfig, ChannelError, ContextFactory, ExecutionContext, Inbox};
use crate::timer::TokioTimer;

/// How a scripted context reacts to one request.
pub enum Reply {
    /// Deliver this response before `post` returns.
    Respond(Response),
    /// Never answer.
    Silent,
    /// Refuse the message.
    Refuse,
}

type Policy = Box<dyn Fn(&Request) -> Reply + Send + Sync>;

/// Shared record of everything the scripted contexts saw.
pub struct Script {
    policy: Policy,
    inboxes: Mutex<Vec<Inbox>>,
    posted: Mutex<Vec<Request>>,
    terminated: AtomicUsize,
    spawn_failures: AtomicUsize,
}

impl Script {
    fn new(policy: impl Fn(&Request) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            policy: Box::new(policy),
            inboxes: Mutex::default(),
            posted: Mutex::default(),
            terminated: AtomicUsize::new(0),
            spawn_failures: AtomicUsize::new(0),
        })
    }

    /// Inbox of the `n`th successfully spawned context.
    pub fn inbox(&self, n: usize) -> Inbox {
        self.inboxes.lock().unwrap()[n].clone()
    }

    /// Number of successfully spawned contexts.
    pub fn spawned(&self) -> usize {
        self.inboxes.lock().unwrap().len()
    }

    /// Number of `terminate` calls.
    pub fn terminated(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Make the next `n` spawns fail.
    pub fn fail_next_spawns(&self, n: usize) {
        self.spawn_failures.store(n, Ordering::SeqCst);
    }

    /// Ids of every posted request, in posting order.
    pub fn posted_ids(&self) -> Vec<u64> {
        self.posted.lock().unwrap().iter().map(Request::id).collect()
    }

    /// Ids of posted `Classify` requests, in posting order.
    pub fn classify_ids(&self) -> Vec<u64> {
        self.posted
            .lock()
            .unwrap()
            .iter()
            .filter(|r| matches!(r, Request::Classify { .. }))
            .map(Request::id)
            .collect()
    }
}

/// Factory producing [`ScriptedContext`]s.
pub struct ScriptedFactory(Arc<Script>);

impl ScriptedFactory {
    /// A factory whose contexts refuse every message.
    pub fn refusing() -> Self {
        Self(Script::new(|_| Reply::Refuse))
    }
}

impl ContextFactory for ScriptedFactory {
    type Context = ScriptedContext;

    fn spawn(&self, inbox: Inbox) -> Result<ScriptedContext, ChannelError> {
        let remaining = self.0.spawn_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.0.spawn_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ChannelError::Spawn("scripted spawn failure".into()));
        }
        self.0.inboxes.lock().unwrap().push(inbox.clone());
        Ok(ScriptedContext {
            script: Arc::clone(&self.0),
            inbox,
        })
    }
}

/// A context that answers according to its [`Script`].
pub struct ScriptedContext {
    script: Arc<Script>,
    inbox: Inbox,
}

impl ExecutionContext for ScriptedContext {
    fn post(&self, envelope: Envelope) -> Result<(), ChannelError> {
        let request = envelope
            .decode_request()
            .map_err(|e| ChannelError::Protocol(e.to_string()))?;
        self.script.posted.lock().unwrap().push(request.clone());
        match (self.script.policy)(&request) {
            Reply::Respond(response) => {
                self.inbox.deliver(&Envelope::response(&response).unwrap());
            }
            Reply::Silent => {}
            Reply::Refuse => return Err(ChannelError::Post("scripted refusal".into())),
        }
        Ok(())
    }

    fn terminate(&self) {
        self.script.terminated.fetch_add(1, Ordering::SeqCst);
    }
}

/// A channel over scripted contexts with default timeouts.
pub fn scripted_channel(
    policy: impl Fn(&Request) -> Reply + Send + Sync + 'static,
) -> (Channel<ScriptedFactory, TokioTimer>, Arc<Script>) {
    let script = Script::new(policy);
    let channel = Channel::new(
        ScriptedFactory(Arc::clone(&script)),
        TokioTimer,
        ModelSource::Inline(String::new()),
        ChannelConfig::default(),
    );
    (channel, script)
}

/// Two-label model: green is healthy, brown is early blight.
pub const LEAF_MODEL_JSON: &str = r#"{
    "labels": ["healthy", "early_blight"],
    "grid": 1,
    "weights": [[-6.0, 12.0, -6.0], [8.0, -4.0, -6.0]],
    "bias": [0.0, 0.0]
}"#;

/// A small uniformly green leaf.
pub fn leaf() -> RgbaImage {
    verdant_pipeline::rgba_from_raw(8, 8, [40, 180, 40, 255].repeat(64)).unwrap()
}
