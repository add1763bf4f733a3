//! The background execution channel.
//!
//! [`Channel`] owns one background execution context at a time and
//! correlates requests with responses across the message boundary:
//!
//! - every request gets an id from a per-channel counter that only grows,
//!   even across context restarts;
//! - the request is registered in a [`PendingTable`] *before* it is
//!   posted, so a context that answers synchronously cannot race it;
//! - the caller waits for its response or the timeout, whichever comes
//!   first. A timeout removes only that request's entry;
//! - responses arrive through an [`Inbox`] bound to the context's epoch.
//!   Anything from a retired context, or for an id nobody is waiting on,
//!   is dropped.
//!
//! Contexts are spawned by a [`ContextFactory`]: a native thread in
//! [`thread`](crate::thread), a web worker in `web` on `wasm32`, or a
//! scripted double in tests.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{self, Either};
use futures::pin_mut;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use verdant_pipeline::{ClassificationResult, InferenceError, RgbaImage};
use verdant_worker::{Envelope, ModelSource, Request, Response};

use crate::config::duration_serde;
use crate::pending::PendingTable;
use crate::timer::Timer;

/// How long a context may take to load the model.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a single classification may take.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive failed initializations before the channel gives up.
pub const DEFAULT_MAX_INIT_ATTEMPTS: u32 = 3;

/// Channel timing and retry limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Deadline for a context to answer `Init` (seconds in JSON).
    #[serde(with = "duration_serde")]
    pub init_timeout: Duration,
    /// Deadline for a context to answer `Classify` (seconds in JSON).
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
    /// Consecutive failed initializations before the channel is
    /// permanently unavailable.
    pub max_init_attempts: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            init_timeout: DEFAULT_INIT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_init_attempts: DEFAULT_MAX_INIT_ATTEMPTS,
        }
    }
}

/// Errors from the channel.
///
/// `Clone` because a context failure rejects every pending request with
/// the same error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// No response within the deadline. The context may still be healthy.
    #[error("request {id} timed out after {after:?}")]
    TimedOut {
        /// Correlation id of the request.
        id: u64,
        /// The deadline that expired.
        after: Duration,
    },

    /// Initialization failed too many times in a row.
    #[error("background execution unavailable after {attempts} failed attempts")]
    Unavailable {
        /// Number of consecutive failures.
        attempts: u32,
    },

    /// The context crashed or reported a fatal error.
    #[error("execution context failed: {0}")]
    ContextFailed(String),

    /// The context was retired by a restart or shutdown.
    #[error("execution context was replaced")]
    Superseded,

    /// `classify` was called without a ready context.
    #[error("execution context is not initialized")]
    NotReady,

    /// The context could not be created.
    #[error("failed to start execution context: {0}")]
    Spawn(String),

    /// A message could not be handed to the context.
    #[error("failed to post message: {0}")]
    Post(String),

    /// A message was malformed or unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The context answered, but classification failed.
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

/// A background execution context.
pub trait ExecutionContext {
    /// Hand a message to the context. Responses arrive on the [`Inbox`]
    /// the context was spawned with, possibly before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Post`] if the context cannot accept
    /// messages.
    fn post(&self, envelope: Envelope) -> Result<(), ChannelError>;

    /// Stop the context. Later posts fail; later deliveries are ignored.
    fn terminate(&self);
}

/// Creates execution contexts.
pub trait ContextFactory {
    /// The context type produced.
    type Context: ExecutionContext;

    /// Start a context that delivers its messages to `inbox`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Spawn`] if the context cannot be created.
    fn spawn(&self, inbox: Inbox) -> Result<Self::Context, ChannelError>;
}

/// Observable state of a [`Channel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelStatus {
    /// No context yet; `init` will start one.
    Idle,
    /// A healthy context is accepting requests.
    Ready,
    /// The context failed; the next `init` replaces it.
    NeedsReinit,
    /// Initialization failed too often; the channel stays down.
    Unavailable,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Ready => "ready",
            Self::NeedsReinit => "needs reinit",
            Self::Unavailable => "unavailable",
        })
    }
}

#[derive(Debug, Default)]
struct SharedState {
    pending: PendingTable<Response>,
    /// Epoch of the newest context. Bumped when a context starts or is
    /// retired, so stragglers from older contexts are recognisable.
    epoch: u64,
    /// The current epoch's context reported a failure.
    faulted: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<SharedState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Delivery handle given to an execution context.
///
/// Bound to the epoch of the context it was created for; once that
/// context is retired, everything delivered through it is ignored.
#[derive(Debug, Clone)]
pub struct Inbox {
    shared: Arc<Shared>,
    epoch: u64,
}

impl Inbox {
    /// Epoch of the context this inbox belongs to.
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Route a response to its waiting request.
    ///
    /// Returns `true` if a pending request was resolved. A `Fatal`
    /// response or an undecodable header fails the whole context.
    pub fn deliver(&self, envelope: &Envelope) -> bool {
        let response = match envelope.decode_response() {
            Ok(response) => response,
            Err(e) => {
                self.fail(format!("undecodable response: {e}"));
                return false;
            }
        };
        let Some(id) = response.id() else {
            if let Response::Fatal { reason } = response {
                self.fail(reason);
            }
            return false;
        };

        let mut state = self.shared.lock();
        if state.epoch != self.epoch {
            debug!(id, epoch = self.epoch, "dropping response from retired context");
            return false;
        }
        if state.pending.epoch_of(id) != Some(self.epoch) {
            debug!(id, epoch = self.epoch, "dropping response with no pending request");
            return false;
        }
        state.pending.settle(id, Ok(response))
    }

    /// Report that the context has failed: every request pending on it
    /// is rejected with [`ChannelError::ContextFailed`] and the channel
    /// will replace the context on the next `init`.
    ///
    /// Returns the number of rejected requests.
    pub fn fail(&self, reason: impl Into<String>) -> usize {
        let reason = reason.into();
        let mut state = self.shared.lock();
        if state.epoch == self.epoch {
            state.faulted = true;
        }
        let rejected = state
            .pending
            .reject_epoch(self.epoch, &ChannelError::ContextFailed(reason.clone()));
        warn!(epoch = self.epoch, rejected, %reason, "execution context failed");
        rejected
    }
}

enum ContextState<C> {
    Idle,
    Ready { context: Arc<C>, epoch: u64 },
    Unavailable,
}

struct Lifecycle<C> {
    state: ContextState<C>,
    failed_attempts: u32,
}

/// Removes a pending entry when the waiting request finishes or is
/// dropped mid-flight.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.lock().pending.remove(self.id);
    }
}

/// Milliseconds since the Unix epoch, for request timestamps.
fn unix_millis() -> u64 {
    web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Request/response channel to a background execution context.
///
/// Create one per application and share it by reference. All state is
/// owned here: no globals, so tests can run many channels side by side.
pub struct Channel<F: ContextFactory, T: Timer> {
    factory: F,
    timer: T,
    config: ChannelConfig,
    model: ModelSource,
    next_id: AtomicU64,
    shared: Arc<Shared>,
    lifecycle: futures::lock::Mutex<Lifecycle<F::Context>>,
}

impl<F: ContextFactory, T: Timer> fmt::Debug for Channel<F, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("config", &self.config)
            .field("model", &self.model)
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

impl<F: ContextFactory, T: Timer> Channel<F, T> {
    /// A channel that will load `model` into contexts made by `factory`.
    /// Nothing starts until [`init`](Self::init).
    #[must_use]
    pub fn new(factory: F, timer: T, model: ModelSource, config: ChannelConfig) -> Self {
        Self {
            factory,
            timer,
            config,
            model,
            next_id: AtomicU64::new(1),
            shared: Arc::default(),
            lifecycle: futures::lock::Mutex::new(Lifecycle {
                state: ContextState::Idle,
                failed_attempts: 0,
            }),
        }
    }

    /// Timing and retry limits.
    #[must_use]
    pub const fn config(&self) -> &ChannelConfig {
        &self.config
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn is_healthy(&self, epoch: u64) -> bool {
        let state = self.shared.lock();
        state.epoch == epoch && !state.faulted
    }

    /// Make sure a healthy context with the model loaded is running.
    ///
    /// Idempotent: returns immediately when a healthy context exists.
    /// Concurrent callers wait for the attempt in flight. A failed context
    /// is retired and replaced. Each call makes at most one attempt; after
    /// [`ChannelConfig::max_init_attempts`] consecutive failures the
    /// channel is permanently [`ChannelStatus::Unavailable`].
    ///
    /// # Errors
    ///
    /// Returns the attempt's error, or [`ChannelError::Unavailable`] once
    /// the channel has given up.
    pub async fn init(&self) -> Result<(), ChannelError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let faulted = match &lifecycle.state {
            ContextState::Unavailable => {
                return Err(ChannelError::Unavailable {
                    attempts: lifecycle.failed_attempts,
                });
            }
            ContextState::Ready { epoch, .. } if self.is_healthy(*epoch) => return Ok(()),
            ContextState::Ready { .. } => true,
            ContextState::Idle => false,
        };
        if faulted {
            self.retire(&mut lifecycle, &ChannelError::ContextFailed("context faulted".into()));
        }

        match self.start().await {
            Ok((context, epoch)) => {
                info!(epoch, "execution context ready");
                lifecycle.failed_attempts = 0;
                lifecycle.state = ContextState::Ready { context, epoch };
                Ok(())
            }
            Err(error) => {
                lifecycle.failed_attempts += 1;
                let attempts = lifecycle.failed_attempts;
                if attempts >= self.config.max_init_attempts {
                    warn!(attempts, %error, "giving up on background execution");
                    lifecycle.state = ContextState::Unavailable;
                } else {
                    warn!(
                        attempt = attempts,
                        max = self.config.max_init_attempts,
                        %error,
                        "execution context failed to start"
                    );
                }
                Err(error)
            }
        }
    }

    /// Spawn a context and load the model into it.
    async fn start(&self) -> Result<(Arc<F::Context>, u64), ChannelError> {
        let epoch = {
            let mut state = self.shared.lock();
            state.epoch += 1;
            state.faulted = false;
            state.epoch
        };
        let inbox = Inbox {
            shared: Arc::clone(&self.shared),
            epoch,
        };
        let context = Arc::new(self.factory.spawn(inbox)?);

        let id = self.next_id();
        let request = Request::Init {
            id,
            model: self.model.clone(),
        };
        let envelope = Envelope::request(&request, Vec::new())
            .map_err(|e| ChannelError::Protocol(e.to_string()))?;

        let outcome = match self
            .exchange(&*context, epoch, id, envelope, self.config.init_timeout)
            .await
        {
            Ok(Response::Ready { labels, .. }) => {
                debug!(epoch, labels = labels.len(), "model loaded in context");
                return Ok((context, epoch));
            }
            Ok(Response::Failed { error, .. }) => ChannelError::Inference(error),
            Ok(other) => ChannelError::Protocol(format!("unexpected reply to init: {other:?}")),
            Err(e) => e,
        };
        context.terminate();
        self.shared.lock().pending.reject_epoch(epoch, &ChannelError::Superseded);
        Err(outcome)
    }

    /// Terminate the current context and reject everything pending on it.
    fn retire(&self, lifecycle: &mut Lifecycle<F::Context>, reason: &ChannelError) {
        if !matches!(lifecycle.state, ContextState::Ready { .. }) {
            return;
        }
        if let ContextState::Ready { context, epoch } =
            std::mem::replace(&mut lifecycle.state, ContextState::Idle)
        {
            context.terminate();
            let mut state = self.shared.lock();
            let rejected = state.pending.reject_epoch(epoch, reason);
            if state.epoch == epoch {
                state.epoch += 1;
                state.faulted = false;
            }
            info!(epoch, rejected, "execution context retired");
        }
    }

    /// Register, post and await one request.
    async fn exchange(
        &self,
        context: &F::Context,
        epoch: u64,
        id: u64,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Response, ChannelError> {
        let receiver = {
            let mut state = self.shared.lock();
            if state.epoch != epoch {
                return Err(ChannelError::Superseded);
            }
            if state.faulted {
                return Err(ChannelError::ContextFailed(
                    "context failed before the request was posted".into(),
                ));
            }
            state.pending.insert(id, epoch)
        };
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };
        context.post(envelope)?;

        let sleep = self.timer.sleep(timeout);
        pin_mut!(sleep);
        match future::select(receiver, sleep).await {
            Either::Left((Ok(outcome), _)) => outcome,
            Either::Left((Err(oneshot::Canceled), _)) => Err(ChannelError::Superseded),
            Either::Right(((), _)) => {
                warn!(id, epoch, ?timeout, "request timed out");
                Err(ChannelError::TimedOut { id, after: timeout })
            }
        }
    }

    async fn ready_context(&self) -> Result<(Arc<F::Context>, u64), ChannelError> {
        let lifecycle = self.lifecycle.lock().await;
        match &lifecycle.state {
            ContextState::Ready { context, epoch } if self.is_healthy(*epoch) => {
                Ok((Arc::clone(context), *epoch))
            }
            ContextState::Ready { .. } | ContextState::Idle => Err(ChannelError::NotReady),
            ContextState::Unavailable => Err(ChannelError::Unavailable {
                attempts: lifecycle.failed_attempts,
            }),
        }
    }

    /// Classify `image` in the background context.
    ///
    /// The pixels are copied into the outgoing message, so the caller
    /// keeps sole ownership of its buffer. Dropping the returned future
    /// abandons the request and removes its pending entry.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::NotReady`] / [`ChannelError::Unavailable`] without
    ///   a healthy context;
    /// - [`ChannelError::TimedOut`] after [`ChannelConfig::request_timeout`];
    /// - [`ChannelError::ContextFailed`] / [`ChannelError::Superseded`] if
    ///   the context dies or is replaced while waiting;
    /// - [`ChannelError::Inference`] if the model rejected the input.
    pub async fn classify(&self, image: &RgbaImage) -> Result<ClassificationResult, ChannelError> {
        let (context, epoch) = self.ready_context().await?;
        let id = self.next_id();
        let request = Request::Classify {
            id,
            width: image.width(),
            height: image.height(),
            issued_at_ms: unix_millis(),
        };
        let envelope = Envelope::request(&request, image.as_raw().clone())
            .map_err(|e| ChannelError::Protocol(e.to_string()))?;

        match self
            .exchange(&*context, epoch, id, envelope, self.config.request_timeout)
            .await?
        {
            Response::Classified { result, .. } => Ok(result),
            Response::Failed { error, .. } => Err(ChannelError::Inference(error)),
            other => Err(ChannelError::Protocol(format!(
                "unexpected reply to classify: {other:?}"
            ))),
        }
    }

    /// Replace the context: the current one is terminated and its pending
    /// requests rejected with [`ChannelError::Superseded`] before a new
    /// one is started.
    ///
    /// # Errors
    ///
    /// Same as [`init`](Self::init).
    pub async fn restart(&self) -> Result<(), ChannelError> {
        {
            let mut lifecycle = self.lifecycle.lock().await;
            self.retire(&mut lifecycle, &ChannelError::Superseded);
        }
        self.init().await
    }

    /// Terminate the context without starting another. A later
    /// [`init`](Self::init) starts a fresh one.
    pub async fn shutdown(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        self.retire(&mut lifecycle, &ChannelError::Superseded);
    }

    /// Current state.
    pub async fn status(&self) -> ChannelStatus {
        let lifecycle = self.lifecycle.lock().await;
        match &lifecycle.state {
            ContextState::Idle => ChannelStatus::Idle,
            ContextState::Ready { epoch, .. } if self.is_healthy(*epoch) => ChannelStatus::Ready,
            ContextState::Ready { .. } => ChannelStatus::NeedsReinit,
            ContextState::Unavailable => ChannelStatus::Unavailable,
        }
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.lock().pending.len()
    }
}

impl<F: ContextFactory, T: Timer> Drop for Channel<F, T> {
    fn drop(&mut self) {
        if let ContextState::Ready { context, .. } = &self.lifecycle.get_mut().state {
            context.terminate();
        }
    }
}
