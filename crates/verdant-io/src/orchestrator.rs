//! Tiered inference with fallback.
//!
//! [`Orchestrator::classify`] tries each [`Tier`] in order and returns
//! the first result:
//!
//! 1. **Worker**: the model in the background execution context.
//! 2. **Main thread**: the same model loaded in-process on first use.
//! 3. **Classical**: colour and edge features with a fixed rule table.
//! 4. **Stub**: a random label from the [`NullClassifier`].
//!
//! A tier's failure, whatever its cause, is logged and triggers the next
//! tier. Tiers never overlap: each one runs to completion (or timeout)
//! before the next starts.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{Instrument, debug, error, info, info_span, warn};
use verdant_pipeline::{
    ClassicalClassifier, ClassificationResult, Classifier, InferenceError, LinearModel,
    NullClassifier, RgbaImage,
};
use verdant_worker::{ModelSource, load_model};
use web_time::Instant;

use crate::channel::{Channel, ChannelError, ContextFactory};
use crate::config::duration_serde;
use crate::timer::Timer;

/// One strategy in the fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    /// Model in the background execution context.
    Worker,
    /// Model on the calling thread.
    MainThread,
    /// Colour/texture rules.
    Classical,
    /// Randomized placeholder.
    Stub,
}

impl Tier {
    /// Every tier, in fallback order.
    pub const ALL: [Self; 4] = [Self::Worker, Self::MainThread, Self::Classical, Self::Stub];

    /// Position in the fallback chain, starting at 1.
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Self::Worker => 1,
            Self::MainThread => 2,
            Self::Classical => 3,
            Self::Stub => 4,
        }
    }

    /// Short lowercase name.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::MainThread => "main-thread",
            Self::Classical => "classical",
            Self::Stub => "stub",
        }
    }

    /// Whether results from this tier are placeholders.
    #[must_use]
    pub const fn is_stub(self) -> bool {
        matches!(self, Self::Stub)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier {} ({})", self.number(), self.label())
    }
}

/// Why a single tier produced no result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TierError {
    /// The background channel failed, timed out or is unavailable.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The in-process classifier failed.
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

/// The model for the main-thread tier, loaded on first use.
#[derive(Debug)]
pub struct MainThreadModel {
    source: Option<ModelSource>,
    loaded: Mutex<Option<Arc<LinearModel>>>,
}

impl MainThreadModel {
    /// A model that is read from `source` when first needed. Without a
    /// source the tier always fails.
    #[must_use]
    pub const fn new(source: Option<ModelSource>) -> Self {
        Self {
            source,
            loaded: Mutex::new(None),
        }
    }

    /// Whether the model has been loaded.
    pub fn is_loaded(&self) -> bool {
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// The cached model, loading it if needed. Failed loads are not
    /// cached, so a later call retries.
    ///
    /// # Errors
    ///
    /// Returns [`InferenceError::ModelUnavailable`] without a source, or
    /// the load error.
    pub fn get(&self) -> Result<Arc<LinearModel>, InferenceError> {
        let mut loaded = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(model) = loaded.as_ref() {
            return Ok(Arc::clone(model));
        }
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| InferenceError::ModelUnavailable("no model configured".into()))?;
        let model = Arc::new(load_model(source)?);
        debug!(labels = model.labels().len(), "main-thread model loaded");
        *loaded = Some(Arc::clone(&model));
        Ok(model)
    }
}

/// One runnable tier, borrowed from the [`Orchestrator`].
pub enum Strategy<'a, F: ContextFactory, T: Timer> {
    /// See [`Tier::Worker`].
    Worker(&'a Channel<F, T>),
    /// See [`Tier::MainThread`].
    MainThread(&'a MainThreadModel),
    /// See [`Tier::Classical`].
    Classical(&'a ClassicalClassifier),
    /// See [`Tier::Stub`].
    Stub(&'a NullClassifier),
}

impl<F: ContextFactory, T: Timer> Strategy<'_, F, T> {
    /// The tier this strategy implements.
    pub const fn tier(&self) -> Tier {
        match self {
            Self::Worker(_) => Tier::Worker,
            Self::MainThread(_) => Tier::MainThread,
            Self::Classical(_) => Tier::Classical,
            Self::Stub(_) => Tier::Stub,
        }
    }

    /// Run this tier on `image`.
    ///
    /// # Errors
    ///
    /// Returns the tier's [`TierError`].
    pub async fn run(&self, image: &RgbaImage) -> Result<ClassificationResult, TierError> {
        match self {
            Self::Worker(channel) => {
                channel.init().await?;
                Ok(channel.classify(image).await?)
            }
            Self::MainThread(model) => Ok(model.get()?.classify(image)?),
            Self::Classical(classifier) => Ok(classifier.classify(image)?),
            Self::Stub(stub) => Ok(stub.classify(image)?),
        }
    }
}

/// Record of one tier's run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierAttempt {
    /// Which tier ran.
    pub tier: Tier,
    /// Order within the classification, starting at 1.
    pub sequence: u32,
    /// Offset from the start of the classification.
    #[serde(with = "duration_serde")]
    pub started_at: Duration,
    /// How long the tier ran.
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// The error, if the tier failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A result and the tier that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TieredClassification {
    /// The classification.
    pub result: ClassificationResult,
    /// The tier that produced it.
    pub tier: Tier,
    /// Every tier that ran, in order; the last one succeeded.
    pub attempts: Vec<TierAttempt>,
}

impl TieredClassification {
    /// Whether the result is a stub placeholder.
    #[must_use]
    pub const fn is_stub(&self) -> bool {
        self.tier.is_stub()
    }

    /// Total time spent across tiers.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.attempts
            .last()
            .map_or(Duration::ZERO, |a| a.started_at + a.duration)
    }
}

/// Every tier failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    /// No tier produced a result.
    #[error("all {} classification tiers failed", attempts.len())]
    Exhausted {
        /// The failed attempts, in order.
        attempts: Vec<TierAttempt>,
    },
}

/// Runs the fallback chain.
pub struct Orchestrator<F: ContextFactory, T: Timer> {
    channel: Option<Channel<F, T>>,
    main_thread: MainThreadModel,
    classical: ClassicalClassifier,
    stub: NullClassifier,
}

impl<F: ContextFactory, T: Timer> Orchestrator<F, T> {
    /// An orchestrator over all four tiers. Without a `channel` (no
    /// background execution support) the worker tier is skipped.
    #[must_use]
    pub fn new(
        channel: Option<Channel<F, T>>,
        model: Option<ModelSource>,
        stub: NullClassifier,
    ) -> Self {
        Self {
            channel,
            main_thread: MainThreadModel::new(model),
            classical: ClassicalClassifier::default(),
            stub,
        }
    }

    /// Replace the classical tier's settings.
    #[must_use]
    pub fn with_classical(mut self, classical: ClassicalClassifier) -> Self {
        self.classical = classical;
        self
    }

    /// The background channel, if any.
    pub const fn channel(&self) -> Option<&Channel<F, T>> {
        self.channel.as_ref()
    }

    /// The main-thread model cache.
    pub const fn main_thread(&self) -> &MainThreadModel {
        &self.main_thread
    }

    /// Available tiers, in fallback order.
    pub fn strategies(&self) -> Vec<Strategy<'_, F, T>> {
        let mut strategies = Vec::with_capacity(Tier::ALL.len());
        match &self.channel {
            Some(channel) => strategies.push(Strategy::Worker(channel)),
            None => debug!("no background execution support, skipping worker tier"),
        }
        strategies.push(Strategy::MainThread(&self.main_thread));
        strategies.push(Strategy::Classical(&self.classical));
        strategies.push(Strategy::Stub(&self.stub));
        strategies
    }

    /// Classify `image` with the first tier that succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Exhausted`] only if every tier fails.
    pub async fn classify(
        &self,
        image: &RgbaImage,
    ) -> Result<TieredClassification, OrchestratorError> {
        let origin = Instant::now();
        let mut attempts = Vec::with_capacity(Tier::ALL.len());

        for (sequence, strategy) in (1..).zip(self.strategies()) {
            let tier = strategy.tier();
            let span = info_span!("tier", tier = tier.label(), sequence);
            let started = Instant::now();
            let outcome = strategy.run(image).instrument(span.clone()).await;
            let duration = started.elapsed();
            let _entered = span.enter();

            attempts.push(TierAttempt {
                tier,
                sequence,
                started_at: started.duration_since(origin),
                duration,
                error: outcome.as_ref().err().map(ToString::to_string),
            });
            match outcome {
                Ok(result) => {
                    if tier.is_stub() {
                        warn!(
                            disease = result.disease_identifier(),
                            confidence = result.confidence_score(),
                            "returning stub result"
                        );
                    } else {
                        info!(
                            disease = result.disease_identifier(),
                            confidence = result.confidence_score(),
                            ?duration,
                            "classified"
                        );
                    }
                    return Ok(TieredClassification {
                        result,
                        tier,
                        attempts,
                    });
                }
                Err(e) => warn!(error = %e, ?duration, "tier failed, falling through"),
            }
        }

        error!(tiers = attempts.len(), "every classification tier failed");
        Err(OrchestratorError::Exhausted { attempts })
    }
}

impl<F: ContextFactory, T: Timer> fmt::Debug for Orchestrator<F, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("worker", &self.channel.is_some())
            .field("main_thread", &self.main_thread)
            .field("classical", &self.classical)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use verdant_pipeline::HEALTHY;
    use verdant_worker::{Request, Response};

    use super::*;
    use crate::testing::{LEAF_MODEL_JSON, Reply, ScriptedFactory, leaf, scripted_channel};
    use crate::timer::TokioTimer;

    fn inline_model() -> Option<ModelSource> {
        Some(ModelSource::Inline(LEAF_MODEL_JSON.into()))
    }

    fn tiers(attempts: &[TierAttempt]) -> Vec<Tier> {
        attempts.iter().map(|a| a.tier).collect()
    }

    fn transparent() -> RgbaImage {
        verdant_pipeline::rgba_from_raw(8, 8, vec![0; 8 * 8 * 4]).unwrap()
    }

    fn working_worker(request: &Request) -> Reply {
        match request {
            Request::Init { id, .. } => Reply::Respond(Response::Ready {
                id: *id,
                labels: vec![HEALTHY.into()],
            }),
            Request::Classify { id, .. } => Reply::Respond(Response::Classified {
                id: *id,
                result: ClassificationResult::new("leaf_rust", 91),
            }),
        }
    }

    #[test]
    fn tier_order_and_labels() {
        let numbers: Vec<_> = Tier::ALL.iter().map(|t| t.number()).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert_eq!(Tier::Classical.to_string(), "tier 3 (classical)");
        assert!(Tier::Stub.is_stub());
        assert!(!Tier::Worker.is_stub());
    }

    #[tokio::test(start_paused = true)]
    async fn worker_tier_answers_first() {
        let (channel, _script) = scripted_channel(working_worker);
        let orchestrator = Orchestrator::new(Some(channel), inline_model(), NullClassifier::with_seed(1));

        let out = orchestrator.classify(&leaf()).await.unwrap();
        assert_eq!(out.tier, Tier::Worker);
        assert_eq!(out.result, ClassificationResult::new("leaf_rust", 91));
        assert_eq!(out.attempts.len(), 1);
        assert!(!orchestrator.main_thread().is_loaded());
    }

    #[tokio::test(start_paused = true)]
    async fn falls_to_classical_exactly_once_after_two_failures() {
        let (channel, script) = scripted_channel(|_| Reply::Refuse);
        let orchestrator = Orchestrator::new(Some(channel), None, NullClassifier::with_seed(1));

        let out = orchestrator.classify(&leaf()).await.unwrap();
        assert_eq!(out.tier, Tier::Classical);
        assert_eq!(out.result.disease_identifier(), HEALTHY);
        assert_eq!(
            tiers(&out.attempts),
            vec![Tier::Worker, Tier::MainThread, Tier::Classical]
        );
        assert!(out.attempts[0].error.is_some());
        assert!(out.attempts[1].error.as_deref().unwrap().contains("no model configured"));
        assert!(out.attempts[2].error.is_none());
        assert_eq!(script.spawned(), 1);

        // Sequential: each tier starts after the previous one ended.
        for pair in out.attempts.windows(2) {
            assert!(pair[0].sequence < pair[1].sequence);
            assert!(pair[0].started_at + pair[0].duration <= pair[1].started_at);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_worker_times_out_then_main_thread_answers() {
        let (channel, _script) = scripted_channel(|request| match request {
            Request::Init { id, .. } => Reply::Respond(Response::Ready {
                id: *id,
                labels: vec![HEALTHY.into()],
            }),
            Request::Classify { .. } => Reply::Silent,
        });
        let orchestrator = Orchestrator::new(Some(channel), inline_model(), NullClassifier::with_seed(1));

        let out = orchestrator.classify(&leaf()).await.unwrap();
        assert_eq!(out.tier, Tier::MainThread);
        assert!(out.attempts[0].error.as_deref().unwrap().contains("timed out"));
        assert!(orchestrator.main_thread().is_loaded());
    }

    #[tokio::test]
    async fn without_channel_worker_tier_is_skipped() {
        let orchestrator: Orchestrator<ScriptedFactory, TokioTimer> =
            Orchestrator::new(None, inline_model(), NullClassifier::with_seed(1));

        let out = orchestrator.classify(&leaf()).await.unwrap();
        assert_eq!(out.tier, Tier::MainThread);
        assert_eq!(out.attempts[0].sequence, 1);
        assert_eq!(tiers(&out.attempts), vec![Tier::MainThread]);
    }

    #[tokio::test]
    async fn stub_result_is_tagged() {
        let orchestrator: Orchestrator<ScriptedFactory, TokioTimer> =
            Orchestrator::new(None, None, NullClassifier::with_seed(3));

        // Nothing opaque: the classical tier has no leaf to look at.
        let out = orchestrator.classify(&transparent()).await.unwrap();
        assert_eq!(out.tier, Tier::Stub);
        assert!(out.is_stub());
        assert_eq!(
            tiers(&out.attempts),
            vec![Tier::MainThread, Tier::Classical, Tier::Stub]
        );
        assert!(out.result.confidence_score() <= 100);
    }

    #[tokio::test]
    async fn exhausted_when_every_tier_fails() {
        let orchestrator: Orchestrator<ScriptedFactory, TokioTimer> = Orchestrator::new(
            None,
            None,
            NullClassifier::with_seed(3).with_labels(Vec::<String>::new()),
        );

        let err = orchestrator.classify(&transparent()).await.unwrap_err();
        let OrchestratorError::Exhausted { attempts } = err;
        assert_eq!(attempts.len(), 3);
        assert!(attempts.iter().all(|a| a.error.is_some()));
    }

    #[tokio::test]
    async fn main_thread_model_is_cached() {
        let model = MainThreadModel::new(inline_model());
        let first = model.get().unwrap();
        let second = model.get().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn failed_main_thread_load_is_retried() {
        let model = MainThreadModel::new(Some(ModelSource::Inline("not json".into())));
        assert!(matches!(model.get(), Err(InferenceError::InvalidModel(_))));
        assert!(!model.is_loaded());
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_channel_still_falls_through() {
        let (channel, script) = scripted_channel(|_| Reply::Refuse);
        let orchestrator = Orchestrator::new(Some(channel), inline_model(), NullClassifier::with_seed(1));

        for _ in 0..5 {
            let out = orchestrator.classify(&leaf()).await.unwrap();
            assert_eq!(out.tier, Tier::MainThread);
        }
        // Attempts are capped; later classifications skip straight past.
        assert_eq!(script.spawned(), 3);
        assert!(matches!(
            orchestrator.channel().unwrap().init().await,
            Err(ChannelError::Unavailable { attempts: 3 })
        ));
    }
}
