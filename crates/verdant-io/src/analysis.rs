//! One analysis from uploaded bytes to a stored diagnosis.
//!
//! ```text
//! validate → preprocess → orchestrate → upload image → assemble → save
//! ```
//!
//! Validation failures stop the analysis before any inference runs.
//! Persistence never fails an analysis: the caller always gets the
//! assembled record back, with a [`SaveOutcome`] saying whether it was
//! kept. Stub results are shown but never persisted.

use serde::Serialize;
use tracing::{Instrument, info, info_span, warn};
use verdant_diagnosis::{ContentLookup, DiagnosisRecord, assemble};
use verdant_pipeline::{
    PreprocessOptions, RawImage, ValidationError, ValidationPolicy, preprocess, validate,
};
use verdant_store::{BackingStore, ResultStore, SaveOutcome};

use crate::channel::ContextFactory;
use crate::orchestrator::{Orchestrator, OrchestratorError, Tier, TierAttempt};
use crate::timer::Timer;

/// Shown when no specific cause is known.
pub const GENERIC_RETRY_MESSAGE: &str =
    "We couldn't analyze this image. Please try again in a moment.";

/// Shown when the background model timed out and nothing else answered.
pub const TIMEOUT_MESSAGE: &str =
    "Analysis took too long to complete. Please try again.";

/// Why an analysis produced no diagnosis.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AnalysisError {
    /// The image was rejected before inference.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Every classification tier failed.
    #[error(transparent)]
    Classification(#[from] OrchestratorError),
}

impl AnalysisError {
    /// Message for the end user: specific when the cause is known,
    /// otherwise a prompt to retry.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(e) => e.to_string(),
            Self::Classification(OrchestratorError::Exhausted { attempts }) => {
                let timed_out = attempts.iter().any(|a| {
                    a.tier == Tier::Worker
                        && a.error.as_deref().is_some_and(|e| e.contains("timed out"))
                });
                if timed_out {
                    TIMEOUT_MESSAGE.to_owned()
                } else {
                    GENERIC_RETRY_MESSAGE.to_owned()
                }
            }
        }
    }
}

/// A completed analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Analysis {
    /// The diagnosis shown to the user.
    pub record: DiagnosisRecord,
    /// Tier that produced the classification.
    pub tier: Tier,
    /// Every tier that ran.
    pub attempts: Vec<TierAttempt>,
    /// Whether the record was kept in history.
    pub saved: SaveOutcome,
}

impl Analysis {
    /// Human-readable summary with per-tier timings.
    #[must_use]
    pub fn report(&self) -> String {
        let record = &self.record;
        let mut lines = Vec::new();
        lines.push(format!("Diagnosis Report\n{}", "=".repeat(60)));
        let disease = record.disease_name.as_ref().map_or_else(
            || "Healthy".to_owned(),
            |name| format!("{name} ({})", record.disease_identifier),
        );
        lines.push(format!("Disease:    {disease}"));
        lines.push(format!("Confidence: {}%", record.confidence_score));
        lines.push(format!("Plant type: {}", record.plant_type));
        lines.push(format!("Tier:       {}", self.tier));
        lines.push(format!("Saved:      {}", describe_save(&self.saved)));
        lines.push(format!("Id:         {}", record.id));
        lines.push(String::new());

        lines.push(format!("{:<24} {:>10}  {}", "Tier", "Duration", "Result"));
        lines.push("-".repeat(80));
        for attempt in &self.attempts {
            let ms = attempt.duration.as_secs_f64() * 1000.0;
            let result = attempt
                .error
                .as_ref()
                .map_or_else(|| "ok".to_owned(), |e| format!("failed: {e}"));
            lines.push(format!("{:<24} {ms:>8.3}ms  {result}", attempt.tier.to_string()));
        }

        if !record.symptoms.is_empty() {
            lines.push(String::new());
            lines.push("Symptoms:".to_owned());
            lines.extend(record.symptoms.iter().map(|s| format!("  - {s}")));
        }
        if !record.treatment_options.is_empty() {
            lines.push(String::new());
            lines.push("Treatments:".to_owned());
            lines.extend(record.treatment_options.iter().map(|t| {
                format!("  - {} ({}%): {}", t.name, t.effectiveness_percent, t.application_method)
            }));
        }
        lines.join("\n")
    }
}

fn describe_save(outcome: &SaveOutcome) -> String {
    match outcome {
        SaveOutcome::Saved => "saved to history".to_owned(),
        SaveOutcome::BelowThreshold => "not saved (confidence below threshold)".to_owned(),
        SaveOutcome::Skipped => "not saved".to_owned(),
        SaveOutcome::Failed(e) => format!("save failed: {e}"),
    }
}

/// Runs analyses against one orchestrator, store and catalog.
pub struct Analyzer<F: ContextFactory, T: Timer, S, L> {
    orchestrator: Orchestrator<F, T>,
    store: ResultStore<S>,
    catalog: L,
    validation: ValidationPolicy,
    preprocess: PreprocessOptions,
}

impl<F, T, S, L> Analyzer<F, T, S, L>
where
    F: ContextFactory,
    T: Timer,
    S: BackingStore,
    L: ContentLookup,
{
    /// An analyzer with default validation and preprocessing.
    #[must_use]
    pub fn new(orchestrator: Orchestrator<F, T>, store: ResultStore<S>, catalog: L) -> Self {
        Self {
            orchestrator,
            store,
            catalog,
            validation: ValidationPolicy::default(),
            preprocess: PreprocessOptions::default(),
        }
    }

    /// Replace the upload acceptance rules.
    #[must_use]
    pub fn with_validation(mut self, validation: ValidationPolicy) -> Self {
        self.validation = validation;
        self
    }

    /// Replace the preprocessing options.
    #[must_use]
    pub fn with_preprocess(mut self, preprocess: PreprocessOptions) -> Self {
        self.preprocess = preprocess;
        self
    }

    /// The orchestrator.
    pub const fn orchestrator(&self) -> &Orchestrator<F, T> {
        &self.orchestrator
    }

    /// The result store gateway.
    pub const fn store(&self) -> &ResultStore<S> {
        &self.store
    }

    /// Analyze one image.
    ///
    /// `preview_url` is where the caller can already show the image
    /// (for example a `blob:` URL). It becomes the record's image URL
    /// unless the image is uploaded to the store.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::Validation`] for rejected images and
    /// [`AnalysisError::Classification`] when every tier fails.
    pub async fn analyze(
        &self,
        raw: &RawImage,
        preview_url: &str,
    ) -> Result<Analysis, AnalysisError> {
        let span = info_span!("analysis", bytes = raw.len(), mime = %raw.mime_type);
        self.run(raw, preview_url).instrument(span).await
    }

    async fn run(&self, raw: &RawImage, preview_url: &str) -> Result<Analysis, AnalysisError> {
        let validated = validate(raw, &self.validation).inspect_err(|e| {
            info!(error = %e, "image rejected");
        })?;
        let prepared = preprocess(&validated.image, &self.preprocess);
        drop(validated);

        let classified = self.orchestrator.classify(&prepared).await?;
        drop(prepared);

        let confidence = classified.result.confidence_score();
        let persist = !classified.is_stub() && self.store.meets_threshold(confidence);
        let uploaded = if persist {
            self.store.store_image(&raw.bytes, &raw.mime_type).await
        } else {
            None
        };
        let image_url = uploaded.clone().unwrap_or_else(|| preview_url.to_owned());

        let mut record = assemble(&classified.result, image_url, &self.catalog);
        let saved = if classified.is_stub() {
            warn!(id = %record.id, "stub result is not persisted");
            SaveOutcome::Skipped
        } else {
            self.store.save(&record).await
        };
        if let Some(url) = uploaded.filter(|_| !saved.is_saved()) {
            // Nothing in history refers to the upload.
            self.store.discard_image(&url).await;
            preview_url.clone_into(&mut record.image_url);
        }

        info!(
            id = %record.id,
            disease = %record.disease_identifier,
            confidence,
            tier = classified.tier.label(),
            saved = saved.is_saved(),
            "analysis complete"
        );
        Ok(Analysis {
            record,
            tier: classified.tier,
            attempts: classified.attempts,
            saved,
        })
    }
}
