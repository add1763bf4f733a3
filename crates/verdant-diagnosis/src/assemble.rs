//! Diagnosis assembly.
//!
//! Combines a [`ClassificationResult`] with static content into a
//! [`DiagnosisRecord`]. Pure composition: the only inputs besides the
//! arguments are a fresh id and the current time, and [`assemble_with`]
//! takes those explicitly.

use chrono::{DateTime, Utc};
use uuid::Uuid;
use verdant_pipeline::ClassificationResult;

use crate::catalog::ContentLookup;
use crate::record::DiagnosisRecord;

/// Description used for identifiers missing from the catalog.
pub const GENERIC_DESCRIPTION: &str = "Signs of a plant health problem were detected, but no \
     detailed information is available for it yet. Isolate the plant and consult a local \
     extension service if symptoms spread.";

/// Description used for healthy plants when the catalog has no entry.
pub const GENERIC_HEALTHY_DESCRIPTION: &str = "No signs of disease were detected.";

/// Plant type used when the catalog has no entry.
pub const UNKNOWN_PLANT_TYPE: &str = "Unknown";

/// Turn an identifier into a display name: `leaf_curl` -> `Leaf Curl`.
#[must_use]
pub fn humanize(identifier: &str) -> String {
    identifier
        .split(['_', '-', ' '])
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars).collect()
            })
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build a record with a fresh id and the current time.
#[must_use = "returns the assembled record"]
pub fn assemble(
    classification: &ClassificationResult,
    image_url: impl Into<String>,
    lookup: &impl ContentLookup,
) -> DiagnosisRecord {
    assemble_with(classification, image_url, lookup, Uuid::new_v4(), Utc::now())
}

/// Build a record with a caller-supplied id and timestamp.
///
/// `is_healthy` is derived from the identifier. A healthy record keeps the
/// catalog's description and product suggestions but never carries a
/// disease name, symptoms or treatments. Identifiers without catalog
/// content get a humanized name and [`GENERIC_DESCRIPTION`].
#[must_use = "returns the assembled record"]
pub fn assemble_with(
    classification: &ClassificationResult,
    image_url: impl Into<String>,
    lookup: &impl ContentLookup,
    id: Uuid,
    created_at: DateTime<Utc>,
) -> DiagnosisRecord {
    let identifier = classification.disease_identifier();
    let is_healthy = classification.is_healthy();
    let info = lookup.disease_info(identifier);

    let (description, plant_type, products) = match info {
        Some(info) => (
            info.description.clone(),
            info.plant_type.clone(),
            info.product_recommendations.clone(),
        ),
        None if is_healthy => (
            GENERIC_HEALTHY_DESCRIPTION.to_owned(),
            UNKNOWN_PLANT_TYPE.to_owned(),
            Vec::new(),
        ),
        None => (
            GENERIC_DESCRIPTION.to_owned(),
            UNKNOWN_PLANT_TYPE.to_owned(),
            Vec::new(),
        ),
    };

    let (disease_name, symptoms, treatment_options) = if is_healthy {
        (None, Vec::new(), Vec::new())
    } else {
        match info {
            Some(info) => (
                Some(info.name.clone()),
                info.symptoms.clone(),
                info.treatment_options.clone(),
            ),
            None => (Some(humanize(identifier)), Vec::new(), Vec::new()),
        }
    };

    DiagnosisRecord {
        id,
        disease_identifier: identifier.to_owned(),
        is_healthy,
        disease_name,
        confidence_score: classification.confidence_score(),
        description,
        symptoms,
        treatment_options,
        product_recommendations: products,
        plant_type,
        image_url: image_url.into(),
        created_at,
        feedback: None,
    }
}
