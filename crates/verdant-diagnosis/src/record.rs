//! Diagnosis record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One way to treat a disease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreatmentOption {
    /// Short title.
    pub name: String,
    /// What the treatment does.
    pub description: String,
    /// Expected effectiveness, `0..=100`.
    pub effectiveness_percent: u8,
    /// How to apply it.
    pub application_method: String,
}

/// A product suggested for a diagnosis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRecommendation {
    /// Product name.
    pub name: String,
    /// Product category (e.g. `"fungicide"`, `"organic"`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Why it is recommended.
    pub description: String,
    /// Optional product picture.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// Static descriptive content for one disease identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiseaseInfo {
    /// Display name.
    pub name: String,
    /// Typical host plant.
    pub plant_type: String,
    /// Overview paragraph.
    pub description: String,
    /// Visible symptoms, most telling first.
    #[serde(default)]
    pub symptoms: Vec<String>,
    /// Treatments, in recommended order.
    #[serde(default)]
    pub treatment_options: Vec<TreatmentOption>,
    /// Suggested products.
    #[serde(default)]
    pub product_recommendations: Vec<ProductRecommendation>,
}

/// User feedback on a diagnosis. At most one per diagnosis; a later
/// annotation replaces an earlier one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackAnnotation {
    /// The diagnosis the feedback is about.
    pub diagnosis_id: Uuid,
    /// Whether the diagnosis was helpful.
    pub helpful: bool,
    /// Free-text comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// When the annotation was last written.
    pub updated_at: DateTime<Utc>,
}

impl FeedbackAnnotation {
    /// Feedback stamped with the current time.
    #[must_use]
    pub fn new(diagnosis_id: Uuid, helpful: bool, comment: Option<String>) -> Self {
        Self {
            diagnosis_id,
            helpful,
            comment,
            updated_at: Utc::now(),
        }
    }
}

/// The result of one completed analysis.
///
/// Created once by [`assemble`](crate::assemble) and immutable afterwards
/// apart from [`feedback`](Self::feedback). When `is_healthy` is set,
/// `disease_name` is `None` and `symptoms` and `treatment_options` are
/// empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosisRecord {
    /// Globally unique id.
    pub id: Uuid,
    /// Disease key the classifier produced.
    pub disease_identifier: String,
    /// `true` when the identifier is `"healthy"`.
    pub is_healthy: bool,
    /// Display name of the disease; absent when healthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disease_name: Option<String>,
    /// Classifier confidence, `0..=100`.
    pub confidence_score: u8,
    /// Overview paragraph.
    pub description: String,
    /// Visible symptoms.
    pub symptoms: Vec<String>,
    /// Treatments.
    pub treatment_options: Vec<TreatmentOption>,
    /// Suggested products.
    pub product_recommendations: Vec<ProductRecommendation>,
    /// Typical host plant.
    pub plant_type: String,
    /// Where the analysed image can be viewed.
    pub image_url: String,
    /// When the analysis completed.
    pub created_at: DateTime<Utc>,
    /// Attached user feedback, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<FeedbackAnnotation>,
}
