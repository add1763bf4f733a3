//! verdant-diagnosis: Disease content and diagnosis records.
//!
//! Maps a classification result to a user-facing [`DiagnosisRecord`]
//! using a read-only [`ContentLookup`]. No I/O: the shipped catalog is
//! compiled in and assembly is pure composition.

pub mod assemble;
pub mod catalog;
pub mod record;

pub use assemble::{assemble, assemble_with, humanize};
pub use catalog::{CatalogError, ContentLookup, StaticCatalog};
pub use record::{
    DiagnosisRecord, DiseaseInfo, FeedbackAnnotation, ProductRecommendation, TreatmentOption,
};
