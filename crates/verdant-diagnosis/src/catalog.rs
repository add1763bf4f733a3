//! Static disease content.
//!
//! The knowledge base is a read-only dictionary keyed by the identifiers
//! the classifiers emit. It ships embedded in the binary as JSON.

use std::collections::BTreeMap;

use verdant_pipeline::HEALTHY;

use crate::record::DiseaseInfo;

/// The catalog compiled into the crate.
const EMBEDDED_CATALOG: &str = include_str!("../data/catalog.json");

/// Errors loading a catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// The catalog JSON is malformed.
    #[error("failed to parse disease catalog: {0}")]
    Parse(#[from] serde_json::Error),

    /// The catalog has no entry for healthy plants.
    #[error("disease catalog has no \"healthy\" entry")]
    MissingHealthy,
}

/// Read-only access to disease content.
pub trait ContentLookup {
    /// Content for one identifier.
    fn disease_info(&self, identifier: &str) -> Option<&DiseaseInfo>;

    /// Every entry, keyed by identifier.
    fn all_disease_info(&self) -> &BTreeMap<String, DiseaseInfo>;
}

/// A catalog parsed once from JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticCatalog {
    entries: BTreeMap<String, DiseaseInfo>,
}

impl StaticCatalog {
    /// The catalog shipped with verdant.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] if the embedded JSON is invalid.
    pub fn embedded() -> Result<Self, CatalogError> {
        Self::from_json(EMBEDDED_CATALOG)
    }

    /// Parse a catalog from a JSON object keyed by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Parse`] for malformed JSON and
    /// [`CatalogError::MissingHealthy`] if there is no healthy entry.
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let entries: BTreeMap<String, DiseaseInfo> = serde_json::from_str(json)?;
        if !entries.contains_key(HEALTHY) {
            return Err(CatalogError::MissingHealthy);
        }
        Ok(Self { entries })
    }

    /// Identifiers with content, in sorted order.
    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl ContentLookup for StaticCatalog {
    fn disease_info(&self, identifier: &str) -> Option<&DiseaseInfo> {
        self.entries.get(identifier)
    }

    fn all_disease_info(&self) -> &BTreeMap<String, DiseaseInfo> {
        &self.entries
    }
}
