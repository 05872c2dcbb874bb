//! Editable threat model document shared between collaborators.
//!
//! The document is a free-text description plus a handful of named entity
//! collections. Each entity type knows how to identify itself across two
//! versions of the document and how to strip fields that never take part in
//! a comparison (see [`Identified`]).
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod entities;
pub use entities::*;
mod identity;
pub use identity::*;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to parse threat model: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("duplicate {collection} entry: {key}")]
    DuplicateKey {
        collection: &'static str,
        key: EntityKey,
    },
}

/// The document protected by a lease and edited by one writer at a time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatModel {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub assumptions: Vec<Assumption>,
    #[serde(default)]
    pub assets: Vec<Asset>,
    #[serde(default)]
    pub threats: Vec<Threat>,
    #[serde(default)]
    pub mitigations: Vec<Mitigation>,
    #[serde(default)]
    pub data_flows: Vec<DataFlow>,
    #[serde(default)]
    pub trust_boundaries: Vec<TrustBoundary>,
}

impl ThreatModel {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ModelError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_pretty(&self) -> Result<String, ModelError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Checks that every collection identifies its entries uniquely.
    pub fn validate(&self) -> Result<(), ModelError> {
        first_duplicate("assumption", &self.assumptions)?;
        first_duplicate("asset", &self.assets)?;
        first_duplicate("threat", &self.threats)?;
        first_duplicate("mitigation", &self.mitigations)?;
        first_duplicate("data flow", &self.data_flows)?;
        first_duplicate("trust boundary", &self.trust_boundaries)?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.description.trim().is_empty()
            && self.assumptions.is_empty()
            && self.assets.is_empty()
            && self.threats.is_empty()
            && self.mitigations.is_empty()
            && self.data_flows.is_empty()
            && self.trust_boundaries.is_empty()
    }

    pub fn threat(&self, name: &str) -> Option<&Threat> {
        self.threats.iter().find(|t| t.name == name)
    }
}

fn first_duplicate<T: Identified>(collection: &'static str, items: &[T]) -> Result<(), ModelError> {
    match duplicate_identity(items) {
        Some(key) => Err(ModelError::DuplicateKey { collection, key }),
        None => Ok(()),
    }
}
