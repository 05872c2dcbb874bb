use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;
use threat_model::ThreatModel;

/// Snapshot of a document as stored on the server (or as edited locally)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentVersion {
    pub resource_id: ResourceId,
    pub document: ThreatModel,
    pub last_modified_at: DateTime<Utc>,
    /// User the document belongs to
    #[serde(default)]
    pub owner: Option<String>,
}

impl DocumentVersion {
    pub fn new(
        resource_id: impl Into<ResourceId>,
        document: ThreatModel,
        last_modified_at: DateTime<Utc>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            document,
            last_modified_at,
            owner: None,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Two versions can only be diffed when they describe the same resource.
    pub fn is_comparable(&self, other: &DocumentVersion) -> bool {
        self.resource_id == other.resource_id
    }

    pub fn is_newer_than(&self, other: &DocumentVersion) -> bool {
        self.last_modified_at > other.last_modified_at
    }
}
