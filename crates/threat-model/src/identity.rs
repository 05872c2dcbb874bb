//! Identity and normalization rules used when two document versions are
//! compared entity by entity.
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::{Asset, Assumption, DataFlow, Mitigation, Threat, TrustBoundary};

/// Identity of an entity inside its collection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "key", rename_all = "snake_case")]
pub enum EntityKey {
    Name(String),
    Flow {
        source: String,
        target: String,
        description: String,
    },
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "{}", name),
            Self::Flow {
                source,
                target,
                description,
            } if description.is_empty() => write!(f, "{} -> {}", source, target),
            Self::Flow {
                source,
                target,
                description,
            } => write!(f, "{} -> {} ({})", source, target, description),
        }
    }
}

/// An entity that can be matched across two versions of a document.
pub trait Identified: Clone + PartialEq {
    /// Must be unique within one version of a collection for matching to work.
    fn identity(&self) -> EntityKey;

    /// Copy with placeholder values (empty lists, empty strings) collapsed and
    /// user-private fields cleared, so they never register as differences.
    fn normalized(&self) -> Self;
}

/// Returns the first identity that occurs more than once in `items`.
pub fn duplicate_identity<T: Identified>(items: &[T]) -> Option<EntityKey> {
    let mut seen = HashSet::with_capacity(items.len());
    items
        .iter()
        .map(Identified::identity)
        .find(|key| !seen.insert(key.clone()))
}

fn text(value: &Option<String>) -> Option<String> {
    value
        .as_ref()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn list(value: &Option<Vec<String>>) -> Option<Vec<String>> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}

impl Identified for Assumption {
    fn identity(&self) -> EntityKey {
        EntityKey::Name(self.assumption.clone())
    }

    fn normalized(&self) -> Self {
        Self {
            assumption: self.assumption.clone(),
            assumption_type: text(&self.assumption_type),
        }
    }
}

impl Identified for Asset {
    fn identity(&self) -> EntityKey {
        EntityKey::Name(self.name.clone())
    }

    fn normalized(&self) -> Self {
        Self {
            name: self.name.clone(),
            asset_type: text(&self.asset_type),
            criticality: text(&self.criticality),
        }
    }
}

impl Identified for Threat {
    fn identity(&self) -> EntityKey {
        EntityKey::Name(self.name.clone())
    }

    fn normalized(&self) -> Self {
        Self {
            name: self.name.clone(),
            description: text(&self.description),
            likelihood: self.likelihood,
            stride: list(&self.stride),
            mitigation_links: list(&self.mitigation_links),
            starred: false,
        }
    }
}

impl Identified for Mitigation {
    fn identity(&self) -> EntityKey {
        EntityKey::Name(self.name.clone())
    }

    fn normalized(&self) -> Self {
        Self {
            name: self.name.clone(),
            description: text(&self.description),
            threats_addressed: list(&self.threats_addressed),
        }
    }
}

impl Identified for DataFlow {
    fn identity(&self) -> EntityKey {
        EntityKey::Flow {
            source: self.source_entity.clone(),
            target: self.target_entity.clone(),
            description: self.flow_description.clone(),
        }
    }

    fn normalized(&self) -> Self {
        Self {
            source_entity: self.source_entity.clone(),
            target_entity: self.target_entity.clone(),
            flow_description: self.flow_description.clone(),
            protocol: text(&self.protocol),
        }
    }
}

impl Identified for TrustBoundary {
    fn identity(&self) -> EntityKey {
        EntityKey::Name(self.purpose.clone())
    }

    fn normalized(&self) -> Self {
        Self {
            purpose: self.purpose.clone(),
            source_entity: text(&self.source_entity),
            target_entity: text(&self.target_entity),
        }
    }
}
