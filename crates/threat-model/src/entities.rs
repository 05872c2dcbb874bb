use serde::{Deserialize, Serialize};
use std::fmt;

/// How likely a threat is to be realised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Likelihood {
    Low,
    Medium,
    High,
}

impl fmt::Display for Likelihood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "Low"),
            Self::Medium => write!(f, "Medium"),
            Self::High => write!(f, "High"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assumption {
    pub assumption: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assumption_type: Option<String>,
}

impl Assumption {
    pub fn new(assumption: impl Into<String>) -> Self {
        Self {
            assumption: assumption.into(),
            assumption_type: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criticality: Option<String>,
}

impl Asset {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            asset_type: None,
            criticality: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Threat {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub likelihood: Option<Likelihood>,
    /// STRIDE categories the threat falls under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stride: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mitigation_links: Option<Vec<String>>,
    /// Set by the reviewing user only; the generator never sees it.
    #[serde(default)]
    pub starred: bool,
}

impl Threat {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            likelihood: None,
            stride: None,
            mitigation_links: None,
            starred: false,
        }
    }

    pub fn with_likelihood(mut self, likelihood: Likelihood) -> Self {
        self.likelihood = Some(likelihood);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_stride(mut self, categories: &[&str]) -> Self {
        self.stride = Some(categories.iter().map(|c| c.to_string()).collect());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mitigation {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threats_addressed: Option<Vec<String>>,
}

impl Mitigation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            threats_addressed: None,
        }
    }
}

/// Directed data flow between two entities of the architecture.
///
/// Several flows may connect the same pair of endpoints; they are told apart
/// by their description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataFlow {
    pub source_entity: String,
    pub target_entity: String,
    #[serde(default)]
    pub flow_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

impl DataFlow {
    pub fn new(
        source_entity: impl Into<String>,
        target_entity: impl Into<String>,
        flow_description: impl Into<String>,
    ) -> Self {
        Self {
            source_entity: source_entity.into(),
            target_entity: target_entity.into(),
            flow_description: flow_description.into(),
            protocol: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustBoundary {
    pub purpose: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_entity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_entity: Option<String>,
}

impl TrustBoundary {
    pub fn new(purpose: impl Into<String>) -> Self {
        Self {
            purpose: purpose.into(),
            source_entity: None,
            target_entity: None,
        }
    }
}
