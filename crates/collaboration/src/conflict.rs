//! Conflict inspection for rejected saves
//!
//! Nothing here merges. Two versions of a document are compared collection
//! by collection and the differences are handed to the user, who keeps one
//! side or the other.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

use crate::{CollaborationError, DocumentVersion, Result};
use threat_model::{duplicate_identity, EntityKey, Identified, ThreatModel};

/// Logical collections of a threat model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    /// Free-text description of the system
    Summary,
    Assumptions,
    Assets,
    Threats,
    Mitigations,
    DataFlows,
    TrustBoundaries,
}

impl Collection {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Assumptions => "assumptions",
            Self::Assets => "assets",
            Self::Threats => "threats",
            Self::Mitigations => "mitigations",
            Self::DataFlows => "data flows",
            Self::TrustBoundaries => "trust boundaries",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Present locally, absent on the server
    Added,
    Modified,
    /// Present on the server, absent locally
    Deleted,
}

/// One differing entity. `before` is the server side, `after` the local side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub kind: ChangeKind,
    pub entity_key: EntityKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeGroup {
    pub collection: Collection,
    pub changes: Vec<Change>,
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
}

impl ChangeGroup {
    fn new(collection: Collection, changes: Vec<Change>) -> Self {
        let count = |kind| changes.iter().filter(|c| c.kind == kind).count();
        let (added, modified, deleted) = (
            count(ChangeKind::Added),
            count(ChangeKind::Modified),
            count(ChangeKind::Deleted),
        );
        Self {
            collection,
            changes,
            added,
            modified,
            deleted,
        }
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Totals across every group of a [`ChangeSet`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
}

impl ChangeSummary {
    pub fn total(&self) -> usize {
        self.added + self.modified + self.deleted
    }
}

impl fmt::Display for ChangeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} added, {} modified, {} deleted",
            self.added, self.modified, self.deleted
        )
    }
}

/// Differences between a local and a server document, grouped by
/// collection. Only collections with at least one change are present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub groups: Vec<ChangeGroup>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(ChangeGroup::is_empty)
    }

    pub fn group(&self, collection: Collection) -> Option<&ChangeGroup> {
        self.groups.iter().find(|g| g.collection == collection)
    }

    pub fn changes(&self) -> impl Iterator<Item = (Collection, &Change)> {
        self.groups
            .iter()
            .flat_map(|g| g.changes.iter().map(move |c| (g.collection, c)))
    }

    pub fn summary(&self) -> ChangeSummary {
        self.groups
            .iter()
            .fold(ChangeSummary::default(), |acc, g| ChangeSummary {
                added: acc.added + g.added,
                modified: acc.modified + g.modified,
                deleted: acc.deleted + g.deleted,
            })
    }

    fn push(&mut self, collection: Collection, changes: Vec<Change>) {
        if !changes.is_empty() {
            self.groups.push(ChangeGroup::new(collection, changes));
        }
    }
}

/// How the user settles a save conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Submit the whole local document over the server copy
    KeepLocal,
    /// Drop local edits and adopt the server copy
    AcceptServer,
}

/// A rejected save waiting for the user's decision
#[derive(Debug, Clone, PartialEq)]
pub struct PendingConflict {
    pub local: ThreatModel,
    pub server: DocumentVersion,
    pub changes: ChangeSet,
}

pub struct ConflictDiffEngine;

impl ConflictDiffEngine {
    /// Compares a local document against the server's version of the same
    /// resource.
    pub fn diff(local: &DocumentVersion, server: &DocumentVersion) -> Result<ChangeSet> {
        if !local.is_comparable(server) {
            return Err(CollaborationError::Incomparable(
                local.resource_id.clone(),
                server.resource_id.clone(),
            ));
        }
        Self::diff_models(&local.document, &server.document)
    }

    pub fn diff_models(local: &ThreatModel, server: &ThreatModel) -> Result<ChangeSet> {
        let mut set = ChangeSet::default();

        if local.description != server.description {
            set.push(
                Collection::Summary,
                vec![Change {
                    kind: ChangeKind::Modified,
                    entity_key: EntityKey::Name("description".to_string()),
                    before: Some(Value::String(server.description.clone())),
                    after: Some(Value::String(local.description.clone())),
                }],
            );
        }

        set.push(
            Collection::Assumptions,
            diff_collection(Collection::Assumptions, &local.assumptions, &server.assumptions)?,
        );
        set.push(
            Collection::Assets,
            diff_collection(Collection::Assets, &local.assets, &server.assets)?,
        );
        set.push(
            Collection::Threats,
            diff_collection(Collection::Threats, &local.threats, &server.threats)?,
        );
        set.push(
            Collection::Mitigations,
            diff_collection(Collection::Mitigations, &local.mitigations, &server.mitigations)?,
        );
        set.push(
            Collection::DataFlows,
            diff_collection(Collection::DataFlows, &local.data_flows, &server.data_flows)?,
        );
        set.push(
            Collection::TrustBoundaries,
            diff_collection(
                Collection::TrustBoundaries,
                &local.trust_boundaries,
                &server.trust_boundaries,
            )?,
        );

        Ok(set)
    }
}

fn diff_collection<T>(collection: Collection, local: &[T], server: &[T]) -> Result<Vec<Change>>
where
    T: Identified + Serialize,
{
    let local: Vec<T> = local.iter().map(Identified::normalized).collect();
    let server: Vec<T> = server.iter().map(Identified::normalized).collect();

    if local == server {
        return Ok(Vec::new());
    }

    let duplicate = duplicate_identity(&local).or_else(|| duplicate_identity(&server));
    if let Some(key) = duplicate {
        warn!(%collection, key = %key, "duplicate identity, reporting every entry as unmatched");
        let mut changes = Vec::with_capacity(local.len() + server.len());
        for entity in &local {
            changes.push(added(entity)?);
        }
        for entity in &server {
            changes.push(deleted(entity)?);
        }
        return Ok(changes);
    }

    let mut unmatched: HashMap<EntityKey, &T> =
        server.iter().map(|entity| (entity.identity(), entity)).collect();
    let mut changes = Vec::new();

    for entity in &local {
        match unmatched.remove(&entity.identity()) {
            Some(theirs) if theirs == entity => {}
            Some(theirs) => changes.push(Change {
                kind: ChangeKind::Modified,
                entity_key: entity.identity(),
                before: Some(serde_json::to_value(theirs)?),
                after: Some(serde_json::to_value(entity)?),
            }),
            None => changes.push(added(entity)?),
        }
    }

    // Server order for deletions
    for entity in &server {
        if unmatched.contains_key(&entity.identity()) {
            changes.push(deleted(entity)?);
        }
    }

    Ok(changes)
}

fn added<T: Identified + Serialize>(entity: &T) -> Result<Change> {
    Ok(Change {
        kind: ChangeKind::Added,
        entity_key: entity.identity(),
        before: None,
        after: Some(serde_json::to_value(entity)?),
    })
}

fn deleted<T: Identified + Serialize>(entity: &T) -> Result<Change> {
    Ok(Change {
        kind: ChangeKind::Deleted,
        entity_key: entity.identity(),
        before: Some(serde_json::to_value(entity)?),
        after: None,
    })
}
