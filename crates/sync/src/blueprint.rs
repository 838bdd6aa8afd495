use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::types::BlueprintId;

/// Immutable entity template. Never mutated after publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    pub id: BlueprintId,
    pub version: u32,
    pub name: String,
    pub description: String,
    pub model_ref: Option<String>,
}

/// Authoring-side input for a publish.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlueprintDraft {
    pub name: String,
    pub description: String,
    pub model_ref: Option<String>,
}

impl BlueprintDraft {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model_ref: impl Into<String>) -> Self {
        self.model_ref = Some(model_ref.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Default)]
pub struct BlueprintRegistry {
    blueprints: HashMap<BlueprintId, Blueprint>,
    publish_order: Vec<BlueprintId>,
}

impl BlueprintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&mut self, draft: BlueprintDraft) -> SyncResult<BlueprintId> {
        self.insert_version(draft, 1)
    }

    /// Publishes a new version of `previous`. The old blueprint stays
    /// resolvable for entities that still reference it.
    pub fn republish(
        &mut self,
        previous: BlueprintId,
        draft: BlueprintDraft,
    ) -> SyncResult<BlueprintId> {
        let version = self
            .blueprints
            .get(&previous)
            .map(|b| b.version + 1)
            .ok_or_else(|| SyncError::validation(format!("unknown blueprint {}", previous)))?;
        self.insert_version(draft, version)
    }

    /// Registers a blueprint published elsewhere (replicated from the server).
    pub fn insert(&mut self, blueprint: Blueprint) -> bool {
        if self.blueprints.contains_key(&blueprint.id) {
            return false;
        }
        self.publish_order.push(blueprint.id);
        self.blueprints.insert(blueprint.id, blueprint);
        true
    }

    pub fn get(&self, id: BlueprintId) -> Option<&Blueprint> {
        self.blueprints.get(&id)
    }

    pub fn contains(&self, id: BlueprintId) -> bool {
        self.blueprints.contains_key(&id)
    }

    /// Blueprints in publish order.
    pub fn iter(&self) -> impl Iterator<Item = &Blueprint> {
        self.publish_order
            .iter()
            .filter_map(|id| self.blueprints.get(id))
    }

    pub fn len(&self) -> usize {
        self.blueprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blueprints.is_empty()
    }

    fn insert_version(&mut self, draft: BlueprintDraft, version: u32) -> SyncResult<BlueprintId> {
        if draft.name.trim().is_empty() {
            return Err(SyncError::validation("blueprint name is empty"));
        }

        let id = BlueprintId::new();
        let blueprint = Blueprint {
            id,
            version,
            name: draft.name,
            description: draft.description,
            model_ref: draft.model_ref,
        };
        self.blueprints.insert(id, blueprint);
        self.publish_order.push(id);

        log::debug!("published blueprint {} v{}", id, version);
        Ok(id)
    }
}
