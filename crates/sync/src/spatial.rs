use std::collections::HashMap;

use crate::types::{EntityId, Transform};

/// The physics/scene side of the world. The core never simulates; it reads
/// transforms for entities it authors and pushes validated ones back.
pub trait SpatialSystem: Send {
    fn read_transform(&self, entity: EntityId) -> Option<Transform>;
    fn apply_transform(&mut self, entity: EntityId, transform: &Transform);
    fn forget(&mut self, _entity: EntityId) {}
}

/// Stores the last transform per entity; stands in for a physics scene.
#[derive(Debug, Default, Clone)]
pub struct TransformCache {
    transforms: HashMap<EntityId, Transform>,
}

impl TransformCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves an entity as if the simulation had done it.
    pub fn set(&mut self, entity: EntityId, transform: Transform) {
        self.transforms.insert(entity, transform);
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }
}

impl SpatialSystem for TransformCache {
    fn read_transform(&self, entity: EntityId) -> Option<Transform> {
        self.transforms.get(&entity).copied()
    }

    fn apply_transform(&mut self, entity: EntityId, transform: &Transform) {
        self.transforms.insert(entity, *transform);
    }

    fn forget(&mut self, entity: EntityId) {
        self.transforms.remove(&entity);
    }
}
