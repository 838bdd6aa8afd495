mod patch;
mod record;
mod store;

pub use patch::{ChangeMask, EntityPatch};
pub use record::{Entity, EntityKind, EntitySpec, MAX_HEALTH, MovementFlags, PlayerState};
pub use store::{EntityEvent, EntityObserver, EntityStore, StoreChange};
