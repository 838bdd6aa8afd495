//! Authoritative world replication: entities, blueprints, ownership and
//! effects kept in sync between one server and many clients over UDP.

pub mod authority;
pub mod blueprint;
pub mod config;
pub mod effect;
pub mod entity;
pub mod error;
pub mod intent;
pub mod net;
pub mod replication;
pub mod spatial;
pub mod timestep;
pub mod types;
pub mod world;

pub use authority::{AuthorityResolver, OwnerChange};
pub use blueprint::{Blueprint, BlueprintDraft, BlueprintRegistry};
pub use config::WorldConfig;
pub use effect::{EffectEnd, EffectHandle, EffectMachine, EffectRecord, EndReason, OnEffectEnd};
pub use entity::{
    ChangeMask, Entity, EntityEvent, EntityKind, EntityObserver, EntityPatch, EntitySpec,
    EntityStore, MAX_HEALTH, MovementFlags, PlayerState, StoreChange,
};
pub use error::{SyncError, SyncResult, TransportError};
pub use intent::{Intent, IntentClass};
pub use net::{
    ClientDispatcher, ConnectionState, DEFAULT_PORT, DEFAULT_TICK_RATE, DisconnectReason,
    MAX_PACKET_SIZE, NetworkStats, Outbox, Packet, PacketError, PacketType, Route,
    ServerDispatcher, ServerEvent, ServerStats, Session, SessionRegistry, Transport,
};
pub use replication::{ReplicationStats, Replicator};
pub use spatial::{SpatialSystem, TransformCache};
pub use timestep::FixedTimestep;
pub use types::{BlueprintId, CustomData, DataValue, EntityId, Owner, Role, SessionId, Transform};
pub use world::{World, WorldChanges};
