use std::net::SocketAddr;

use crate::types::{EntityId, SessionId};

/// Failure of a single intent. None of these variants may tear down the
/// replication loop or an unrelated session.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error("invalid intent: {0}")]
    Validation(String),
    #[error("{session} may not author entity {entity}")]
    Authority { entity: EntityId, session: SessionId },
    #[error("entity {0} not found")]
    NotFound(EntityId),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SyncError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }
}

/// Connection level failure. Surfaces to session lifecycle only.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("outbound queue to {0} is full")]
    QueueFull(SocketAddr),
    #[error("connection to {0} closed")]
    Closed(SocketAddr),
    #[error("packet of {0} bytes exceeds MTU")]
    Oversized(usize),
}

pub type SyncResult<T> = Result<T, SyncError>;
