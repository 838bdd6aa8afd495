use std::net::SocketAddr;

use crate::types::{EntityId, SessionId};

#[derive(Debug, Clone)]
pub enum ServerEvent {
    SessionConnecting {
        addr: SocketAddr,
    },
    SessionConnected {
        session: SessionId,
        addr: SocketAddr,
        player: EntityId,
    },
    SessionDisconnected {
        session: SessionId,
        reason: DisconnectReason,
        /// Entities handed back to the server.
        reclaimed: usize,
    },
    ConnectionDenied {
        addr: SocketAddr,
        reason: String,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Graceful,
    Timeout,
    Kicked,
    TransportFailure,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Graceful => "disconnected",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::Kicked => "kicked",
            DisconnectReason::TransportFailure => "dropped after a transport failure",
        }
    }
}
