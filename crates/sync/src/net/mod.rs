mod channel;
mod client;
mod events;
mod protocol;
mod route;
mod server;
mod session;
mod stats;
mod transport;
mod wire;

pub use channel::{OrderedReceiver, ReliableSender, SequenceFilter, TransformSequencer};
pub use client::ClientDispatcher;
pub use events::{DisconnectReason, ServerEvent};
pub use protocol::{
    ClientFrame, ClientMessage, DEFAULT_PORT, DEFAULT_TICK_RATE, MAX_PACKET_SIZE, PROTOCOL_MAGIC,
    PROTOCOL_VERSION, Packet, PacketError, PacketHeader, PacketType, SequencedClientMessage,
    SequencedServerMessage, ServerFrame, ServerMessage, SplitFrame, encode_frame,
    sequence_greater_than,
};
pub use route::{Route, route};
pub use server::{ServerDispatcher, ServerStats};
pub use session::{ConnectionState, Session, SessionRegistry};
pub use stats::{NetworkStats, random_salt};
pub use transport::{Outbox, Transport};
pub use wire::{
    WireBlueprint, WireCustom, WireEffect, WireEntity, WireId, WireIntent, WirePatch, WirePlayer,
    WireTransform,
};
