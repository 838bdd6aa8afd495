use rkyv::util::AlignedVec;
use rkyv::{rancor, Archive, Deserialize, Serialize};

use super::wire::{WireBlueprint, WireEntity, WireId, WireIntent, WirePatch, WireTransform};

pub const MAX_PACKET_SIZE: usize = 1200;
pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_MAGIC: u32 = 0x5753594E;
pub const DEFAULT_PORT: u16 = 27015;
pub const DEFAULT_TICK_RATE: u32 = 30;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct PacketHeader {
    pub magic: u32,
    pub version: u32,
    pub sequence: u32,
    /// Newest packet sequence received from the peer.
    pub ack: u32,
}

impl PacketHeader {
    pub fn new(sequence: u32, ack: u32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            sequence,
            ack,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }
}

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum PacketType {
    ConnectionRequest {
        client_salt: u64,
    },
    ConnectionChallenge {
        server_salt: u64,
        challenge: u64,
    },
    ChallengeResponse {
        combined_salt: u64,
    },
    ConnectionAccepted {
        session_id: u32,
        player_id: WireId,
        tick: u32,
    },
    ConnectionDenied {
        reason: String,
    },
    ServerFrame(ServerFrame),
    ClientFrame(ClientFrame),
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
    Disconnect,
}

/// Messages the server pushes to a session.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum ServerMessage {
    BlueprintPublished(WireBlueprint),
    EntityAdd(WireEntity),
    OwnerChanged {
        id: WireId,
        owner: u32,
    },
    /// Reliable field changes: health, effect, movement flags, custom data.
    EntityModified {
        id: WireId,
        patch: WirePatch,
    },
    PlayerTeleport {
        id: WireId,
        position: [f32; 3],
        rotation: [f32; 4],
    },
    /// Best-effort transform patch. Older `seq` values lose.
    EntityModify {
        id: WireId,
        seq: u32,
        patch: WirePatch,
    },
    EntityRemove {
        id: WireId,
    },
    /// An intent on an entity this session authors, relayed by the server.
    Forwarded {
        origin: u32,
        intent: WireIntent,
    },
    Rejected {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum ClientMessage {
    Intent(WireIntent),
    TransformUpdate {
        id: WireId,
        seq: u32,
        transform: WireTransform,
    },
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct SequencedServerMessage {
    pub seq: u32,
    pub message: ServerMessage,
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct SequencedClientMessage {
    pub seq: u32,
    pub message: ClientMessage,
}

/// One tick's worth of traffic towards a client. `reliable_ack` is the highest
/// contiguous client reliable sequence the server has delivered.
#[derive(Debug, Clone, Default, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ServerFrame {
    pub tick: u32,
    pub reliable_ack: u32,
    pub reliable: Vec<SequencedServerMessage>,
    pub unreliable: Vec<ServerMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ClientFrame {
    pub reliable_ack: u32,
    pub reliable: Vec<SequencedClientMessage>,
    pub unreliable: Vec<ClientMessage>,
}

/// Frames that can be halved when they do not fit in one datagram.
pub trait SplitFrame: Sized {
    fn message_count(&self) -> usize;
    fn split(self) -> (Self, Self);
    fn into_payload(self) -> PacketType;
}

impl SplitFrame for ServerFrame {
    fn message_count(&self) -> usize {
        self.reliable.len() + self.unreliable.len()
    }

    fn split(mut self) -> (Self, Self) {
        let (reliable, unreliable) = split_lists(&mut self.reliable, &mut self.unreliable);
        let tail = Self {
            tick: self.tick,
            reliable_ack: self.reliable_ack,
            reliable,
            unreliable,
        };
        (self, tail)
    }

    fn into_payload(self) -> PacketType {
        PacketType::ServerFrame(self)
    }
}

impl SplitFrame for ClientFrame {
    fn message_count(&self) -> usize {
        self.reliable.len() + self.unreliable.len()
    }

    fn split(mut self) -> (Self, Self) {
        let (reliable, unreliable) = split_lists(&mut self.reliable, &mut self.unreliable);
        let tail = Self {
            reliable_ack: self.reliable_ack,
            reliable,
            unreliable,
        };
        (self, tail)
    }

    fn into_payload(self) -> PacketType {
        PacketType::ClientFrame(self)
    }
}

/// Moves the second half of the combined message list out. Reliable messages
/// come first so their relative order is kept across the halves.
fn split_lists<R, U>(reliable: &mut Vec<R>, unreliable: &mut Vec<U>) -> (Vec<R>, Vec<U>) {
    let half = (reliable.len() + unreliable.len()) / 2;
    if half < reliable.len() {
        (reliable.split_off(half), std::mem::take(unreliable))
    } else {
        let keep = half - reliable.len();
        (Vec::new(), unreliable.split_off(keep))
    }
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: PacketType,
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("bad protocol header")]
    BadHeader,
}

impl Packet {
    pub fn new(header: PacketHeader, payload: PacketType) -> Self {
        Self { header, payload }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(PacketError::Serialize)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        // Datagram buffers carry no alignment guarantee.
        let mut aligned = AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);
        let packet = rkyv::from_bytes::<Self, rancor::Error>(&aligned)
            .map_err(PacketError::Deserialize)?;
        if !packet.header.is_valid() {
            return Err(PacketError::BadHeader);
        }
        Ok(packet)
    }
}

/// Serializes `frame`, halving it until every piece fits in `max_size`.
/// A single message larger than `max_size` is still emitted on its own.
pub fn encode_frame<F: SplitFrame + Clone>(
    frame: F,
    sequence: &mut u32,
    ack: u32,
    max_size: usize,
) -> Result<Vec<Vec<u8>>, PacketError> {
    let packet = Packet::new(PacketHeader::new(*sequence, ack), frame.clone().into_payload());
    let bytes = packet.serialize()?;

    if bytes.len() <= max_size || frame.message_count() <= 1 {
        if bytes.len() > max_size {
            log::warn!(
                "single message of {} bytes exceeds packet limit {}",
                bytes.len(),
                max_size
            );
        }
        *sequence = sequence.wrapping_add(1);
        return Ok(vec![bytes]);
    }

    let (head, tail) = frame.split();
    let mut out = encode_frame(head, sequence, ack, max_size)?;
    out.extend(encode_frame(tail, sequence, ack, max_size)?);
    Ok(out)
}
