//! Wire messages.
//!
//! Both channels carry UTF-8 JSON frames shaped as
//! `{"type": "<snake_case name>", "payload": {...}}`, one message per frame.
//! The relay channel uses [`ClientMessage`] (client to relay) and
//! [`RelayMessage`] (relay to client); the mesh uses [`PeerMessage`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::snapshot::FullStateSnapshot;
use crate::state::{ClimbPhase, HarvestActivity, Identity, OccupancyKind};
use crate::types::{Millis, ObjectId, PeerId, Vec3};

/// Frame size limits.
pub mod limits {
    /// Max bytes accepted in a single frame.
    pub const MAX_FRAME_BYTES: usize = 256 * 1024;
    /// Max entities in one domain-entity batch.
    pub const MAX_ENTITIES_PER_BATCH: usize = 512;
    /// Max peers in one proximity update.
    pub const MAX_NEARBY_PEERS: usize = 256;
}

/// Serialise a message into a text frame.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<String> {
    serde_json::to_string(message).map_err(|e| CoreError::EncodingError(e.to_string()))
}

/// Parse a text frame. Oversized or unparsable frames are `MalformedFrame`.
pub fn decode_frame<T: DeserializeOwned>(text: &str) -> Result<T> {
    if text.len() > limits::MAX_FRAME_BYTES {
        return Err(CoreError::MalformedFrame(format!(
            "frame of {} bytes exceeds limit",
            text.len()
        )));
    }
    serde_json::from_str(text).map_err(|e| CoreError::MalformedFrame(e.to_string()))
}

/// Spatial update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionPayload {
    pub position: Vec3,
    pub rotation: f32,
    /// Sender clock at the time of sampling.
    pub timestamp: Millis,
}

/// Which exclusive role a claim takes on an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimKind {
    Pilot,
    TowCart,
    TowArtillery,
    ManArtillery,
}

impl ClaimKind {
    pub fn occupancy_kind(self) -> OccupancyKind {
        match self {
            ClaimKind::Pilot => OccupancyKind::Vehicle,
            ClaimKind::TowCart => OccupancyKind::Cart,
            ClaimKind::TowArtillery => OccupancyKind::TowedArtillery,
            ClaimKind::ManArtillery => OccupancyKind::MannedArtillery,
        }
    }
}

/// A claim on a shared object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimPayload {
    pub object_id: ObjectId,
    pub kind: ClaimKind,
    pub timestamp: Millis,
}

/// Externally supplied domain entities seeded on a new link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityBatch {
    /// Collaborator-defined entity family, e.g. "workers" or "structures".
    pub kind: String,
    pub entities: Vec<serde_json::Value>,
}

/// Messages exchanged between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PeerMessage {
    /// Who the sender is. Always the first message on a new link.
    Identity(Identity),

    /// Where the sender is heading.
    Position(PositionPayload),

    /// Complete resync of the sender's state.
    FullState(FullStateSnapshot),

    /// The sender takes exclusive occupancy of a shared object.
    Claim(ClaimPayload),

    /// The sender gives up an object it occupied.
    Release { object_id: ObjectId },

    HarvestStart(HarvestActivity),

    HarvestStop {},

    /// Climbing phase changed; `None` means no longer climbing.
    Climb { phase: Option<ClimbPhase> },

    /// The sender died and came back with a new spawn time.
    Respawn { spawn_time: Millis },

    /// Domain entities seeded by the sender.
    EntityBatch(EntityBatch),

    /// The sender is leaving the world.
    Logout {},
}

impl PeerMessage {
    /// Short name used in logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            PeerMessage::Identity(_) => "identity",
            PeerMessage::Position(_) => "position",
            PeerMessage::FullState(_) => "full_state",
            PeerMessage::Claim(_) => "claim",
            PeerMessage::Release { .. } => "release",
            PeerMessage::HarvestStart(_) => "harvest_start",
            PeerMessage::HarvestStop {} => "harvest_stop",
            PeerMessage::Climb { .. } => "climb",
            PeerMessage::Respawn { .. } => "respawn",
            PeerMessage::EntityBatch(_) => "entity_batch",
            PeerMessage::Logout {} => "logout",
        }
    }

    /// Messages applied even before a local representation exists.
    pub fn applies_without_avatar(&self) -> bool {
        matches!(
            self,
            PeerMessage::Identity(_) | PeerMessage::Position(_) | PeerMessage::FullState(_)
        )
    }

    /// Check if this message respects size limits.
    pub fn validate_limits(&self) -> std::result::Result<(), &'static str> {
        if let PeerMessage::EntityBatch(batch) = self {
            if batch.entities.len() > limits::MAX_ENTITIES_PER_BATCH {
                return Err("too many entities in batch");
            }
        }
        Ok(())
    }
}

/// Negotiation signalling carried over the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate {
        candidate: String,
        sdp_mid: Option<String>,
    },
}

/// Relay (TURN) credentials handed out on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCredentials {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// Frames sent by a client to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Mandatory first frame of every relay connection.
    Fingerprint { fingerprint: String },

    Ping {},

    /// Negotiation signal addressed to another peer.
    Signal { to: PeerId, signal: SignalPayload },

    RequestIceCredentials {},

    /// Ask the relay to forward a peer message to everyone nearby.
    Forward { message: PeerMessage },
}

/// Frames sent by the relay to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RelayMessage {
    /// Handshake accepted; carries the identity assigned to this client.
    Welcome { client_id: PeerId },

    /// Handshake or session refused. The reason never leaves the transport.
    Rejected { reason: String },

    Pong {},

    /// Full set of peers currently within proximity.
    Proximity { nearby: Vec<PeerId> },

    Signal { from: PeerId, signal: SignalPayload },

    IceCredentials(IceCredentials),

    PlayerDied { peer_id: PeerId },

    PeerLeft { peer_id: PeerId },

    /// A peer message the relay forwarded on someone's behalf.
    Forward { from: PeerId, message: PeerMessage },
}

impl RelayMessage {
    /// Check if this message respects size limits.
    pub fn validate_limits(&self) -> std::result::Result<(), &'static str> {
        match self {
            RelayMessage::Proximity { nearby } if nearby.len() > limits::MAX_NEARBY_PEERS => {
                Err("too many nearby peers")
            }
            RelayMessage::Forward { message, .. } => message.validate_limits(),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape() {
        let msg = PeerMessage::Release {
            object_id: ObjectId::from("cart-1"),
        };
        let json: serde_json::Value = serde_json::from_str(&encode_frame(&msg).unwrap()).unwrap();
        assert_eq!(json["type"], "release");
        assert_eq!(json["payload"]["object_id"], "cart-1");
    }

    #[test]
    fn test_decode_relay_welcome() {
        let frame = r#"{"type":"welcome","payload":{"client_id":"12"}}"#;
        let msg: RelayMessage = decode_frame(frame).unwrap();
        assert_eq!(
            msg,
            RelayMessage::Welcome {
                client_id: PeerId::from("12")
            }
        );
    }

    #[test]
    fn test_decode_forwarded_peer_message() {
        let frame = r#"{"type":"forward","payload":{"from":"4","message":{"type":"respawn","payload":{"spawn_time":99}}}}"#;
        let msg: RelayMessage = decode_frame(frame).unwrap();
        match msg {
            RelayMessage::Forward { from, message } => {
                assert_eq!(from, PeerId::from("4"));
                assert_eq!(message, PeerMessage::Respawn { spawn_time: 99 });
            }
            other => panic!("expected Forward, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_frame_is_error() {
        let err = decode_frame::<PeerMessage>("{not json").unwrap_err();
        assert!(matches!(err, CoreError::MalformedFrame(_)));

        let unknown = decode_frame::<PeerMessage>(r#"{"type":"teleport","payload":{}}"#);
        assert!(unknown.is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let big = "x".repeat(limits::MAX_FRAME_BYTES + 1);
        assert!(decode_frame::<PeerMessage>(&big).is_err());
    }

    #[test]
    fn test_avatar_independent_subset() {
        assert!(PeerMessage::Position(PositionPayload {
            position: Vec3::default(),
            rotation: 0.0,
            timestamp: 0,
        })
        .applies_without_avatar());
        assert!(!PeerMessage::HarvestStop {}.applies_without_avatar());
    }

    #[test]
    fn test_batch_limit() {
        let msg = PeerMessage::EntityBatch(EntityBatch {
            kind: "workers".into(),
            entities: vec![serde_json::Value::Null; limits::MAX_ENTITIES_PER_BATCH + 1],
        });
        assert!(msg.validate_limits().is_err());
    }
}
