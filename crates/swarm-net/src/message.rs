//! Typed message envelopes.
//!
//! A message is a `(kind, sender, payload)` triple. Kinds are stable
//! wire tokens (`chunk.lock`, `raft.append_entries`, ...); payloads are
//! bincode-encoded structs imposed and extracted by type.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

use swarm_common::{PeerId, SwarmError, SwarmResult};

/// Wire token of the generic acknowledgement response.
pub const ACK: &str = "hub.ack";
/// Wire token of the generic decline response.
pub const DECLINE: &str = "hub.decline";
/// Wire token of the peer-discovery announcement.
pub const DISCOVERY: &str = "hub.discovery";

/// A typed request or response between peers.
#[derive(Clone)]
pub struct Message {
    kind: String,
    sender: PeerId,
    payload: Bytes,
}

impl Message {
    /// Creates a message of `kind` carrying a serialized payload.
    #[must_use]
    pub fn impose<T: Serialize>(kind: &str, sender: PeerId, payload: &T) -> Self {
        let bytes = bincode::serialize(payload)
            .expect("bincode serialization of an owned RPC payload cannot fail");
        Self {
            kind: kind.to_string(),
            sender,
            payload: Bytes::from(bytes),
        }
    }

    /// Creates a payload-less message of `kind`.
    #[must_use]
    pub fn empty(kind: &str, sender: PeerId) -> Self {
        Self {
            kind: kind.to_string(),
            sender,
            payload: Bytes::new(),
        }
    }

    /// Creates the generic acknowledgement response.
    #[must_use]
    pub fn ack(sender: PeerId) -> Self {
        Self::empty(ACK, sender)
    }

    /// Creates the generic decline response.
    #[must_use]
    pub fn decline(sender: PeerId) -> Self {
        Self::empty(DECLINE, sender)
    }

    /// Deserializes the payload as `T`.
    pub fn extract<T: DeserializeOwned>(&self) -> SwarmResult<T> {
        bincode::deserialize(&self.payload).map_err(|e| {
            SwarmError::corruption(format!("bad {} payload: {}", self.kind, e))
        })
    }

    /// Returns the message kind token.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Returns the sending peer.
    #[must_use]
    pub fn sender(&self) -> &PeerId {
        &self.sender
    }

    /// Returns the raw payload bytes.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Returns true if this is the generic acknowledgement.
    #[must_use]
    pub fn is_ack(&self) -> bool {
        self.kind == ACK
    }

    /// Returns true if this is the generic decline.
    #[must_use]
    pub fn is_decline(&self) -> bool {
        self.kind == DECLINE
    }

    /// Returns true if the message has the given kind.
    #[must_use]
    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind == kind
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message({} from {}, {} bytes)",
            self.kind,
            self.sender,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        n: u32,
        text: String,
    }

    fn peer() -> PeerId {
        PeerId::new("127.0.0.1:1")
    }

    #[test]
    fn test_impose_extract_roundtrip() {
        let probe = Probe {
            n: 9,
            text: "hi".into(),
        };
        let message = Message::impose("test.probe", peer(), &probe);
        assert!(message.is_kind("test.probe"));
        assert_eq!(message.extract::<Probe>().unwrap(), probe);
    }

    #[test]
    fn test_extract_wrong_type_fails() {
        let message = Message::impose("test.probe", peer(), &42u8);
        assert!(message.extract::<Probe>().is_err());
    }

    #[test]
    fn test_ack_decline() {
        assert!(Message::ack(peer()).is_ack());
        assert!(Message::decline(peer()).is_decline());
        assert!(!Message::ack(peer()).is_decline());
    }
}
