//! Wire messages exchanged between DHT peers.
//!
//! A single tagged [`Message`] type carries every request and response; the
//! `type` field selects the operation and the optional fields carry its
//! payload. Replies reuse the request message with fields attached, so a
//! handler typically mutates the decoded request and writes it back.
//!
//! The frame payload encoding is JSON; the framing itself (varint length
//! prefixes) lives in [`crate::framing`]. The only property the DHT core
//! relies on is round-trip fidelity.

use serde::{Deserialize, Serialize};

use crate::host::PeerInfo;
use crate::Error;

/// Operation selector for [`Message`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    PutValue,
    GetValue,
    AddProvider,
    GetProviders,
    FindNode,
    Ping,
}

/// Reachability of a peer as judged by the sender of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Connectedness {
    NotConnected,
    Connected,
    CanConnect,
    CannotConnect,
}

/// A key/value record with a textual expiry, as carried on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Expiry as a decimal unix-seconds string.
    pub expiry: String,
}

/// A peer reference attached to a message, with the sender's judgement of
/// its reachability.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePeer {
    pub info: PeerInfo,
    pub connectedness: Connectedness,
}

/// The single request/response message of the DHT protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closer_peers: Option<Vec<MessagePeer>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_peers: Option<Vec<MessagePeer>>,
}

/// Format a record expiry `ttl` from now as a decimal unix-seconds string.
pub(crate) fn unix_expiry_string(ttl: std::time::Duration) -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    (SystemTime::now() + ttl)
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        .to_string()
}

impl Message {
    /// A bare request of the given type for `key`.
    pub fn request(message_type: MessageType, key: Vec<u8>) -> Self {
        Self {
            message_type,
            key,
            record: None,
            closer_peers: None,
            provider_peers: None,
        }
    }

    /// Drop everything but the type. Used for the Ping echo.
    pub fn clear_body(&mut self) {
        self.key.clear();
        self.record = None;
        self.closer_peers = None;
        self.provider_peers = None;
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self).map_err(|e| Error::WireError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(bytes).map_err(|e| Error::WireError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PeerId;

    fn sample_peer(byte: u8) -> MessagePeer {
        MessagePeer {
            info: PeerInfo {
                id: PeerId::from_bytes(vec![byte; 4]),
                addresses: vec![format!("/memory/{byte}")],
            },
            connectedness: Connectedness::CanConnect,
        }
    }

    #[test]
    fn message_round_trips_through_codec() {
        let msg = Message {
            message_type: MessageType::GetValue,
            key: b"dog".to_vec(),
            record: Some(Record {
                key: b"dog".to_vec(),
                value: vec![9],
                expiry: "1735689600".to_owned(),
            }),
            closer_peers: Some(vec![sample_peer(1), sample_peer(2)]),
            provider_peers: Some(vec![sample_peer(3)]),
        };

        let decoded = Message::decode(&msg.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn bare_request_round_trips() {
        for message_type in [
            MessageType::PutValue,
            MessageType::GetValue,
            MessageType::AddProvider,
            MessageType::GetProviders,
            MessageType::FindNode,
            MessageType::Ping,
        ] {
            let msg = Message::request(message_type, b"k".to_vec());
            let decoded = Message::decode(&msg.encode().expect("encode")).expect("decode");
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn clear_body_keeps_only_the_type() {
        let mut msg = Message {
            message_type: MessageType::Ping,
            key: b"junk".to_vec(),
            record: None,
            closer_peers: Some(vec![sample_peer(7)]),
            provider_peers: None,
        };
        msg.clear_body();
        assert_eq!(msg, Message::request(MessageType::Ping, Vec::new()));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            Message::decode(b"not json at all"),
            Err(Error::WireError(_))
        ));
    }
}
