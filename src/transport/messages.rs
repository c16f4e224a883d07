use serde::{Deserialize, Serialize};

/// Messages framed over the relay connection.
///
/// JSON text frames; audio payloads are base64-encoded container bytes. The
/// relay preserves per-connection order, which is the only sequencing the
/// protocol relies on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    /// One per session, always before that session's chunks
    Header {
        mime_type: String,
        #[serde(with = "b64")]
        data: Vec<u8>,
        /// Unix milliseconds when the sending session started
        start_time: i64,
    },

    /// One or more container chunks, order-preserving
    Stream {
        #[serde(with = "b64_seq")]
        chunks: Vec<Vec<u8>>,
    },

    /// Keepalive probe (client to relay)
    Ping,

    /// Keepalive response (relay to client)
    Pong,

    /// Relay-side failure surfaced to error subscribers
    Error { message: String },
}

/// Lifecycle and payload events surfaced by a transport connection
#[derive(Debug)]
pub enum TransportEvent {
    /// Handshake completed (also after a successful reconnect)
    Opened,
    /// Connection dropped; `retrying` is false for clean client-side closes
    Closed { retrying: bool },
    /// Reconnect attempts exhausted or handshake rejected; terminal until
    /// the next explicit connect
    Failed(String),
    /// An inbound relay message
    Message(RelayMessage),
}

mod b64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(de)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

mod b64_seq {
    use base64::Engine;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(chunks: &[Vec<u8>], ser: S) -> Result<S::Ok, S::Error> {
        let mut seq = ser.serialize_seq(Some(chunks.len()))?;
        for chunk in chunks {
            seq.serialize_element(&base64::engine::general_purpose::STANDARD.encode(chunk))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<Vec<u8>>, D::Error> {
        let encoded = Vec::<String>::deserialize(de)?;
        encoded
            .into_iter()
            .map(|s| {
                base64::engine::general_purpose::STANDARD
                    .decode(s)
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
