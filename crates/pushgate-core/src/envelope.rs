//! The outbound wire envelope and its two codecs.
//!
//! Every frame the gateway pushes to a client carries an [`Envelope`]:
//! a delivery id (0 for unreliable sends) and the opaque payload. The
//! encoding is negotiated per connection at handshake time:
//!
//! - **JSON**: `{"sid": <i64>, "msg": "<base64>"}` — payload bytes are
//!   base64-encoded so arbitrary binary survives the text encoding.
//! - **Compact binary**: 8-byte little-endian `sid` followed by the raw
//!   payload bytes, no framing of its own (the transport frames it).
//!
//! Both codecs round-trip both fields unchanged.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::errors::{GatewayError, Result};

/// Byte length of the binary envelope header (the delivery id).
const BINARY_HEADER_LEN: usize = 8;

/// Payload encoding negotiated per connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// JSON object with base64 payload.
    Json,
    /// Fixed-header compact binary.
    Binary,
}

/// WebSocket frame kind used for outbound writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    /// Text frames (UTF-8; only valid with [`Encoding::Json`]).
    Text,
    /// Binary frames.
    Binary,
}

/// One unit of outbound delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Reliable-delivery id; 0 when the send is unreliable.
    pub delivery_id: i64,
    /// Opaque application payload.
    pub payload: Bytes,
}

/// JSON wire shape. Field names are the wire contract; do not rename.
#[derive(Serialize, Deserialize)]
struct JsonEnvelope {
    sid: i64,
    msg: String,
}

impl Envelope {
    /// Build an envelope. `delivery_id` of 0 marks an unreliable send.
    pub fn new(delivery_id: i64, payload: Bytes) -> Self {
        Self {
            delivery_id,
            payload,
        }
    }

    /// Serialize under the negotiated encoding.
    pub fn encode(&self, encoding: Encoding) -> Result<Bytes> {
        match encoding {
            Encoding::Json => {
                let wire = JsonEnvelope {
                    sid: self.delivery_id,
                    msg: BASE64.encode(&self.payload),
                };
                Ok(Bytes::from(serde_json::to_vec(&wire)?))
            }
            Encoding::Binary => {
                let mut buf = BytesMut::with_capacity(BINARY_HEADER_LEN + self.payload.len());
                buf.put_i64_le(self.delivery_id);
                buf.extend_from_slice(&self.payload);
                Ok(buf.freeze())
            }
        }
    }

    /// Deserialize under the negotiated encoding.
    pub fn decode(raw: &[u8], encoding: Encoding) -> Result<Self> {
        match encoding {
            Encoding::Json => {
                let wire: JsonEnvelope = serde_json::from_slice(raw)
                    .map_err(|e| GatewayError::Decode(e.to_string()))?;
                let payload = BASE64
                    .decode(&wire.msg)
                    .map_err(|e| GatewayError::Decode(format!("invalid base64 payload: {e}")))?;
                Ok(Self::new(wire.sid, Bytes::from(payload)))
            }
            Encoding::Binary => {
                if raw.len() < BINARY_HEADER_LEN {
                    return Err(GatewayError::Decode(format!(
                        "binary envelope truncated: {} byte(s), need at least {BINARY_HEADER_LEN}",
                        raw.len()
                    )));
                }
                let mut buf = Bytes::copy_from_slice(raw);
                let sid = buf.get_i64_le();
                Ok(Self::new(sid, buf))
            }
        }
    }
}
