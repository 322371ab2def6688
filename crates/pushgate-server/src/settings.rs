//! Gateway configuration.
//!
//! The core consumes configuration, it does not load it: callers hand a
//! validated [`GatewaySettings`] to [`crate::Gateway::new`]. Compiled
//! defaults are usable as-is; `validate()` rejects combinations the engine
//! cannot honor (a zero shard count, or binary-encoded payloads forced into
//! text frames).

use pushgate_core::{Encoding, FrameKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Invalid configuration handed to the gateway.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    /// `shard_count` must be at least 1; it is fixed for the process lifetime.
    #[error("shard_count must be at least 1")]
    ZeroShards,

    /// Per-connection outbound queues need room for at least one envelope.
    #[error("client_buffer_size must be at least 1")]
    ZeroClientBuffer,

    /// Binary envelopes are not valid UTF-8 and cannot ride text frames.
    #[error("binary encoding requires binary frames")]
    BinaryEncodingInTextFrame,
}

/// Externally supplied gateway configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    /// Number of registry shards. Fixed at startup; never resharded online.
    pub shard_count: usize,
    /// Initial capacity hint for each shard's token map.
    pub bucket_capacity_hint: usize,
    /// Per-connection outbound queue capacity, in envelopes.
    pub client_buffer_size: usize,
    /// Maximum accepted inbound message size, in bytes.
    pub read_buffer_size: usize,
    /// WebSocket write buffer size, in bytes.
    pub write_buffer_size: usize,
    /// Envelope encoding negotiated for every connection.
    pub encoding: Encoding,
    /// WebSocket frame kind used for outbound writes.
    pub frame_kind: FrameKind,
    /// Seconds between online-counter flushes by the monitor task.
    pub flush_interval_secs: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            shard_count: 4,
            bucket_capacity_hint: 1024,
            client_buffer_size: 32,
            read_buffer_size: 64 * 1024,
            write_buffer_size: 64 * 1024,
            encoding: Encoding::Json,
            frame_kind: FrameKind::Text,
            flush_interval_secs: 10,
        }
    }
}

impl GatewaySettings {
    /// Reject configurations the engine cannot honor.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.shard_count == 0 {
            return Err(SettingsError::ZeroShards);
        }
        if self.client_buffer_size == 0 {
            return Err(SettingsError::ZeroClientBuffer);
        }
        if self.encoding == Encoding::Binary && self.frame_kind == FrameKind::Text {
            return Err(SettingsError::BinaryEncodingInTextFrame);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert_eq!(GatewaySettings::default().validate(), Ok(()));
    }

    #[test]
    fn zero_shards_rejected() {
        let settings = GatewaySettings {
            shard_count: 0,
            ..Default::default()
        };
        assert_eq!(settings.validate(), Err(SettingsError::ZeroShards));
    }

    #[test]
    fn zero_client_buffer_rejected() {
        let settings = GatewaySettings {
            client_buffer_size: 0,
            ..Default::default()
        };
        assert_eq!(settings.validate(), Err(SettingsError::ZeroClientBuffer));
    }

    #[test]
    fn binary_encoding_requires_binary_frames() {
        let settings = GatewaySettings {
            encoding: Encoding::Binary,
            frame_kind: FrameKind::Text,
            ..Default::default()
        };
        assert_eq!(
            settings.validate(),
            Err(SettingsError::BinaryEncodingInTextFrame)
        );

        let settings = GatewaySettings {
            encoding: Encoding::Binary,
            frame_kind: FrameKind::Binary,
            ..Default::default()
        };
        assert_eq!(settings.validate(), Ok(()));
    }

    #[test]
    fn settings_deserialize_from_camel_case_json() {
        let raw = r#"{"shardCount": 8, "clientBufferSize": 64, "encoding": "binary", "frameKind": "binary"}"#;
        let settings: GatewaySettings = serde_json::from_str(raw).unwrap();
        assert_eq!(settings.shard_count, 8);
        assert_eq!(settings.client_buffer_size, 64);
        assert_eq!(settings.encoding, Encoding::Binary);
        // Unspecified fields fall back to defaults.
        assert_eq!(settings.flush_interval_secs, 10);
        assert_eq!(settings.validate(), Ok(()));
    }
}
