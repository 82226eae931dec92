//! Wire protocol for the commander/field-node link.
//!
//! Every message is one JSON object terminated by `\n`:
//!
//! ```text
//! {"kind":"START_RECORDING","timestamp":1718000000000,"senderId":"…","payload":{"delayMs":750}}
//! ```
//!
//! The receiver decodes exactly one record per line. A line that fails to
//! decode is dropped on its own; the connection carries on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::NodeId;
use crate::membership::DeviceStatus;
use crate::transport::ProtocolHint;

/// Errors produced while decoding an inbound record.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The line held nothing but whitespace.
    #[error("empty record")]
    Empty,

    /// The line exceeded the configured frame limit.
    #[error("record of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Bytes read before giving up.
        len: usize,
        /// The configured limit.
        max: usize,
    },

    /// The line was not a valid control message.
    #[error("malformed record: {0}")]
    Json(#[from] serde_json::Error),
}

/// What a control message asks of its receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// First message a field node sends after connecting.
    Handshake,
    /// Commander timestamp broadcast used for clock offset estimation.
    Sync,
    /// Begin recording after `payload.delayMs`.
    StartRecording,
    /// Stop recording now.
    StopRecording,
    /// Periodic liveness signal.
    Heartbeat,
    /// Out-of-band status update from a field node.
    Telemetry,
    /// A downscaled viewfinder image from a field node.
    PreviewFrame,
    /// Application-level command with no protocol meaning.
    GenericCommand,
}

impl MessageKind {
    /// Kinds that create or refresh a device record on the commander.
    #[must_use]
    pub fn refreshes_membership(self) -> bool {
        matches!(self, Self::Handshake | Self::Telemetry | Self::Heartbeat)
    }

    /// Kinds whose timestamp is used as a clock offset sample.
    #[must_use]
    pub fn is_clock_sample(self) -> bool {
        matches!(self, Self::Sync | Self::Heartbeat)
    }

    /// Start and stop commands. Only a commander issues these.
    #[must_use]
    pub fn is_trigger(self) -> bool {
        matches!(self, Self::StartRecording | Self::StopRecording)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Handshake => "handshake",
            Self::Sync => "sync",
            Self::StartRecording => "start_recording",
            Self::StopRecording => "stop_recording",
            Self::Heartbeat => "heartbeat",
            Self::Telemetry => "telemetry",
            Self::PreviewFrame => "preview_frame",
            Self::GenericCommand => "generic_command",
        };
        f.write_str(name)
    }
}

/// Kind-specific message data. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    /// Lead time for `StartRecording`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,

    /// Human-readable device name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Device status as reported by the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DeviceStatus>,

    /// Active lens label, e.g. `"0.5x"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lens: Option<String>,

    /// Encoded preview image (opaque to this crate).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_image: Option<String>,

    /// Transport hint the sender connected with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<ProtocolHint>,

    /// Command name for `GenericCommand`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Free-form command arguments for `GenericCommand`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Payload {
    /// Payload for `StartRecording`.
    #[must_use]
    pub fn start(delay_ms: u64) -> Self {
        Self {
            delay_ms: Some(delay_ms),
            ..Self::default()
        }
    }

    /// Payload describing a device, used by handshakes, heartbeats and telemetry.
    #[must_use]
    pub fn device(name: impl Into<String>, status: DeviceStatus, lens: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            status: Some(status),
            lens: Some(lens.into()),
            ..Self::default()
        }
    }

    /// Payload for `GenericCommand`.
    #[must_use]
    pub fn command(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            command: Some(name.into()),
            data: Some(data),
            ..Self::default()
        }
    }

    /// Attach the transport hint.
    #[must_use]
    pub fn with_protocol(mut self, hint: ProtocolHint) -> Self {
        self.protocol = Some(hint);
        self
    }

    /// Attach a preview image.
    #[must_use]
    pub fn with_preview(mut self, image: impl Into<String>) -> Self {
        self.preview_image = Some(image.into());
        self
    }
}

/// The unit of communication between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    /// What this message asks for.
    pub kind: MessageKind,

    /// Sender's local clock at send time, milliseconds since the Unix epoch.
    pub timestamp: i64,

    /// Identity of the sending node.
    pub sender_id: NodeId,

    /// Kind-specific data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

impl ControlMessage {
    /// Create a new message.
    #[must_use]
    pub fn new(kind: MessageKind, sender_id: NodeId, timestamp: i64, payload: Option<Payload>) -> Self {
        Self {
            kind,
            timestamp,
            sender_id,
            payload,
        }
    }

    /// The payload, or an empty one.
    #[must_use]
    pub fn payload_or_default(&self) -> Payload {
        self.payload.clone().unwrap_or_default()
    }

    /// The `delayMs` carried by a start command, if any.
    #[must_use]
    pub fn delay_ms(&self) -> Option<u64> {
        self.payload.as_ref().and_then(|p| p.delay_ms)
    }

    /// Encode as one newline-terminated record.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }

    /// Decode one record. Surrounding whitespace, including the line
    /// terminator, is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Empty`] for a blank line and
    /// [`DecodeError::Json`] for anything that is not a control message.
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        let trimmed = trim_ascii(frame);
        if trimmed.is_empty() {
            return Err(DecodeError::Empty);
        }
        Ok(serde_json::from_slice(trimmed)?)
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}
