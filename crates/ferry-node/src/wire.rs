use ferry_core::NodeRole;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::summary::SummaryEnvelope;

/// Session protocol revision carried in `Hello`.
pub const PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to encode frame: {0}")]
    Encode(String),
    #[error("undecodable frame: {0}")]
    Decode(String),
}

/// Identity and capabilities sent once by each side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub protocol: u16,
    /// Hex node public key; the key peer cursors are stored under.
    pub node_id: String,
    pub role: NodeRole,
    pub summary_versions: Vec<u16>,
    pub bundle_count: u64,
}

/// One message on a reconciliation link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frame {
    Hello(Hello),
    /// Requester's view of what it holds.
    Summary(SummaryEnvelope),
    /// Summary version refused; the requester retries with one of these.
    SummaryUnsupported { supported: Vec<u16> },
    /// One bundle wire envelope.
    Bundle(#[serde(with = "serde_bytes")] Vec<u8>),
    /// Responder finished serving a summary.
    BatchEnd { sent: u64, deferred: u64 },
    Close,
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello(_) => "hello",
            Frame::Summary(_) => "summary",
            Frame::SummaryUnsupported { .. } => "summary_unsupported",
            Frame::Bundle(_) => "bundle",
            Frame::BatchEnd { .. } => "batch_end",
            Frame::Close => "close",
        }
    }
}

pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(frame, &mut out).map_err(|e| WireError::Encode(e.to_string()))?;
    Ok(out)
}

pub fn decode_frame(bytes: &[u8]) -> Result<Frame, WireError> {
    ciborium::de::from_reader(bytes).map_err(|e| WireError::Decode(e.to_string()))
}
