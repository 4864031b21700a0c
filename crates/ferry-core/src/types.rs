use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::FerryError;

/// Raw 32-byte Ed25519 public key of a bundle author or node.
pub type PublicKey = [u8; 32];

/// 32-byte content hash identifying a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BundleId(pub [u8; 32]);

impl BundleId {
    /// Lowercase 64-character hex rendering used on the wire.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a 64-character hex id.
    pub fn from_hex(value: &str) -> Result<Self, FerryError> {
        if value.len() != 64 {
            return Err(FerryError::Decode("bundle id must be 64 hex chars"));
        }
        let mut out = [0_u8; 32];
        hex::decode_to_slice(value, &mut out)
            .map_err(|_| FerryError::Decode("bundle id is not valid hex"))?;
        Ok(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for BundleId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for BundleId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = serde_bytes::ByteBuf::deserialize(deserializer)?;
        if raw.len() != 32 {
            return Err(serde::de::Error::invalid_length(
                raw.len(),
                &"exactly 32 bytes",
            ));
        }
        let mut bytes = [0_u8; 32];
        bytes.copy_from_slice(&raw);
        Ok(Self(bytes))
    }
}

/// Bundle priority class, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Emergency,
    Perishable,
    Normal,
    Low,
}

impl Priority {
    /// All classes in transmission order.
    pub const ALL: [Priority; 4] = [
        Priority::Emergency,
        Priority::Perishable,
        Priority::Normal,
        Priority::Low,
    ];

    /// Wire string for this class.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Emergency => "emergency",
            Priority::Perishable => "perishable",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    /// Transmission rank; lower ranks cross the link first.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Emergency => 0,
            Priority::Perishable => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    pub fn from_rank(rank: u8) -> Option<Self> {
        Self::ALL.get(rank as usize).copied()
    }

    /// Emergency and perishable bundles lose value with delay.
    pub fn is_time_sensitive(&self) -> bool {
        matches!(self, Priority::Emergency | Priority::Perishable)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = FerryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "emergency" => Ok(Priority::Emergency),
            "perishable" => Ok(Priority::Perishable),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(FerryError::UnknownVariant {
                kind: "priority",
                value: other.to_string(),
            }),
        }
    }
}

/// Deployment role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    /// Lightweight handheld node.
    #[serde(alias = "lightweight")]
    Citizen,
    /// Courier carrying bundles between disconnected segments.
    Bridge,
    /// Fixed access point.
    AccessPoint,
    /// Long-lived archive node.
    Library,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Citizen => "citizen",
            NodeRole::Bridge => "bridge",
            NodeRole::AccessPoint => "access-point",
            NodeRole::Library => "library",
        }
    }

    /// Roles that keep per-peer cursors across restarts.
    pub fn is_persistent(&self) -> bool {
        !matches!(self, NodeRole::Citizen)
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = FerryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "citizen" | "lightweight" => Ok(NodeRole::Citizen),
            "bridge" => Ok(NodeRole::Bridge),
            "access-point" | "access_point" | "ap" => Ok(NodeRole::AccessPoint),
            "library" => Ok(NodeRole::Library),
            other => Err(FerryError::UnknownVariant {
                kind: "role",
                value: other.to_string(),
            }),
        }
    }
}

/// UTC wall-clock instant in whole seconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn as_secs(&self) -> u64 {
        self.0
    }

    pub fn saturating_add(&self, ttl: Duration) -> Self {
        Self(self.0.saturating_add(ttl.as_secs()))
    }

    pub fn saturating_sub(&self, d: Duration) -> Self {
        Self(self.0.saturating_sub(d.as_secs()))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.0)
    }
}
