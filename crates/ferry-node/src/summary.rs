use std::collections::HashSet;

use ferry_core::BundleId;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bloom::BloomFilter;

/// Full list of held ids.
pub const SUMMARY_ID_LIST_V1: u16 = 1;
/// Salted bloom filter over held ids.
pub const SUMMARY_BLOOM_V1: u16 = 2;
/// Summary encodings this build understands, preferred last.
pub const SUPPORTED_SUMMARY_VERSIONS: [u16; 2] = [SUMMARY_ID_LIST_V1, SUMMARY_BLOOM_V1];

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("unsupported summary version {0}")]
    UnsupportedVersion(u16),
    #[error("malformed summary body: {0}")]
    Malformed(String),
    #[error("failed to encode summary: {0}")]
    Encode(String),
}

/// Versioned summary as carried in a `Summary` frame. The body is opaque
/// until the version is known, so unknown versions can be refused cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryEnvelope {
    pub version: u16,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

/// What a requester claims to already hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerSummary {
    IdList(HashSet<BundleId>),
    Bloom(BloomFilter),
}

impl PeerSummary {
    pub fn version(&self) -> u16 {
        match self {
            PeerSummary::IdList(_) => SUMMARY_ID_LIST_V1,
            PeerSummary::Bloom(_) => SUMMARY_BLOOM_V1,
        }
    }

    /// True when the requester holds (or, for bloom, may hold) `id`.
    pub fn might_hold(&self, id: &BundleId) -> bool {
        match self {
            PeerSummary::IdList(ids) => ids.contains(id),
            PeerSummary::Bloom(filter) => filter.might_contain(id),
        }
    }

    /// Exact ids, when the summary carries them.
    pub fn listed_ids(&self) -> Option<&HashSet<BundleId>> {
        match self {
            PeerSummary::IdList(ids) => Some(ids),
            PeerSummary::Bloom(_) => None,
        }
    }

    pub fn encode(&self) -> Result<SummaryEnvelope, SummaryError> {
        let mut body = Vec::new();
        let written = match self {
            PeerSummary::IdList(ids) => {
                let mut sorted: Vec<&BundleId> = ids.iter().collect();
                sorted.sort();
                ciborium::ser::into_writer(&sorted, &mut body)
            }
            PeerSummary::Bloom(filter) => ciborium::ser::into_writer(filter, &mut body),
        };
        written.map_err(|e| SummaryError::Encode(e.to_string()))?;
        Ok(SummaryEnvelope {
            version: self.version(),
            body,
        })
    }

    pub fn decode(envelope: &SummaryEnvelope) -> Result<Self, SummaryError> {
        match envelope.version {
            SUMMARY_ID_LIST_V1 => {
                let ids: Vec<BundleId> = ciborium::de::from_reader(envelope.body.as_slice())
                    .map_err(|e| SummaryError::Malformed(e.to_string()))?;
                Ok(PeerSummary::IdList(ids.into_iter().collect()))
            }
            SUMMARY_BLOOM_V1 => {
                let filter: BloomFilter = ciborium::de::from_reader(envelope.body.as_slice())
                    .map_err(|e| SummaryError::Malformed(e.to_string()))?;
                if !filter.is_well_formed() {
                    return Err(SummaryError::Malformed("bloom length mismatch".into()));
                }
                Ok(PeerSummary::Bloom(filter))
            }
            other => Err(SummaryError::UnsupportedVersion(other)),
        }
    }
}

/// Picks the summary for `ids`: a bloom filter when the peer understands it
/// and the store is larger than `full_list_threshold`, the full list otherwise.
pub fn build_summary(
    ids: &[BundleId],
    peer_versions: &[u16],
    full_list_threshold: usize,
    false_positive_rate: f64,
) -> PeerSummary {
    if ids.len() > full_list_threshold && peer_versions.contains(&SUMMARY_BLOOM_V1) {
        let mut salt = [0_u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        PeerSummary::Bloom(BloomFilter::from_ids(
            ids,
            ids.len(),
            false_positive_rate,
            salt,
        ))
    } else {
        PeerSummary::IdList(ids.iter().copied().collect())
    }
}
