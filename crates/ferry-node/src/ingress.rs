use std::fmt;
use std::sync::Arc;

use ferry_codec::bundle::decode_bundle_cbor;
use ferry_codec::{verify_bundle, Bundle, CodecError};
use ferry_core::{BundleId, Timestamp};
use ferry_crypto::signing::Verifier;
use tracing::{debug, warn};

use crate::config::SharedConfig;
use crate::eviction::EvictionEngine;
use crate::store::{BundleStore, BundleSummary, PutOutcome, StoreError};
use crate::subscriptions::SubscriptionRegistry;

/// Why an inbound bundle was dropped at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    CorruptEnvelope,
    IdMismatch,
    SignatureInvalid,
    Expired,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RejectReason::CorruptEnvelope => "corrupt envelope",
            RejectReason::IdMismatch => "content id mismatch",
            RejectReason::SignatureInvalid => "invalid signature",
            RejectReason::Expired => "already expired",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Newly stored; subscribers were notified.
    Stored(BundleSummary),
    Duplicate(BundleId),
    Rejected(RejectReason),
}

/// decode, verify, expiry check, atomic put, then notify and schedule
/// eviction. Shared by local publish and peer delivery.
pub struct Ingress {
    store: Arc<BundleStore>,
    subscriptions: Arc<SubscriptionRegistry>,
    eviction: Arc<EvictionEngine>,
    config: SharedConfig,
    verifier: Arc<dyn Verifier>,
}

impl fmt::Debug for Ingress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ingress").finish_non_exhaustive()
    }
}

impl Ingress {
    pub fn new(
        store: Arc<BundleStore>,
        subscriptions: Arc<SubscriptionRegistry>,
        eviction: Arc<EvictionEngine>,
        config: SharedConfig,
        verifier: Arc<dyn Verifier>,
    ) -> Self {
        Self {
            store,
            subscriptions,
            eviction,
            config,
            verifier,
        }
    }

    /// Ingests raw wire bytes from a peer.
    pub fn ingest_envelope(
        &self,
        bytes: &[u8],
        now: Timestamp,
    ) -> Result<IngestOutcome, StoreError> {
        match decode_bundle_cbor(bytes) {
            Ok(bundle) => self.ingest_bundle(&bundle, now),
            Err(err) => {
                warn!(bytes = bytes.len(), "dropping corrupt envelope: {err}");
                Ok(IngestOutcome::Rejected(RejectReason::CorruptEnvelope))
            }
        }
    }

    pub fn ingest_bundle(
        &self,
        bundle: &Bundle,
        now: Timestamp,
    ) -> Result<IngestOutcome, StoreError> {
        if let Err(err) = verify_bundle(bundle, &*self.verifier) {
            let reason = match err {
                CodecError::IdMismatch => RejectReason::IdMismatch,
                CodecError::SignatureInvalid => RejectReason::SignatureInvalid,
                _ => RejectReason::CorruptEnvelope,
            };
            warn!(bundle_id = %bundle.id.short(), %reason, "dropping bundle");
            return Ok(IngestOutcome::Rejected(reason));
        }
        if bundle.is_expired(now) {
            debug!(bundle_id = %bundle.id.short(), "dropping expired bundle");
            return Ok(IngestOutcome::Rejected(RejectReason::Expired));
        }

        match self.store.put(bundle, now)? {
            PutOutcome::DuplicateSkipped => Ok(IngestOutcome::Duplicate(bundle.id)),
            PutOutcome::Inserted => {
                let summary = match self.store.summary(&bundle.id)? {
                    Some(summary) => summary,
                    // Evicted or swept between the insert and this read.
                    None => return Ok(IngestOutcome::Duplicate(bundle.id)),
                };
                self.subscriptions.notify(&summary);
                let stats = self.store.stats()?;
                let budget = self.config.snapshot().profile.cache_budget;
                if budget.is_exceeded(stats.total_bytes, stats.bundle_count) {
                    self.eviction.request();
                }
                Ok(IngestOutcome::Stored(summary))
            }
        }
    }
}
