use std::collections::HashSet;

use ferry_core::{BundleId, NodeRole, Timestamp};

use crate::config::RoleProfile;
use crate::store::BundleSummary;
use crate::summary::PeerSummary;

/// Outcome of [`decide`] for one bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Send,
    /// Not sent and not worth offering to this peer again.
    Skip,
    /// Not sent now; remains eligible on a later contact.
    Defer,
}

/// Read-only view of what a peer is believed to hold.
pub trait PeerKnowledge {
    fn knows(&self, id: &BundleId) -> bool;
}

impl PeerKnowledge for HashSet<BundleId> {
    fn knows(&self, id: &BundleId) -> bool {
        self.contains(id)
    }
}

impl PeerKnowledge for PeerSummary {
    fn knows(&self, id: &BundleId) -> bool {
        self.might_hold(id)
    }
}

/// Decides whether `bundle` goes to a requester of `requester_role`.
///
/// Pure: the answer depends only on the arguments.
pub fn decide(
    bundle: &BundleSummary,
    requester_role: NodeRole,
    local: &RoleProfile,
    peer_known: &(impl PeerKnowledge + ?Sized),
    now: Timestamp,
) -> Decision {
    if bundle.is_expired(now) || peer_known.knows(&bundle.id) {
        return Decision::Skip;
    }

    let time_sensitive = local.forward_time_sensitive && bundle.priority.is_time_sensitive();
    if !time_sensitive && !local.forwards_audience(&bundle.audience) {
        return Decision::Skip;
    }

    if !RoleProfile::for_role(requester_role).accepts(bundle.priority) {
        return Decision::Defer;
    }

    Decision::Send
}
