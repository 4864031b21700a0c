#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use ferry_codec::{seal_bundle, Bundle, BundleDraft};
use ferry_core::{BundleId, ManualClock, NodeRole, Priority, Timestamp};
use ferry_crypto::signing::Ed25519Signer;
use ferry_node::{BundleFilter, BundleStore, NodeConfig, Relay, SessionReport};
use ferry_transport::memory_pair;

pub const START: Timestamp = Timestamp(1_700_000_000);
pub const HOUR: Duration = Duration::from_secs(3_600);

pub fn relay(role: NodeRole, key: u8, clock: &ManualClock) -> Relay {
    relay_with(NodeConfig::for_role(role), key, clock)
}

pub fn relay_with(config: NodeConfig, key: u8, clock: &ManualClock) -> Relay {
    Relay::new(
        Arc::new(BundleStore::open_in_memory().expect("store")),
        config,
        Arc::new(Ed25519Signer::from_secret([key; 32])),
        Arc::new(clock.clone()),
    )
    .expect("relay")
}

/// One session with `a` dialing `b`.
pub async fn sync(a: &Relay, b: &Relay) -> (SessionReport, SessionReport) {
    let (left, right) = memory_pair("a", "b");
    tokio::join!(a.sync_with(left), b.accept(right))
}

pub fn ids(relay: &Relay) -> BTreeSet<BundleId> {
    relay
        .query(&BundleFilter::default())
        .expect("query")
        .into_iter()
        .map(|s| s.id)
        .collect()
}

/// A bundle signed by a key that is not any test node.
pub fn foreign_bundle(text: &str, priority: Priority, created: Timestamp, ttl: Duration) -> Bundle {
    let signer = Ed25519Signer::from_secret([0xEE; 32]);
    let draft = BundleDraft::new("note", text.as_bytes().to_vec(), priority, created, ttl)
        .with_audience("public");
    seal_bundle(draft, &signer).expect("seal")
}

/// Deterministic pseudo-random stream for property-style loops.
pub fn xorshift64(state: &mut u64) -> u64 {
    *state ^= *state << 13;
    *state ^= *state >> 7;
    *state ^= *state << 17;
    *state
}
