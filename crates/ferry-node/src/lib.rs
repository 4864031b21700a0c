//! Ferry node layer: bundle store, expiry sweeper, eviction engine,
//! forwarding policy, peer reconciliation sessions, and the
//! publish/subscribe façade tying them together.

pub mod bloom;
pub mod config;
pub mod eviction;
pub mod flight;
pub mod forwarding;
pub mod ingress;
pub mod service;
pub mod session;
pub mod store;
pub mod subscriptions;
pub mod summary;
pub mod sweeper;
pub mod wire;

pub use config::{CacheBudget, NodeConfig, RoleProfile, SharedConfig};
pub use eviction::{EvictionEngine, EvictionReport};
pub use forwarding::{decide, Decision, PeerKnowledge};
pub use ingress::{IngestOutcome, Ingress, RejectReason};
pub use service::{BackgroundTasks, PublishError, PublishRequest, Relay, INDEX_PAYLOAD_TYPE};
pub use session::{Session, SessionContext, SessionError, SessionOutcome, SessionReport, Side};
pub use store::{
    BundleFilter, BundleStore, BundleSummary, ListOrder, PeerCursor, PutOutcome, RetentionTier,
    StoreError, StoreStats,
};
pub use subscriptions::{PayloadTypeFilter, SubscriptionId};
pub use sweeper::{ExpirySweeper, SweepReport};
