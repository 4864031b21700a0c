use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use ferry_core::{NodeRole, Priority};
use serde::{Deserialize, Serialize};

/// Storage budget consulted by every eviction decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheBudget {
    /// Upper bound on summed envelope bytes.
    pub max_bytes: u64,
    /// Optional upper bound on stored bundle count.
    pub max_bundles: Option<u64>,
}

impl CacheBudget {
    pub fn bytes(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            max_bundles: None,
        }
    }

    pub fn is_exceeded(&self, total_bytes: u64, bundle_count: u64) -> bool {
        total_bytes > self.max_bytes || self.max_bundles.is_some_and(|max| bundle_count > max)
    }
}

/// Immutable per-role behaviour consumed by forwarding and eviction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleProfile {
    pub role: NodeRole,
    pub cache_budget: CacheBudget,
    /// Keep per-peer cursors in the store across sessions and restarts.
    pub persist_cursors: bool,
    /// Audiences this node relays; empty relays every audience.
    pub forward_audiences: Vec<String>,
    /// Relay emergency/perishable bundles regardless of audience.
    pub forward_time_sensitive: bool,
    /// Priorities this role wants to receive when it is the requester.
    pub accepted_priorities: Vec<Priority>,
    /// Bundles sent per session before the rest are deferred.
    pub max_bundles_per_session: usize,
    /// Access count at which a bundle counts as hot.
    pub hot_access_threshold: u64,
    /// Within a priority class, send most-requested bundles first.
    pub serve_hot_first: bool,
    /// Cadence for publishing index summaries, when this role publishes them.
    pub index_interval: Option<Duration>,
}

const MIB: u64 = 1024 * 1024;

impl RoleProfile {
    /// Built-in profile for `role`.
    pub fn for_role(role: NodeRole) -> Self {
        match role {
            NodeRole::Citizen => Self {
                role,
                cache_budget: CacheBudget {
                    max_bytes: 16 * MIB,
                    max_bundles: Some(4_000),
                },
                persist_cursors: role.is_persistent(),
                forward_audiences: vec!["public".into(), "local".into()],
                forward_time_sensitive: true,
                accepted_priorities: vec![Priority::Emergency, Priority::Perishable, Priority::Normal],
                max_bundles_per_session: 256,
                hot_access_threshold: 8,
                serve_hot_first: false,
                index_interval: None,
            },
            NodeRole::Bridge => Self {
                role,
                cache_budget: CacheBudget::bytes(256 * MIB),
                persist_cursors: role.is_persistent(),
                forward_audiences: Vec::new(),
                forward_time_sensitive: true,
                accepted_priorities: Priority::ALL.to_vec(),
                max_bundles_per_session: 10_000,
                hot_access_threshold: 8,
                serve_hot_first: false,
                index_interval: None,
            },
            NodeRole::AccessPoint => Self {
                role,
                cache_budget: CacheBudget::bytes(512 * MIB),
                persist_cursors: role.is_persistent(),
                forward_audiences: Vec::new(),
                forward_time_sensitive: true,
                accepted_priorities: Priority::ALL.to_vec(),
                max_bundles_per_session: 4_000,
                hot_access_threshold: 16,
                serve_hot_first: false,
                index_interval: Some(Duration::from_secs(10 * 60)),
            },
            NodeRole::Library => Self {
                role,
                cache_budget: CacheBudget::bytes(4_096 * MIB),
                persist_cursors: role.is_persistent(),
                forward_audiences: Vec::new(),
                forward_time_sensitive: true,
                accepted_priorities: Priority::ALL.to_vec(),
                max_bundles_per_session: 10_000,
                hot_access_threshold: 4,
                serve_hot_first: true,
                index_interval: None,
            },
        }
    }

    pub fn accepts(&self, priority: Priority) -> bool {
        self.accepted_priorities.contains(&priority)
    }

    pub fn forwards_audience(&self, audience: &str) -> bool {
        self.forward_audiences.is_empty() || self.forward_audiences.iter().any(|a| a == audience)
    }
}

/// Full node configuration. Replaced as a whole on reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub profile: RoleProfile,
    pub sweep_interval: Duration,
    /// Sessions with no peer frame for this long are cancelled.
    pub session_idle_timeout: Duration,
    /// Stores above this many bundles summarise with a bloom filter.
    pub full_list_threshold: usize,
    pub bloom_false_positive_rate: f64,
    /// Perishable bundles expiring within this window are retained longest.
    pub perishable_protect_window: Duration,
}

impl NodeConfig {
    pub fn for_role(role: NodeRole) -> Self {
        Self {
            profile: RoleProfile::for_role(role),
            sweep_interval: Duration::from_secs(5 * 60),
            session_idle_timeout: Duration::from_secs(30),
            full_list_threshold: 2_048,
            bloom_false_positive_rate: 0.01,
            perishable_protect_window: Duration::from_secs(48 * 3600),
        }
    }

    pub fn with_budget(mut self, budget: CacheBudget) -> Self {
        self.profile.cache_budget = budget;
        self
    }

    pub fn role(&self) -> NodeRole {
        self.profile.role
    }
}

/// Hot-swappable configuration handle. Readers always see a whole value.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    current: Arc<RwLock<Arc<NodeConfig>>>,
}

impl SharedConfig {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Current configuration value.
    pub fn snapshot(&self) -> Arc<NodeConfig> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Swaps in `config`, returning the previous value.
    pub fn replace(&self, config: NodeConfig) -> Arc<NodeConfig> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, Arc::new(config))
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheBudget, NodeConfig, RoleProfile, SharedConfig};
    use ferry_core::{NodeRole, Priority};

    #[test]
    fn budget_checks_bytes_and_optional_count() {
        let budget = CacheBudget {
            max_bytes: 100,
            max_bundles: Some(3),
        };
        assert!(!budget.is_exceeded(100, 3));
        assert!(budget.is_exceeded(101, 1));
        assert!(budget.is_exceeded(10, 4));
        assert!(!CacheBudget::bytes(100).is_exceeded(50, 1_000_000));
    }

    #[test]
    fn role_budgets_grow_from_citizen_to_library() {
        let bytes = |r| RoleProfile::for_role(r).cache_budget.max_bytes;
        assert!(bytes(NodeRole::Citizen) < bytes(NodeRole::Bridge));
        assert!(bytes(NodeRole::Bridge) < bytes(NodeRole::AccessPoint));
        assert!(bytes(NodeRole::AccessPoint) < bytes(NodeRole::Library));
    }

    #[test]
    fn citizen_profile_is_narrow() {
        let citizen = RoleProfile::for_role(NodeRole::Citizen);
        assert!(!citizen.persist_cursors);
        assert!(citizen.forwards_audience("public"));
        assert!(!citizen.forwards_audience("coop-members"));
        assert!(!citizen.accepts(Priority::Low));

        let bridge = RoleProfile::for_role(NodeRole::Bridge);
        assert!(bridge.persist_cursors);
        assert!(bridge.forwards_audience("coop-members"));
        assert!(bridge.accepts(Priority::Low));
    }

    #[test]
    fn only_citizens_forget_peers_between_sessions() {
        for role in [NodeRole::Citizen, NodeRole::Bridge, NodeRole::AccessPoint, NodeRole::Library] {
            let profile = RoleProfile::for_role(role);
            assert_eq!(profile.persist_cursors, role != NodeRole::Citizen, "{role}");
        }
    }

    #[test]
    fn only_access_points_publish_index_summaries_by_default() {
        assert!(RoleProfile::for_role(NodeRole::AccessPoint)
            .index_interval
            .is_some());
        assert!(RoleProfile::for_role(NodeRole::Library)
            .index_interval
            .is_none());
        assert!(RoleProfile::for_role(NodeRole::Library).serve_hot_first);
    }

    #[test]
    fn shared_config_swaps_whole_value() {
        let shared = SharedConfig::new(NodeConfig::for_role(NodeRole::Citizen));
        let before = shared.snapshot();
        let previous = shared.replace(NodeConfig::for_role(NodeRole::Library));
        assert_eq!(previous.role(), NodeRole::Citizen);
        assert_eq!(before.role(), NodeRole::Citizen);
        assert_eq!(shared.clone().snapshot().role(), NodeRole::Library);
    }

    #[test]
    fn config_record_serialises_as_json() {
        let cfg = NodeConfig::for_role(NodeRole::Bridge).with_budget(CacheBudget::bytes(42));
        let json = serde_json::to_string(&cfg).expect("serialize");
        let back: NodeConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, cfg);
    }
}
