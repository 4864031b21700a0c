use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::store::BundleSummary;

/// Which payload types a subscription wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadTypeFilter {
    Any,
    Exact(String),
    /// Matches every type starting with the prefix.
    Prefix(String),
}

impl PayloadTypeFilter {
    /// `*` matches everything, a trailing `*` is a prefix match.
    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim();
        if pattern.is_empty() || pattern == "*" {
            PayloadTypeFilter::Any
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            PayloadTypeFilter::Prefix(prefix.to_string())
        } else {
            PayloadTypeFilter::Exact(pattern.to_string())
        }
    }

    pub fn matches(&self, payload_type: &str) -> bool {
        match self {
            PayloadTypeFilter::Any => true,
            PayloadTypeFilter::Exact(t) => t == payload_type,
            PayloadTypeFilter::Prefix(p) => payload_type.starts_with(p.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type SubscriptionCallback = Arc<dyn Fn(&BundleSummary) + Send + Sync>;

/// Callbacks fired when a bundle is newly stored.
#[derive(Default)]
pub struct SubscriptionRegistry {
    next_id: AtomicU64,
    entries: RwLock<Vec<(SubscriptionId, PayloadTypeFilter, SubscriptionCallback)>>,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("subscriptions", &self.len())
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        filter: PayloadTypeFilter,
        callback: impl Fn(&BundleSummary) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, filter, Arc::new(callback)));
        id
    }

    /// Returns true when the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(sid, _, _)| *sid != id);
        entries.len() != before
    }

    /// Fires matching callbacks. They run outside the registry lock, so a
    /// callback may subscribe or unsubscribe.
    pub fn notify(&self, bundle: &BundleSummary) -> usize {
        let matching: Vec<SubscriptionCallback> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, filter, _)| filter.matches(&bundle.payload_type))
            .map(|(_, _, cb)| Arc::clone(cb))
            .collect();
        for callback in &matching {
            callback(bundle);
        }
        matching.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
