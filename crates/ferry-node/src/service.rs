use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ferry_codec::{seal_bundle, Bundle, BundleDraft, CodecError};
use ferry_core::{BundleId, Clock, Priority, PublicKey};
use ferry_crypto::signing::{Ed25519Verifier, Signer};
use ferry_transport::{Connection, Dialer, LinkError};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{NodeConfig, SharedConfig};
use crate::eviction::{EvictionEngine, EvictionReport};
use crate::ingress::{IngestOutcome, Ingress, RejectReason};
use crate::session::{Session, SessionContext, SessionReport, Side};
use crate::store::{BundleFilter, BundleStore, BundleSummary, StoreError, StoreStats};
use crate::subscriptions::{PayloadTypeFilter, SubscriptionId, SubscriptionRegistry};
use crate::sweeper::{ExpirySweeper, SweepReport};

/// Payload type of the periodic topic index published by access points.
pub const INDEX_PAYLOAD_TYPE: &str = "index";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("bundle rejected: {0}")]
    Codec(#[from] CodecError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("bundle refused at ingress: {0}")]
    Rejected(RejectReason),
    #[error("index summary: {0}")]
    Index(#[from] serde_json::Error),
}

/// Everything a caller supplies to publish one bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub payload: Vec<u8>,
    pub payload_type: String,
    pub priority: Priority,
    pub ttl: Duration,
    pub topic: String,
    pub tags: Vec<String>,
    pub audience: String,
}

impl PublishRequest {
    /// Public audience, no topic or tags.
    pub fn new(
        payload_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        priority: Priority,
        ttl: Duration,
    ) -> Self {
        Self {
            payload: payload.into(),
            payload_type: payload_type.into(),
            priority,
            ttl,
            topic: String::new(),
            tags: Vec::new(),
            audience: "public".into(),
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = audience.into();
        self
    }
}

/// Handles for the background sweeper, eviction and index tasks.
#[derive(Debug)]
pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Signals every task and waits for them to stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(err) = handle.await {
                warn!("background task ended abnormally: {err}");
            }
        }
    }
}

/// Publish/subscribe façade over the store, sweeper, eviction engine and
/// reconciliation sessions. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Relay {
    store: Arc<BundleStore>,
    config: SharedConfig,
    signer: Arc<dyn Signer>,
    clock: Arc<dyn Clock>,
    subscriptions: Arc<SubscriptionRegistry>,
    eviction: Arc<EvictionEngine>,
    sweeper: Arc<ExpirySweeper>,
    ingress: Arc<Ingress>,
}

impl Relay {
    /// Wires the components and records the active configuration in the store.
    pub fn new(
        store: Arc<BundleStore>,
        config: NodeConfig,
        signer: Arc<dyn Signer>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        store.save_config_record(&config, clock.now())?;
        let config = SharedConfig::new(config);
        let subscriptions = Arc::new(SubscriptionRegistry::new());
        let eviction = Arc::new(EvictionEngine::new());
        let ingress = Arc::new(Ingress::new(
            Arc::clone(&store),
            Arc::clone(&subscriptions),
            Arc::clone(&eviction),
            config.clone(),
            Arc::new(Ed25519Verifier),
        ));
        Ok(Self {
            store,
            config,
            signer,
            clock,
            subscriptions,
            eviction,
            sweeper: Arc::new(ExpirySweeper::new()),
            ingress,
        })
    }

    pub fn node_id(&self) -> PublicKey {
        self.signer.public_key()
    }

    pub fn config(&self) -> Arc<NodeConfig> {
        self.config.snapshot()
    }

    pub fn store(&self) -> &Arc<BundleStore> {
        &self.store
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        self.store.stats()
    }

    /// Signs and stores a new bundle; it becomes eligible for forwarding at
    /// once. Publishing identical content twice in the same second yields the
    /// same id and one stored copy.
    pub fn publish(&self, request: PublishRequest) -> Result<BundleId, PublishError> {
        let now = self.clock.now();
        let draft = BundleDraft::new(
            request.payload_type,
            request.payload,
            request.priority,
            now,
            request.ttl,
        )
        .with_topic(request.topic)
        .with_tags(request.tags)
        .with_audience(request.audience);
        let bundle = seal_bundle(draft, &*self.signer)?;
        match self.ingress.ingest_bundle(&bundle, now)? {
            IngestOutcome::Stored(_) | IngestOutcome::Duplicate(_) => {
                info!(
                    bundle_id = %bundle.id.short(),
                    priority = %bundle.priority,
                    payload_type = %bundle.payload_type,
                    "bundle published"
                );
                Ok(bundle.id)
            }
            IngestOutcome::Rejected(reason) => Err(PublishError::Rejected(reason)),
        }
    }

    /// Fires `callback` for every newly stored bundle matching `filter`,
    /// published locally or delivered by a peer.
    pub fn subscribe(
        &self,
        filter: PayloadTypeFilter,
        callback: impl Fn(&BundleSummary) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.subscriptions.subscribe(filter, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.unsubscribe(id)
    }

    /// Read-only listing; never touches payloads or access counters.
    pub fn query(&self, filter: &BundleFilter) -> Result<Vec<BundleSummary>, StoreError> {
        self.store.list(filter)
    }

    /// Full bundle by id. Counts as an access for hot-content retention.
    pub fn get(&self, id: &BundleId) -> Result<Option<Bundle>, StoreError> {
        let bundle = self.store.get(id)?;
        if bundle.is_some() {
            self.store.note_access(&[*id])?;
        }
        Ok(bundle)
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            store: Arc::clone(&self.store),
            ingress: Arc::clone(&self.ingress),
            config: self.config.clone(),
            clock: Arc::clone(&self.clock),
            node_id: self.node_id(),
        }
    }

    /// Runs a session on a link we opened.
    pub async fn sync_with<C: Connection>(&self, conn: C) -> SessionReport {
        Session::new(self.session_context(), conn, Side::Initiator)
            .run()
            .await
    }

    /// Runs a session on a link a peer opened.
    pub async fn accept<C: Connection>(&self, conn: C) -> SessionReport {
        Session::new(self.session_context(), conn, Side::Responder)
            .run()
            .await
    }

    /// Dials `addr` and syncs with whatever answers.
    pub async fn connect_and_sync<D: Dialer>(
        &self,
        dialer: &D,
        addr: &str,
    ) -> Result<SessionReport, LinkError> {
        let conn = dialer.connect(addr).await?;
        Ok(self.sync_with(conn).await)
    }

    /// Runs a responder session as its own task.
    pub fn spawn_session<C: Connection + 'static>(&self, conn: C) -> JoinHandle<SessionReport> {
        let relay = self.clone();
        tokio::spawn(async move { relay.accept(conn).await })
    }

    pub fn sweep_now(&self) -> Result<Option<SweepReport>, StoreError> {
        self.sweeper.sweep(&self.store, self.clock.now())
    }

    pub fn enforce_budget_now(&self) -> Result<Option<EvictionReport>, StoreError> {
        self.eviction
            .enforce(&self.store, &self.config.snapshot(), self.clock.now())
    }

    /// Swaps in a whole new configuration. Running sessions keep the value
    /// they started with.
    pub fn reload_config(&self, config: NodeConfig) -> Result<(), StoreError> {
        self.store.save_config_record(&config, self.clock.now())?;
        let previous = self.config.replace(config);
        let current = self.config.snapshot();
        info!(
            from = %previous.role(),
            to = %current.role(),
            budget = current.profile.cache_budget.max_bytes,
            "configuration reloaded"
        );
        self.eviction.request();
        Ok(())
    }

    /// Publishes a topic -> bundle count index of live content.
    pub fn publish_index_summary(&self) -> Result<BundleId, PublishError> {
        let now = self.clock.now();
        let live = self.store.list(&BundleFilter::default().alive_at(now))?;
        let mut topics: BTreeMap<&str, u64> = BTreeMap::new();
        for bundle in live.iter().filter(|b| b.payload_type != INDEX_PAYLOAD_TYPE) {
            *topics.entry(bundle.topic.as_str()).or_default() += 1;
        }
        let payload = serde_json::to_vec(&topics)?;
        let interval = self
            .config
            .snapshot()
            .profile
            .index_interval
            .unwrap_or(Duration::from_secs(600));
        self.publish(
            PublishRequest::new(INDEX_PAYLOAD_TYPE, payload, Priority::Normal, interval * 2)
                .with_topic(INDEX_PAYLOAD_TYPE),
        )
    }

    /// Starts the sweeper, the eviction engine and, for roles that publish
    /// them, the index summary task.
    pub fn start_background(&self) -> BackgroundTasks {
        let (tx, rx) = watch::channel(false);
        let mut handles = vec![
            Arc::clone(&self.sweeper).spawn(
                Arc::clone(&self.store),
                self.config.clone(),
                Arc::clone(&self.clock),
                rx.clone(),
            ),
            Arc::clone(&self.eviction).spawn(
                Arc::clone(&self.store),
                self.config.clone(),
                Arc::clone(&self.clock),
                rx.clone(),
            ),
        ];
        handles.push(self.spawn_index_task(rx));
        BackgroundTasks {
            shutdown: tx,
            handles,
        }
    }

    fn spawn_index_task(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let relay = self.clone();
        tokio::spawn(async move {
            loop {
                let snapshot = relay.config.snapshot();
                let (wait, publish) = match snapshot.profile.index_interval {
                    Some(interval) => (interval, true),
                    None => (snapshot.sweep_interval, false),
                };
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                if !publish {
                    continue;
                }
                match relay.publish_index_summary() {
                    Ok(id) => debug!(bundle_id = %id.short(), "index summary published"),
                    Err(err) => warn!("index summary failed: {err}"),
                }
            }
        })
    }
}
