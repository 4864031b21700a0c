use std::sync::Arc;
use std::time::Duration;

use ferry_core::{BundleId, Clock, NodeRole, PublicKey};
use ferry_transport::{Connection, LinkError, LinkStats};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{NodeConfig, SharedConfig};
use crate::forwarding::{decide, Decision};
use crate::ingress::{IngestOutcome, Ingress};
use crate::store::{BundleFilter, BundleStore, ListOrder, StoreError};
use crate::summary::{
    build_summary, PeerSummary, SummaryError, SUMMARY_ID_LIST_V1, SUPPORTED_SUMMARY_VERSIONS,
};
use crate::wire::{decode_frame, encode_frame, Frame, Hello, WireError, PROTOCOL_VERSION};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("peer idle for {0:?}")]
    Timeout(Duration),
    #[error("peer closed the link")]
    PeerClosed,
    #[error("link: {0}")]
    Link(#[from] LinkError),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("wire: {0}")]
    Wire(#[from] WireError),
    #[error("summary: {0}")]
    Summary(#[from] SummaryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Handshaking,
    Exchanging,
    Closed,
}

/// Which end opened the link. The initiator requests first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionOutcome {
    #[default]
    Completed,
    TimedOut,
    LinkLost,
    Failed,
}

/// Counters for one session, logged when it closes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    /// Peer node id (hex) once the handshake succeeded.
    pub peer: Option<String>,
    pub peer_role: Option<NodeRole>,
    pub sent: u64,
    pub received: u64,
    pub stored: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub corrupt_frames: u64,
    pub deferred: u64,
    pub skipped: u64,
    pub outcome: SessionOutcome,
    /// Frame and byte counters of the underlying link.
    pub link: LinkStats,
}

/// Shared handles a session needs; cheap to clone.
#[derive(Clone)]
pub struct SessionContext {
    pub store: Arc<BundleStore>,
    pub ingress: Arc<Ingress>,
    pub config: SharedConfig,
    pub clock: Arc<dyn Clock>,
    pub node_id: PublicKey,
}

/// One reconciliation session over one link.
///
/// The configuration is snapshotted when the session starts; a reload during
/// the session applies from the next one.
pub struct Session<C: Connection> {
    ctx: SessionContext,
    conn: C,
    side: Side,
    state: SessionState,
    config: Arc<NodeConfig>,
    peer: Option<Hello>,
    report: SessionReport,
    received_ids: Vec<BundleId>,
    delivered_ids: Vec<BundleId>,
    peer_listed: Vec<BundleId>,
}

impl<C: Connection> Session<C> {
    pub fn new(ctx: SessionContext, conn: C, side: Side) -> Self {
        let config = ctx.config.snapshot();
        Self {
            ctx,
            conn,
            side,
            state: SessionState::Disconnected,
            config,
            peer: None,
            report: SessionReport::default(),
            received_ids: Vec::new(),
            delivered_ids: Vec::new(),
            peer_listed: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drives the session to `Closed` and reports what happened. Link loss,
    /// timeouts and protocol errors all end here; none of them propagate.
    pub async fn run(mut self) -> SessionReport {
        let result = match self.side {
            Side::Initiator => self.run_initiator().await,
            Side::Responder => self.run_responder().await,
        };
        self.report.outcome = match &result {
            Ok(()) => SessionOutcome::Completed,
            Err(SessionError::Timeout(_)) => SessionOutcome::TimedOut,
            Err(SessionError::PeerClosed | SessionError::Link(_)) => SessionOutcome::LinkLost,
            Err(_) => SessionOutcome::Failed,
        };
        if let Err(err) = &result {
            warn!(peer = %self.conn.peer_label(), "session ended early: {err}");
        }
        self.close(result.is_ok()).await;
        self.report
    }

    async fn run_initiator(&mut self) -> Result<(), SessionError> {
        self.state = SessionState::Handshaking;
        let hello = self.hello()?;
        self.send(&Frame::Hello(hello)).await?;
        let peer = self.expect_hello().await?;
        self.accept_peer(peer)?;
        self.state = SessionState::Exchanging;
        self.request_missing().await?;
        self.serve_missing().await?;
        self.send(&Frame::Close).await
    }

    async fn run_responder(&mut self) -> Result<(), SessionError> {
        self.state = SessionState::Handshaking;
        let peer = self.expect_hello().await?;
        let hello = self.hello()?;
        self.send(&Frame::Hello(hello)).await?;
        self.accept_peer(peer)?;
        self.state = SessionState::Exchanging;
        self.serve_missing().await?;
        self.request_missing().await?;
        match self.recv_frame().await? {
            None | Some(Ok(Frame::Close)) => Ok(()),
            Some(Ok(other)) => Err(SessionError::Protocol(format!(
                "expected close, got {}",
                other.kind()
            ))),
            Some(Err(err)) => Err(err.into()),
        }
    }

    fn hello(&self) -> Result<Hello, SessionError> {
        Ok(Hello {
            protocol: PROTOCOL_VERSION,
            node_id: hex::encode(self.ctx.node_id),
            role: self.config.role(),
            summary_versions: SUPPORTED_SUMMARY_VERSIONS.to_vec(),
            bundle_count: self.ctx.store.stats()?.bundle_count,
        })
    }

    async fn expect_hello(&mut self) -> Result<Hello, SessionError> {
        match self.expect_frame().await? {
            Frame::Hello(hello) => Ok(hello),
            other => Err(SessionError::Protocol(format!(
                "expected hello, got {}",
                other.kind()
            ))),
        }
    }

    fn accept_peer(&mut self, peer: Hello) -> Result<(), SessionError> {
        if peer.protocol != PROTOCOL_VERSION {
            return Err(SessionError::Protocol(format!(
                "unsupported protocol {}",
                peer.protocol
            )));
        }
        if peer.node_id == hex::encode(self.ctx.node_id) {
            return Err(SessionError::Protocol("peer is this node".into()));
        }
        debug!(
            peer = %self.conn.peer_label(),
            node_id = %peer.node_id,
            role = %peer.role,
            bundles = peer.bundle_count,
            "handshake complete"
        );
        self.report.peer = Some(peer.node_id.clone());
        self.report.peer_role = Some(peer.role);
        self.peer = Some(peer);
        Ok(())
    }

    fn peer_hello(&self) -> Result<&Hello, SessionError> {
        self.peer
            .as_ref()
            .ok_or_else(|| SessionError::Protocol("exchange before handshake".into()))
    }

    /// Sends our summary and ingests bundles until the peer's `BatchEnd`.
    async fn request_missing(&mut self) -> Result<(), SessionError> {
        let held = self.ctx.store.ids()?;
        let peer_versions = self.peer_hello()?.summary_versions.clone();
        let summary = build_summary(
            &held,
            &peer_versions,
            self.config.full_list_threshold,
            self.config.bloom_false_positive_rate,
        );
        self.send(&Frame::Summary(summary.encode()?)).await?;
        let mut fell_back = false;

        loop {
            let frame = match self.recv_frame().await? {
                None => return Err(SessionError::PeerClosed),
                Some(Ok(frame)) => frame,
                Some(Err(err)) => {
                    self.report.corrupt_frames += 1;
                    warn!(peer = %self.conn.peer_label(), "dropping undecodable frame: {err}");
                    continue;
                }
            };
            match frame {
                Frame::Bundle(bytes) => self.ingest(&bytes)?,
                Frame::BatchEnd { sent, deferred } => {
                    debug!(peer = %self.conn.peer_label(), sent, deferred, "peer batch complete");
                    return Ok(());
                }
                Frame::SummaryUnsupported { supported }
                    if !fell_back && supported.contains(&SUMMARY_ID_LIST_V1) =>
                {
                    debug!(peer = %self.conn.peer_label(), "falling back to full id list");
                    fell_back = true;
                    let list = PeerSummary::IdList(held.iter().copied().collect());
                    self.send(&Frame::Summary(list.encode()?)).await?;
                }
                other => {
                    return Err(SessionError::Protocol(format!(
                        "unexpected {} while receiving bundles",
                        other.kind()
                    )))
                }
            }
        }
    }

    fn ingest(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        self.report.received += 1;
        match self.ctx.ingress.ingest_envelope(bytes, self.ctx.clock.now())? {
            IngestOutcome::Stored(summary) => {
                self.report.stored += 1;
                self.received_ids.push(summary.id);
            }
            IngestOutcome::Duplicate(id) => {
                self.report.duplicates += 1;
                self.received_ids.push(id);
            }
            IngestOutcome::Rejected(_) => self.report.rejected += 1,
        }
        Ok(())
    }

    /// Waits for the peer's summary and sends what it lacks, highest
    /// priority first, then `BatchEnd`.
    async fn serve_missing(&mut self) -> Result<(), SessionError> {
        let summary = loop {
            match self.expect_frame().await? {
                Frame::Summary(envelope) => match PeerSummary::decode(&envelope) {
                    Ok(summary) => break summary,
                    Err(SummaryError::UnsupportedVersion(version)) => {
                        debug!(peer = %self.conn.peer_label(), version, "refusing summary version");
                        self.send(&Frame::SummaryUnsupported {
                            supported: SUPPORTED_SUMMARY_VERSIONS.to_vec(),
                        })
                        .await?;
                    }
                    Err(err) => return Err(err.into()),
                },
                other => {
                    return Err(SessionError::Protocol(format!(
                        "expected summary, got {}",
                        other.kind()
                    )))
                }
            }
        };
        if let Some(listed) = summary.listed_ids() {
            self.peer_listed = listed.iter().copied().collect();
        }

        let (peer_id, peer_role) = {
            let hello = self.peer_hello()?;
            (hello.node_id.clone(), hello.role)
        };
        let config = Arc::clone(&self.config);
        let profile = &config.profile;
        let mut filter = BundleFilter::default()
            .alive_at(self.ctx.clock.now())
            .ordered(ListOrder::Transmission {
                hot_first: profile.serve_hot_first,
            });
        if profile.persist_cursors {
            filter = filter.unknown_to(peer_id);
        }
        let candidates = self.ctx.store.list(&filter)?;

        let cap = profile.max_bundles_per_session as u64;
        let mut sent = 0_u64;
        let mut deferred = 0_u64;
        let mut skipped = 0_u64;
        let mut to_send = Vec::new();
        for candidate in &candidates {
            match decide(
                candidate,
                peer_role,
                profile,
                &summary,
                self.ctx.clock.now(),
            ) {
                Decision::Skip => skipped += 1,
                Decision::Defer => deferred += 1,
                Decision::Send if (to_send.len() as u64) >= cap => deferred += 1,
                Decision::Send => to_send.push(candidate.id),
            }
        }

        for id in to_send {
            let Some(envelope) = self.ctx.store.get_envelope(&id)? else {
                continue;
            };
            self.send(&Frame::Bundle(envelope)).await?;
            self.delivered_ids.push(id);
            sent += 1;
        }
        self.ctx.store.note_access(&self.delivered_ids)?;
        self.report.sent += sent;
        self.report.deferred += deferred;
        self.report.skipped += skipped;
        self.send(&Frame::BatchEnd { sent, deferred }).await
    }

    /// Sends one frame. A peer that stops draining the link counts as idle.
    async fn send(&mut self, frame: &Frame) -> Result<(), SessionError> {
        let bytes = encode_frame(frame)?;
        let idle = self.config.session_idle_timeout;
        match tokio::time::timeout(idle, self.conn.send(bytes)).await {
            Err(_) => Err(SessionError::Timeout(idle)),
            Ok(result) => Ok(result?),
        }
    }

    /// Next frame, or `None` on graceful end of stream. Undecodable frames
    /// are returned as `Some(Err(..))` so callers choose whether to skip them.
    async fn recv_frame(&mut self) -> Result<Option<Result<Frame, WireError>>, SessionError> {
        let idle = self.config.session_idle_timeout;
        match tokio::time::timeout(idle, self.conn.recv()).await {
            Err(_) => Err(SessionError::Timeout(idle)),
            Ok(Err(err)) => Err(err.into()),
            Ok(Ok(None)) => Ok(None),
            Ok(Ok(Some(bytes))) => Ok(Some(decode_frame(&bytes))),
        }
    }

    async fn expect_frame(&mut self) -> Result<Frame, SessionError> {
        match self.recv_frame().await? {
            None => Err(SessionError::PeerClosed),
            Some(frame) => Ok(frame?),
        }
    }

    /// Commits the peer cursor and releases the link.
    ///
    /// Received bundles and ids the peer listed are recorded whatever the
    /// outcome; bundles we sent only count once the session completed.
    async fn close(&mut self, graceful: bool) {
        if self.config.profile.persist_cursors {
            if let Some(peer) = self.report.peer.clone() {
                if let Err(err) = self.commit_cursor(&peer, graceful) {
                    warn!(peer = %peer, "failed to update peer cursor: {err}");
                }
            }
        }
        self.report.link = self.conn.stats();
        self.conn.disconnect().await;
        self.state = SessionState::Closed;
        self.received_ids.clear();
        self.delivered_ids.clear();
        self.peer_listed.clear();

        let r = &self.report;
        info!(
            peer = %self.conn.peer_label(),
            outcome = ?r.outcome,
            sent = r.sent,
            received = r.received,
            stored = r.stored,
            duplicates = r.duplicates,
            rejected = r.rejected,
            deferred = r.deferred,
            frames_sent = r.link.frames_sent,
            frames_received = r.link.frames_received,
            bytes_sent = r.link.bytes_sent,
            bytes_received = r.link.bytes_received,
            "session closed"
        );
    }

    // Cursors are keyed by the node id the peer claimed in its hello. Nothing
    // authenticates that claim, so a peer can poison the cursor of another id.
    fn commit_cursor(&self, peer: &str, graceful: bool) -> Result<(), StoreError> {
        let store = &self.ctx.store;
        store.record_peer_contact(peer, self.ctx.clock.now())?;
        store.record_known(peer, &self.received_ids)?;
        store.record_known(peer, &self.peer_listed)?;
        if graceful {
            store.record_known(peer, &self.delivered_ids)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Session, SessionContext, SessionOutcome, SessionState, Side};
    use crate::config::{NodeConfig, SharedConfig};
    use crate::eviction::EvictionEngine;
    use crate::ingress::Ingress;
    use crate::store::BundleStore;
    use crate::subscriptions::SubscriptionRegistry;
    use crate::summary::PeerSummary;
    use crate::wire::{encode_frame, Frame};
    use ferry_codec::{seal_bundle, BundleDraft};
    use ferry_core::{ManualClock, NodeRole, Priority, Timestamp};
    use ferry_crypto::signing::{Ed25519Signer, Ed25519Verifier, Signer};
    use ferry_transport::{memory_pair, Connection};
    use std::sync::Arc;
    use std::time::Duration;

    fn context(role: NodeRole, key: u8, clock: &ManualClock) -> SessionContext {
        let store = Arc::new(BundleStore::open_in_memory().expect("store"));
        let config = SharedConfig::new(NodeConfig::for_role(role));
        let ingress = Arc::new(Ingress::new(
            Arc::clone(&store),
            Arc::new(SubscriptionRegistry::new()),
            Arc::new(EvictionEngine::new()),
            config.clone(),
            Arc::new(Ed25519Verifier),
        ));
        SessionContext {
            store,
            ingress,
            config,
            clock: Arc::new(clock.clone()),
            node_id: Ed25519Signer::from_secret([key; 32]).public_key(),
        }
    }

    fn seed(ctx: &SessionContext, priority: Priority, text: &str) -> ferry_core::BundleId {
        let signer = Ed25519Signer::from_secret([0x77; 32]);
        let draft = BundleDraft::new(
            "note",
            text.as_bytes().to_vec(),
            priority,
            Timestamp(1_000),
            Duration::from_secs(3_600),
        )
        .with_audience("public");
        let bundle = seal_bundle(draft, &signer).expect("seal");
        ctx.store.put(&bundle, Timestamp(1_000)).expect("put");
        bundle.id
    }

    #[tokio::test]
    async fn both_sides_exchange_what_the_other_lacks() {
        let clock = ManualClock::new(Timestamp(1_100));
        let a = context(NodeRole::Bridge, 1, &clock);
        let b = context(NodeRole::Library, 2, &clock);
        let only_a = seed(&a, Priority::Normal, "from a");
        let only_b = seed(&b, Priority::Low, "from b");
        let (left, right) = memory_pair("a", "b");

        let initiator = Session::new(a.clone(), left, Side::Initiator);
        assert_eq!(initiator.state(), SessionState::Disconnected);
        let responder = Session::new(b.clone(), right, Side::Responder);
        let (ra, rb) = tokio::join!(initiator.run(), responder.run());

        assert_eq!(ra.outcome, SessionOutcome::Completed);
        assert_eq!(rb.outcome, SessionOutcome::Completed);
        assert_eq!((ra.sent, ra.stored), (1, 1));
        assert_eq!((rb.sent, rb.stored), (1, 1));
        // hello, summary, one bundle, batch end, close
        assert_eq!(ra.link.frames_sent, 5);
        assert_eq!(ra.link.frames_received, rb.link.frames_sent);
        assert_eq!(ra.link.bytes_sent, rb.link.bytes_received);
        assert!(a.store.contains(&only_b).expect("a has b's"));
        assert!(b.store.contains(&only_a).expect("b has a's"));

        let peer_of_a = hex::encode(b.node_id);
        let cursor = a
            .store
            .peer_cursor(&peer_of_a)
            .expect("cursor")
            .expect("bridge keeps cursors");
        assert_eq!(cursor.known_bundles, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let clock = ManualClock::new(Timestamp(1_100));
        let a = context(NodeRole::Bridge, 1, &clock);
        let (left, _right) = memory_pair("a", "silent");
        let report = Session::new(a, left, Side::Initiator).run().await;
        assert_eq!(report.outcome, SessionOutcome::TimedOut);
        assert_eq!(report.peer, None);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_that_stops_reading_times_out_while_serving() {
        let clock = ManualClock::new(Timestamp(1_100));
        let a = context(NodeRole::Bridge, 1, &clock);
        for i in 0..300 {
            seed(&a, Priority::Normal, &format!("bulk {i}"));
        }
        let (left, mut right) = memory_pair("a", "stalled");

        let hello = Frame::Hello(crate::wire::Hello {
            protocol: crate::wire::PROTOCOL_VERSION,
            node_id: hex::encode(Ed25519Signer::from_secret([2; 32]).public_key()),
            role: NodeRole::Bridge,
            summary_versions: vec![1],
            bundle_count: 0,
        });
        right.send(encode_frame(&hello).expect("hello")).await.expect("send");
        let summary = PeerSummary::IdList(Default::default()).encode().expect("summary");
        right
            .send(encode_frame(&Frame::Summary(summary)).expect("summary frame"))
            .await
            .expect("send");

        // `right` stays open but is never read, so the link fills up.
        let report = Session::new(a, left, Side::Responder).run().await;
        assert_eq!(report.outcome, SessionOutcome::TimedOut);
        assert_eq!(report.sent, 0);
        assert_eq!(report.link.frames_received, 2);
        assert!(report.link.frames_sent < 300);
        drop(right);
    }

    #[tokio::test]
    async fn garbage_during_exchange_is_skipped() {
        let clock = ManualClock::new(Timestamp(1_100));
        let a = context(NodeRole::Bridge, 1, &clock);
        let peer_id = hex::encode(Ed25519Signer::from_secret([2; 32]).public_key());
        let (left, mut right) = memory_pair("a", "scripted");

        let scripted = tokio::spawn(async move {
            let _hello = right.recv().await.expect("recv").expect("hello");
            let hello = Frame::Hello(crate::wire::Hello {
                protocol: crate::wire::PROTOCOL_VERSION,
                node_id: peer_id,
                role: NodeRole::Bridge,
                summary_versions: vec![1],
                bundle_count: 0,
            });
            right.send(encode_frame(&hello).expect("hello")).await.expect("send");
            let _summary = right.recv().await.expect("recv").expect("summary");
            right.send(vec![0xFF, 0xFE]).await.expect("garbage frame");
            right
                .send(encode_frame(&Frame::Bundle(vec![1, 2, 3])).expect("bad bundle"))
                .await
                .expect("send");
            right
                .send(encode_frame(&Frame::BatchEnd { sent: 1, deferred: 0 }).expect("end"))
                .await
                .expect("send");
            right.disconnect().await;
        });

        let report = Session::new(a, left, Side::Initiator).run().await;
        scripted.await.expect("script");
        assert_eq!(report.corrupt_frames, 1);
        assert_eq!(report.received, 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.outcome, SessionOutcome::LinkLost);
    }
}
