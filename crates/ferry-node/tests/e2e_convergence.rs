mod common;

use std::time::Duration;

use common::{foreign_bundle, ids, relay, relay_with, sync, xorshift64, HOUR, START};
use ferry_core::{ManualClock, NodeRole, Priority, Timestamp};
use ferry_node::{
    BundleFilter, BundleStore, CacheBudget, EvictionEngine, NodeConfig, PublishRequest, Relay,
    SessionOutcome,
};

fn publish(node: &Relay, text: &str, priority: Priority, audience: &str) {
    node.publish(
        PublishRequest::new("note", text, priority, 24 * HOUR).with_audience(audience),
    )
    .expect("publish");
}

/// Syncs every pair until one full round moves nothing.
async fn sync_until_quiet(nodes: &[&Relay]) -> usize {
    for round in 1..=10 {
        let mut moved = 0;
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                let (ra, rb) = sync(a, b).await;
                assert_eq!(ra.outcome, SessionOutcome::Completed);
                assert_eq!(rb.outcome, SessionOutcome::Completed);
                moved += ra.sent + rb.sent;
            }
        }
        if moved == 0 {
            return round;
        }
    }
    panic!("nodes kept transferring after 10 rounds");
}

#[tokio::test]
async fn unrestricted_roles_converge_to_identical_sets() {
    let clock = ManualClock::new(START);
    let bridge = relay(NodeRole::Bridge, 1, &clock);
    let library = relay(NodeRole::Library, 2, &clock);
    let access = relay(NodeRole::AccessPoint, 3, &clock);

    publish(&bridge, "road to north camp washed out", Priority::Emergency, "public");
    publish(&bridge, "spare tarps", Priority::Low, "coop");
    publish(&library, "seed bank hours", Priority::Normal, "public");
    publish(&library, "fresh fish at pier", Priority::Perishable, "local");
    publish(&access, "generator schedule", Priority::Normal, "coop");

    let rounds = sync_until_quiet(&[&bridge, &library, &access]).await;
    assert!(rounds <= 3, "took {rounds} rounds");
    let expected = ids(&bridge);
    assert_eq!(expected.len(), 5);
    assert_eq!(ids(&library), expected);
    assert_eq!(ids(&access), expected);
}

#[tokio::test]
async fn citizen_converges_within_its_role_restrictions() {
    let clock = ManualClock::new(START);
    let citizen = relay(NodeRole::Citizen, 1, &clock);
    let bridge = relay(NodeRole::Bridge, 2, &clock);

    publish(&citizen, "lost dog near school", Priority::Normal, "public");
    publish(&citizen, "coop meeting notes", Priority::Normal, "coop");
    publish(&citizen, "boil water notice", Priority::Emergency, "coop");
    publish(&bridge, "surplus blankets", Priority::Low, "public");
    publish(&bridge, "ferry timetable", Priority::Normal, "public");

    sync_until_quiet(&[&citizen, &bridge]).await;

    let on_bridge = bridge
        .query(&BundleFilter::default())
        .expect("bridge query");
    assert_eq!(on_bridge.len(), 4);
    assert!(!on_bridge
        .iter()
        .any(|s| s.audience == "coop" && s.priority == Priority::Normal));

    let on_citizen = citizen
        .query(&BundleFilter::default())
        .expect("citizen query");
    assert_eq!(on_citizen.len(), 4);
    assert!(!on_citizen.iter().any(|s| s.priority == Priority::Low));
}

#[tokio::test]
async fn bloom_summaries_still_converge() {
    let clock = ManualClock::new(START);
    let bloomy = || {
        let mut cfg = NodeConfig::for_role(NodeRole::Bridge);
        cfg.full_list_threshold = 0;
        cfg.bloom_false_positive_rate = 0.0001;
        cfg
    };
    let a = relay_with(bloomy(), 1, &clock);
    let b = relay_with(bloomy(), 2, &clock);
    for i in 0..4 {
        publish(&a, &format!("a{i}"), Priority::Normal, "public");
        publish(&b, &format!("b{i}"), Priority::Perishable, "public");
    }

    sync_until_quiet(&[&a, &b]).await;
    assert_eq!(ids(&a).len(), 8);
    assert_eq!(ids(&a), ids(&b));
}

#[tokio::test]
async fn sessions_over_tcp_exchange_bundles() {
    use ferry_transport::connection::DEFAULT_MAX_FRAME_LEN;
    use ferry_transport::{TcpAcceptor, TcpDialer};

    let acceptor = match TcpAcceptor::bind("127.0.0.1:0", DEFAULT_MAX_FRAME_LEN).await {
        Ok(a) => a,
        Err(err) => {
            eprintln!("skipping tcp test (bind failed: {err})");
            return;
        }
    };
    let addr = acceptor.local_addr().expect("addr").to_string();
    let clock = ManualClock::new(START);
    let a = relay(NodeRole::Bridge, 1, &clock);
    let b = relay(NodeRole::AccessPoint, 2, &clock);
    publish(&a, "from a", Priority::Normal, "public");
    publish(&b, "from b", Priority::Emergency, "public");

    let server = {
        let b = b.clone();
        tokio::spawn(async move {
            let conn = acceptor.accept().await.expect("accept");
            b.accept(conn).await
        })
    };
    let ra = a
        .connect_and_sync(&TcpDialer::default(), &addr)
        .await
        .expect("dial");
    let rb = server.await.expect("server");
    assert_eq!(ra.outcome, SessionOutcome::Completed);
    assert_eq!(rb.outcome, SessionOutcome::Completed);
    assert_eq!(ids(&a), ids(&b));
}

#[test]
fn unexpired_emergency_bundles_survive_any_budget() {
    let mut seed = 0x5EED_F00D_u64;
    for _case in 0..20 {
        let store = BundleStore::open_in_memory().expect("store");
        let now = START;
        let mut emergencies = Vec::new();
        let count = 5 + (xorshift64(&mut seed) % 20) as usize;
        for i in 0..count {
            let roll = xorshift64(&mut seed);
            let priority = Priority::ALL[(roll % 4) as usize];
            let created = Timestamp(now.0 - (roll % 3_600));
            let ttl = Duration::from_secs(60 + (roll >> 8) % (96 * 3_600));
            let bundle = foreign_bundle(&format!("case bundle {i}"), priority, created, ttl);
            store.put(&bundle, now).expect("put");
            if priority == Priority::Emergency && !bundle.is_expired(now) {
                emergencies.push(bundle.id);
            }
        }
        let total = store.stats().expect("stats").total_bytes;
        let budget = xorshift64(&mut seed) % (total + 1);
        let cfg = NodeConfig::for_role(NodeRole::Bridge).with_budget(CacheBudget::bytes(budget));

        let report = EvictionEngine::new()
            .enforce(&store, &cfg, now)
            .expect("enforce")
            .expect("ran");
        for id in &emergencies {
            assert!(store.contains(id).expect("contains"), "emergency evicted");
            assert!(!report.evicted.contains(id));
        }
        let after = store.stats().expect("stats");
        if after.total_bytes > budget {
            assert!(report.over_budget_protected_only);
            let remaining = store.list(&BundleFilter::default()).expect("list");
            assert!(remaining
                .iter()
                .all(|s| s.priority == Priority::Emergency && !s.is_expired(now)));
        }
    }
}

#[test]
fn sweep_removes_exactly_the_expired_set() {
    let mut seed = 0xC0FF_EE11_u64;
    let store = BundleStore::open_in_memory().expect("store");
    let now = START;
    let mut alive = Vec::new();
    for i in 0..40 {
        let roll = xorshift64(&mut seed);
        let created = Timestamp(now.0 - 1_000);
        // expires_at lands anywhere in [now - 10, now + 10]
        let ttl = Duration::from_secs(990 + roll % 21);
        let bundle = foreign_bundle(&format!("edge {i}"), Priority::Normal, created, ttl);
        store.put(&bundle, now.saturating_sub(Duration::from_secs(900))).expect("put");
        if bundle.expires_at >= now {
            alive.push(bundle.id);
        }
    }

    let removed = store.delete_expired(now).expect("sweep");
    let left: Vec<_> = store.ids().expect("ids");
    assert_eq!(left.len(), alive.len());
    assert_eq!(removed.len(), 40 - alive.len());
    for id in &alive {
        assert!(left.contains(id));
    }
    let at_edge = store
        .list(&BundleFilter::default().alive_at(now))
        .expect("list");
    assert_eq!(at_edge.len(), alive.len());
}

#[tokio::test]
async fn repeated_sync_is_idempotent() {
    let clock = ManualClock::new(START);
    let a = relay(NodeRole::Bridge, 1, &clock);
    let b = relay(NodeRole::Bridge, 2, &clock);
    publish(&a, "one", Priority::Normal, "public");

    sync(&a, &b).await;
    let (ra, rb) = sync(&a, &b).await;
    assert_eq!((ra.sent, rb.sent), (0, 0));
    assert_eq!((ra.stored, rb.stored), (0, 0));
    assert_eq!(b.stats().expect("stats").bundle_count, 1);
}

#[tokio::test]
async fn bridge_carries_bundles_between_islands() {
    use ferry_transport::MemoryNetwork;

    let clock = ManualClock::new(START);
    let west = relay(NodeRole::AccessPoint, 1, &clock);
    let east = relay(NodeRole::Library, 2, &clock);
    let courier = relay(NodeRole::Bridge, 3, &clock);
    publish(&west, "west clinic needs insulin", Priority::Emergency, "public");
    publish(&east, "east market prices", Priority::Normal, "public");

    let net = MemoryNetwork::default();
    let dialer = net.handle("courier");
    for (addr, island) in [("west", &west), ("east", &east), ("west", &west)] {
        let mut listener = net.listen(addr);
        let island = island.clone();
        let server = tokio::spawn(async move {
            let conn = listener.accept().await.expect("inbound");
            island.accept(conn).await
        });
        let report = courier
            .connect_and_sync(&dialer, addr)
            .await
            .expect("dial island");
        assert_eq!(report.outcome, SessionOutcome::Completed);
        assert_eq!(server.await.expect("island").outcome, SessionOutcome::Completed);
    }

    assert_eq!(ids(&west), ids(&east));
    assert_eq!(ids(&courier), ids(&east));
    assert_eq!(ids(&east).len(), 2);
}
