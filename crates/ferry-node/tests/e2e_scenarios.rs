mod common;

use std::time::Duration;

use common::{foreign_bundle, ids, relay, relay_with, sync, HOUR, START};
use ferry_codec::bundle::encode_bundle_cbor;
use ferry_core::{ManualClock, NodeRole, Priority};
use ferry_node::summary::{PeerSummary, SummaryEnvelope, SUMMARY_ID_LIST_V1};
use ferry_node::wire::{decode_frame, encode_frame, Frame, Hello, PROTOCOL_VERSION};
use ferry_node::{BundleFilter, CacheBudget, NodeConfig, PublishRequest, SessionOutcome};
use ferry_transport::{memory_pair, Connection, MemoryConnection};

#[test]
fn publish_is_visible_to_query() {
    let clock = ManualClock::new(START);
    let node = relay(NodeRole::Citizen, 1, &clock);
    let id = node
        .publish(PublishRequest::new(
            "listing",
            "5kg tomatoes",
            Priority::Perishable,
            48 * HOUR,
        ))
        .expect("publish");

    let listed = node.query(&BundleFilter::default()).expect("query");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);
    assert_eq!(listed[0].priority, Priority::Perishable);
    assert_eq!(listed[0].expires_at, START.saturating_add(48 * HOUR));
}

#[tokio::test]
async fn emergency_bundle_displaces_low_priority_on_a_full_node() {
    let clock = ManualClock::new(START);
    let a = relay(NodeRole::Bridge, 1, &clock);
    let b = relay(NodeRole::Bridge, 2, &clock);

    let alert = a
        .publish(PublishRequest::new(
            "alert",
            "levee breach, move to high ground",
            Priority::Emergency,
            6 * HOUR,
        ))
        .expect("publish alert");
    for i in 0..5 {
        b.publish(PublishRequest::new(
            "listing",
            format!("surplus lot {i}"),
            Priority::Low,
            72 * HOUR,
        ))
        .expect("publish low");
        clock.advance(Duration::from_secs(1));
    }
    let full = b.stats().expect("stats").total_bytes;
    let tight = NodeConfig::for_role(NodeRole::Bridge).with_budget(CacheBudget::bytes(full - 1));
    b.reload_config(tight).expect("reload");

    let (ra, rb) = sync(&b, &a).await;
    assert_eq!(ra.outcome, SessionOutcome::Completed);
    assert_eq!(rb.outcome, SessionOutcome::Completed);

    let report = b.enforce_budget_now().expect("enforce").expect("ran");
    assert!(!report.evicted.is_empty());
    assert!(!report.evicted.contains(&alert));
    assert!(!report.over_budget_protected_only);
    assert!(b.store().contains(&alert).expect("contains"));
    let lows = b
        .query(&BundleFilter::default().with_priority(Priority::Low))
        .expect("query");
    assert!(lows.len() < 5);
    assert!(b.stats().expect("stats").total_bytes < full);
}

#[tokio::test]
async fn bundles_expired_by_one_second_are_never_offered() {
    let clock = ManualClock::new(START);
    let a = relay(NodeRole::Bridge, 1, &clock);
    let b = relay(NodeRole::Bridge, 2, &clock);
    let stale = a
        .publish(PublishRequest::new(
            "listing",
            "bread",
            Priority::Perishable,
            Duration::from_secs(60),
        ))
        .expect("publish");
    clock.advance(Duration::from_secs(61));
    let fresh = a
        .publish(PublishRequest::new("listing", "rice", Priority::Normal, HOUR))
        .expect("publish");
    assert!(a.store().contains(&stale).expect("unswept"));

    let (rb, ra) = sync(&b, &a).await;
    assert_eq!(ra.sent, 1);
    assert_eq!(rb.received, 1);
    assert!(b.store().contains(&fresh).expect("fresh"));
    assert!(!b.store().contains(&stale).expect("stale"));
}

#[tokio::test]
async fn same_bundle_from_two_peers_is_stored_once() {
    let clock = ManualClock::new(START);
    let a = relay(NodeRole::Bridge, 1, &clock);
    let c = relay(NodeRole::AccessPoint, 3, &clock);
    let b = relay(NodeRole::Library, 2, &clock);
    let shared = foreign_bundle("water point open", Priority::Perishable, START, 12 * HOUR);
    a.store().put(&shared, START).expect("a");
    c.store().put(&shared, START).expect("c");

    let (left_a, right_a) = memory_pair("b", "a");
    let (left_c, right_c) = memory_pair("b", "c");
    let (from_a, _, from_c, _) = tokio::join!(
        b.sync_with(left_a),
        a.accept(right_a),
        b.sync_with(left_c),
        c.accept(right_c)
    );

    assert_eq!(from_a.outcome, SessionOutcome::Completed);
    assert_eq!(from_c.outcome, SessionOutcome::Completed);
    assert_eq!(from_a.stored + from_c.stored, 1);
    assert_eq!(from_a.rejected + from_c.rejected, 0);
    assert_eq!(b.stats().expect("stats").bundle_count, 1);
    assert!(b.store().contains(&shared.id).expect("contains"));
}

async fn recv_frame(conn: &mut MemoryConnection) -> Frame {
    let bytes = conn.recv().await.expect("recv").expect("frame");
    decode_frame(&bytes).expect("decode")
}

async fn send_frame(conn: &mut MemoryConnection, frame: &Frame) {
    conn.send(encode_frame(frame).expect("encode"))
        .await
        .expect("send");
}

fn scripted_hello(key: u8, versions: Vec<u16>) -> Frame {
    use ferry_crypto::signing::{Ed25519Signer, Signer};
    Frame::Hello(Hello {
        protocol: PROTOCOL_VERSION,
        node_id: hex::encode(Ed25519Signer::from_secret([key; 32]).public_key()),
        role: NodeRole::Bridge,
        summary_versions: versions,
        bundle_count: 2,
    })
}

fn empty_id_list() -> SummaryEnvelope {
    PeerSummary::IdList(Default::default())
        .encode()
        .expect("summary")
}

/// Reads our side's summary, then drains the node's bundles until `BatchEnd`.
async fn serve_nothing_and_drain(conn: &mut MemoryConnection) {
    send_frame(conn, &Frame::Summary(empty_id_list())).await;
    loop {
        match recv_frame(conn).await {
            Frame::BatchEnd { .. } => break,
            Frame::Bundle(_) => continue,
            other => panic!("unexpected {}", other.kind()),
        }
    }
}

#[tokio::test]
async fn corrupted_signature_is_dropped_and_next_bundle_still_stored() {
    let clock = ManualClock::new(START);
    let node = relay(NodeRole::Bridge, 1, &clock);
    let (left, mut right) = memory_pair("node", "scripted");

    let mut forged = foreign_bundle("free fuel at depot", Priority::Normal, START, HOUR);
    forged.signature.0[10] ^= 0x40;
    let valid = foreign_bundle("clinic open until 18:00", Priority::Normal, START, HOUR);
    let forged_bytes = encode_bundle_cbor(&forged).expect("encode forged");
    let valid_bytes = encode_bundle_cbor(&valid).expect("encode valid");

    let script = tokio::spawn(async move {
        assert!(matches!(recv_frame(&mut right).await, Frame::Hello(_)));
        send_frame(&mut right, &scripted_hello(9, vec![SUMMARY_ID_LIST_V1])).await;
        assert!(matches!(recv_frame(&mut right).await, Frame::Summary(_)));
        send_frame(&mut right, &Frame::Bundle(forged_bytes)).await;
        send_frame(&mut right, &Frame::Bundle(valid_bytes)).await;
        send_frame(&mut right, &Frame::BatchEnd { sent: 2, deferred: 0 }).await;
        serve_nothing_and_drain(&mut right).await;
        assert_eq!(recv_frame(&mut right).await, Frame::Close);
    });

    let report = node.sync_with(left).await;
    script.await.expect("script");
    assert_eq!(report.outcome, SessionOutcome::Completed);
    assert_eq!(report.received, 2);
    assert_eq!(report.rejected, 1);
    assert_eq!(report.stored, 1);
    assert!(node.store().contains(&valid.id).expect("valid"));
    assert!(!node.store().contains(&forged.id).expect("forged"));
}

#[tokio::test]
async fn same_bundle_twice_in_one_session_is_a_duplicate_not_an_error() {
    let clock = ManualClock::new(START);
    let node = relay(NodeRole::Bridge, 1, &clock);
    let (left, mut right) = memory_pair("node", "scripted");
    let bundle = foreign_bundle("bridge closed", Priority::Emergency, START, HOUR);
    let bytes = encode_bundle_cbor(&bundle).expect("encode");

    let script = tokio::spawn(async move {
        recv_frame(&mut right).await;
        send_frame(&mut right, &scripted_hello(9, vec![SUMMARY_ID_LIST_V1])).await;
        recv_frame(&mut right).await;
        send_frame(&mut right, &Frame::Bundle(bytes.clone())).await;
        send_frame(&mut right, &Frame::Bundle(bytes)).await;
        send_frame(&mut right, &Frame::BatchEnd { sent: 2, deferred: 0 }).await;
        serve_nothing_and_drain(&mut right).await;
        recv_frame(&mut right).await;
    });

    let report = node.sync_with(left).await;
    script.await.expect("script");
    assert_eq!(report.outcome, SessionOutcome::Completed);
    assert_eq!((report.stored, report.duplicates, report.rejected), (1, 1, 0));
    assert_eq!(node.stats().expect("stats").bundle_count, 1);
}

#[tokio::test]
async fn refused_bloom_summary_falls_back_to_full_list() {
    let clock = ManualClock::new(START);
    let mut cfg = NodeConfig::for_role(NodeRole::Bridge);
    cfg.full_list_threshold = 0;
    let node = relay_with(cfg, 1, &clock);
    node.publish(PublishRequest::new("note", "held", Priority::Normal, HOUR))
        .expect("publish");
    let (left, mut right) = memory_pair("node", "old-peer");

    let script = tokio::spawn(async move {
        recv_frame(&mut right).await;
        send_frame(&mut right, &scripted_hello(9, vec![1, 2])).await;
        let first = match recv_frame(&mut right).await {
            Frame::Summary(env) => env,
            other => panic!("expected summary, got {}", other.kind()),
        };
        send_frame(
            &mut right,
            &Frame::SummaryUnsupported {
                supported: vec![SUMMARY_ID_LIST_V1],
            },
        )
        .await;
        let second = match recv_frame(&mut right).await {
            Frame::Summary(env) => env,
            other => panic!("expected summary, got {}", other.kind()),
        };
        send_frame(&mut right, &Frame::BatchEnd { sent: 0, deferred: 0 }).await;
        serve_nothing_and_drain(&mut right).await;
        recv_frame(&mut right).await;
        (first.version, second.version, PeerSummary::decode(&second).expect("list"))
    });

    let report = node.sync_with(left).await;
    let (first, second, list) = script.await.expect("script");
    assert_eq!(report.outcome, SessionOutcome::Completed);
    assert_eq!(first, 2);
    assert_eq!(second, SUMMARY_ID_LIST_V1);
    assert_eq!(list.listed_ids().map(|ids| ids.len()), Some(1));
}

#[tokio::test]
async fn unknown_summary_version_is_answered_with_supported_list() {
    let clock = ManualClock::new(START);
    let node = relay(NodeRole::Bridge, 1, &clock);
    let (mut left, right) = memory_pair("node", "future-peer");

    let script = tokio::spawn(async move {
        send_frame(&mut left, &scripted_hello(9, vec![1, 2, 7])).await;
        assert!(matches!(recv_frame(&mut left).await, Frame::Hello(_)));
        let from_the_future = SummaryEnvelope {
            version: 7,
            body: vec![0xA0],
        };
        send_frame(&mut left, &Frame::Summary(from_the_future)).await;
        let supported = match recv_frame(&mut left).await {
            Frame::SummaryUnsupported { supported } => supported,
            other => panic!("expected refusal, got {}", other.kind()),
        };
        serve_nothing_and_drain(&mut left).await;
        assert!(matches!(recv_frame(&mut left).await, Frame::Summary(_)));
        send_frame(&mut left, &Frame::BatchEnd { sent: 0, deferred: 0 }).await;
        send_frame(&mut left, &Frame::Close).await;
        supported
    });

    let report = node.accept(right).await;
    let supported = script.await.expect("script");
    assert_eq!(report.outcome, SessionOutcome::Completed);
    assert!(supported.contains(&SUMMARY_ID_LIST_V1));
}

#[tokio::test]
async fn interrupted_session_resumes_on_next_contact() {
    let clock = ManualClock::new(START);
    let a = relay(NodeRole::Bridge, 1, &clock);
    let b = relay(NodeRole::Bridge, 2, &clock);
    for i in 0..5 {
        a.publish(PublishRequest::new(
            "note",
            format!("bulletin {i}"),
            Priority::Normal,
            HOUR,
        ))
        .expect("publish");
    }

    let (left, right) = memory_pair("b", "a");
    let (rb, ra) = tokio::join!(b.sync_with(left), a.accept(right.cut_after(3)));
    assert_eq!(ra.outcome, SessionOutcome::LinkLost);
    assert_eq!(rb.outcome, SessionOutcome::LinkLost);
    assert_eq!(rb.stored, 2);
    let b_id = hex::encode(b.node_id());
    let cursor = a.store().peer_cursor(&b_id).expect("cursor").expect("recorded");
    assert_eq!(cursor.known_bundles, 0);

    let (rb, ra) = sync(&b, &a).await;
    assert_eq!(ra.outcome, SessionOutcome::Completed);
    assert_eq!(rb.stored, 3);
    assert_eq!(ids(&a), ids(&b));
    let cursor = a.store().peer_cursor(&b_id).expect("cursor").expect("recorded");
    assert_eq!(cursor.known_bundles, 5);
    assert_eq!(cursor.sessions, 2);
}

#[tokio::test]
async fn per_session_cap_defers_the_rest() {
    let clock = ManualClock::new(START);
    let mut cfg = NodeConfig::for_role(NodeRole::Bridge);
    cfg.profile.max_bundles_per_session = 2;
    let a = relay_with(cfg, 1, &clock);
    let b = relay(NodeRole::Bridge, 2, &clock);
    let mut published = Vec::new();
    for (i, priority) in [Priority::Low, Priority::Emergency, Priority::Normal]
        .into_iter()
        .enumerate()
    {
        let request = PublishRequest::new("note", format!("n{i}"), priority, HOUR);
        published.push(a.publish(request).expect("publish"));
    }

    let (rb, ra) = sync(&b, &a).await;
    assert_eq!((ra.sent, ra.deferred), (2, 1));
    assert!(b.store().contains(&published[1]).expect("emergency first"));
    assert!(b.store().contains(&published[2]).expect("normal second"));
    assert!(!b.store().contains(&published[0]).expect("low deferred"));
    assert_eq!(rb.stored, 2);

    sync(&b, &a).await;
    assert!(b.store().contains(&published[0]).expect("low on next contact"));
}
