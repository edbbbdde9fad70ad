//! Multi-node scenarios over the in-memory network.

use std::{collections::BTreeSet, time::Duration};

use iris_protocol::{
    body::{IntelligenceRequest, IntelligenceResponse, ResponseStatus},
    new_request_id, Envelope, MsgType, RequestId,
};
use libp2p::PeerId;
use tokio::{sync::mpsc, time::Instant};

use super::IntelligenceSettings;
use crate::testkit::{FixedResponder, MemoryNetwork};

pub(crate) fn settings() -> IntelligenceSettings {
    IntelligenceSettings {
        max_ttl:            5,
        ttl:                3,
        max_parent_timeout: Duration::from_secs(1),
        root_timeout:       Duration::from_secs(2),
        propagation_margin: Duration::from_millis(50),
        seen_retention:     Duration::from_secs(60),
        answer_untrusted:   true,
    }
}

fn request(ttl: u32, timeout_ms: u64) -> (RequestId, Envelope) {
    let id = new_request_id();
    let body = IntelligenceRequest { ttl, timeout_ms, path: Vec::new(), query: b"indicator".to_vec() };
    (id, Envelope::new(id, &body).unwrap())
}

fn responders(peers: &[PeerId]) -> BTreeSet<PeerId> {
    peers.iter().copied().collect()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn next_request(rx: &mut mpsc::UnboundedReceiver<(PeerId, Envelope)>) -> Option<IntelligenceRequest> {
    let (_, env) = rx.try_recv().ok()?;
    assert_eq!(env.msg_type, MsgType::IntelligenceRequest);
    env.decode_body().ok()
}

fn next_response(rx: &mut mpsc::UnboundedReceiver<(PeerId, Envelope)>) -> Option<IntelligenceResponse> {
    let (_, env) = rx.try_recv().ok()?;
    assert_eq!(env.msg_type, MsgType::IntelligenceResponse);
    env.decode_body().ok()
}

// ============================================================================
// Propagation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn line_topology_collects_every_hop() {
    let net = MemoryNetwork::new();
    let a = net.node(FixedResponder::answering(b"a"));
    let b = net.node(FixedResponder::answering(b"b"));
    let c = net.node(FixedResponder::answering(b"c"));
    let d = net.node(FixedResponder::answering(b"d").after(Duration::from_millis(200)));
    net.link(&a, &b).await;
    net.link(&b, &c).await;
    net.link(&c, &d).await;

    let started = Instant::now();
    let result = a.intelligence.query(b"indicator".to_vec()).await;

    assert_eq!(result.status, ResponseStatus::Complete);
    assert_eq!(
        result.responses.keys().copied().collect::<BTreeSet<_>>(),
        responders(&[a.peer, b.peer, c.peer, d.peer]),
    );
    assert_eq!(result.responses[&d.peer], b"d");
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn ttl_limits_the_reach() {
    let net = MemoryNetwork::new();
    let a = net.node(FixedResponder::answering(b"a"));
    let b = net.node(FixedResponder::answering(b"b"));
    let c = net.node(FixedResponder::answering(b"c"));
    net.link(&a, &b).await;
    net.link(&b, &c).await;

    let result = a.intelligence.query_with(b"q".to_vec(), Some(1), None).await;
    assert_eq!(result.status, ResponseStatus::Complete);
    assert_eq!(result.responses.keys().copied().collect::<BTreeSet<_>>(), responders(&[a.peer, b.peer]));
    assert_eq!(c.responder.calls(), 0);

    let local_only = a.intelligence.query_with(b"q".to_vec(), Some(0), None).await;
    assert_eq!(local_only.status, ResponseStatus::Complete);
    assert_eq!(local_only.len(), 1);
    assert_eq!(b.responder.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn received_budget_is_capped_before_forwarding() {
    let net = MemoryNetwork::new();
    let x = net.node(FixedResponder::answering(b"x"));
    let (upstream, _up_rx) = net.probe_peer();
    let (neighbor, mut rx) = net.probe_peer();
    net.attach(&x, upstream, true).await;
    net.attach(&x, neighbor, true).await;

    let (_, env) = request(50, 3_600_000);
    net.inject(upstream, x.peer, env);
    settle().await;

    let forwarded = next_request(&mut rx).expect("neighbor was asked");
    assert_eq!(forwarded.ttl, settings().max_ttl - 1);
    assert_eq!(forwarded.timeout_ms, 950);
    let path: Vec<PeerId> = forwarded.path.iter().map(|p| PeerId::from_bytes(p).unwrap()).collect();
    assert!(path.contains(&upstream));
    assert!(path.contains(&x.peer));
}

// ============================================================================
// Cycles and duplicates
// ============================================================================

#[tokio::test(start_paused = true)]
async fn triangle_answers_each_node_once() {
    let net = MemoryNetwork::new();
    let a = net.node(FixedResponder::answering(b"a"));
    let b = net.node(FixedResponder::answering(b"b"));
    let c = net.node(FixedResponder::answering(b"c"));
    net.link(&a, &b).await;
    net.link(&b, &c).await;
    net.link(&c, &a).await;

    let result = a.intelligence.query(b"q".to_vec()).await;

    assert_eq!(result.status, ResponseStatus::Complete);
    assert_eq!(
        result.responses.keys().copied().collect::<BTreeSet<_>>(),
        responders(&[a.peer, b.peer, c.peer]),
    );
    for node in [&a, &b, &c] {
        assert_eq!(node.responder.calls(), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn duplicate_is_acknowledged_but_not_forwarded_again() {
    let net = MemoryNetwork::new();
    let x = net.node(FixedResponder::answering(b"x"));
    let (upstream, mut up_rx) = net.probe_peer();
    let (neighbor, mut rx) = net.probe_peer();
    net.attach(&x, upstream, true).await;
    net.attach(&x, neighbor, true).await;

    let (id, env) = request(2, 500);
    net.inject(upstream, x.peer, env.clone());
    settle().await;
    assert!(next_request(&mut rx).is_some());

    net.inject(upstream, x.peer, env);
    settle().await;
    let dup = next_response(&mut up_rx).expect("duplicate acknowledged");
    assert_eq!(dup.status, ResponseStatus::Complete);
    assert!(dup.entries.is_empty());
    assert!(next_request(&mut rx).is_none());
    assert_eq!(x.responder.calls(), 1);

    // The original request still finalizes once the silent neighbor expires.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let done = next_response(&mut up_rx).expect("aggregate returned");
    assert_eq!(done.status, ResponseStatus::PartialTimeout);
    assert_eq!(done.entries.len(), 1);
    assert_eq!(done.entries[0].payload, b"x");
    assert!(x.intelligence.has_seen(&id).await);
}

// ============================================================================
// Partial results
// ============================================================================

#[tokio::test(start_paused = true)]
async fn silent_leaf_yields_partial_timeout_with_every_other_answer() {
    let net = MemoryNetwork::new();
    let a = net.node(FixedResponder::answering(b"a"));
    let b = net.node(FixedResponder::answering(b"b"));
    let c = net.node(FixedResponder::answering(b"c"));
    let silent = net.silent_peer();
    net.link(&a, &b).await;
    net.link(&b, &c).await;
    net.attach(&c, silent, true).await;

    let started = Instant::now();
    let result = a.intelligence.query(b"q".to_vec()).await;

    assert_eq!(result.status, ResponseStatus::PartialTimeout);
    assert_eq!(
        result.responses.keys().copied().collect::<BTreeSet<_>>(),
        responders(&[a.peer, b.peer, c.peer]),
    );
    assert!(started.elapsed() <= settings().root_timeout);
}

#[tokio::test(start_paused = true)]
async fn silent_neighbor_does_not_hold_the_root_past_its_deadline() {
    let net = MemoryNetwork::new();
    let a = net.node(FixedResponder::answering(b"a"));
    let b = net.node(FixedResponder::answering(b"b"));
    let silent = net.silent_peer();
    net.link(&a, &b).await;
    net.attach(&a, silent, true).await;

    let started = Instant::now();
    let result = a.intelligence.query(b"q".to_vec()).await;

    assert_eq!(result.status, ResponseStatus::PartialTimeout);
    assert_eq!(result.responses.keys().copied().collect::<BTreeSet<_>>(), responders(&[a.peer, b.peer]));
    assert!(started.elapsed() <= settings().max_parent_timeout);
}

#[tokio::test(start_paused = true)]
async fn slow_local_answer_is_left_out() {
    let net = MemoryNetwork::new();
    let a = net.node(FixedResponder::answering(b"a").after(Duration::from_secs(5)));

    let started = Instant::now();
    let result = a.intelligence.query(b"q".to_vec()).await;

    assert_eq!(result.status, ResponseStatus::PartialTimeout);
    assert!(result.is_empty());
    assert!(started.elapsed() >= settings().root_timeout);
    assert!(started.elapsed() < settings().root_timeout + Duration::from_millis(10));
}

#[tokio::test(start_paused = true)]
async fn oversized_subtree_is_trimmed_not_lost() {
    let big = vec![0u8; 600_000];
    let net = MemoryNetwork::new();
    let a = net.node(FixedResponder::answering(b"a"));
    let b = net.node(FixedResponder::answering(&big));
    let c = net.node(FixedResponder::answering(&big));
    net.link(&a, &b).await;
    net.link(&b, &c).await;

    let started = Instant::now();
    let result = a.intelligence.query(b"q".to_vec()).await;

    assert_eq!(result.status, ResponseStatus::PartialError);
    assert_eq!(result.len(), 2);
    assert_eq!(result.responses[&a.peer], b"a");
    let kept: Vec<_> = [b.peer, c.peer].into_iter().filter(|p| result.responses.contains_key(p)).collect();
    assert_eq!(kept.len(), 1);
    assert_eq!(result.responses[&kept[0]], big);
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn unreachable_neighbor_is_a_partial_error() {
    let net = MemoryNetwork::new();
    let a = net.node(FixedResponder::answering(b"a"));
    net.attach(&a, PeerId::random(), true).await;

    let started = Instant::now();
    let result = a.intelligence.query(b"q".to_vec()).await;

    assert_eq!(result.status, ResponseStatus::PartialError);
    assert_eq!(result.len(), 1);
    assert!(started.elapsed() < Duration::from_millis(100));
}

// ============================================================================
// Trust
// ============================================================================

#[tokio::test(start_paused = true)]
async fn untrusted_neighbors_are_never_asked() {
    let net = MemoryNetwork::new();
    let a = net.node(FixedResponder::answering(b"a"));
    let b = net.node(FixedResponder::answering(b"b"));
    let (untrusted, mut rx) = net.probe_peer();
    net.link(&a, &b).await;
    net.attach(&a, untrusted, false).await;

    let result = a.intelligence.query(b"q".to_vec()).await;

    assert_eq!(result.status, ResponseStatus::Complete);
    assert_eq!(result.len(), 2);
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn untrusted_sender_is_answered_but_not_forwarded() {
    let net = MemoryNetwork::new();
    let x = net.node(FixedResponder::answering(b"x"));
    let (sender, mut sender_rx) = net.probe_peer();
    let (neighbor, mut neighbor_rx) = net.probe_peer();
    net.attach(&x, sender, false).await;
    net.attach(&x, neighbor, true).await;

    let (_, env) = request(3, 500);
    net.inject(sender, x.peer, env);
    settle().await;

    let reply = next_response(&mut sender_rx).expect("answered locally");
    assert_eq!(reply.status, ResponseStatus::Complete);
    assert_eq!(reply.entries.len(), 1);
    assert!(neighbor_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn untrusted_sender_is_ignored_when_policy_is_off() {
    let net = MemoryNetwork::new();
    let strict = IntelligenceSettings { answer_untrusted: false, ..settings() };
    let x = net.node_with(FixedResponder::answering(b"x"), strict, Vec::new());
    let (sender, mut sender_rx) = net.probe_peer();
    net.attach(&x, sender, false).await;

    let (id, env) = request(3, 500);
    net.inject(sender, x.peer, env);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(sender_rx.try_recv().is_err());
    assert_eq!(x.responder.calls(), 0);
    assert!(!x.intelligence.has_seen(&id).await);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn shutdown_finalizes_with_partial_error() {
    let net = MemoryNetwork::new();
    let a = net.node(FixedResponder::answering(b"a"));
    let silent = net.silent_peer();
    net.attach(&a, silent, true).await;

    let engine = a.intelligence.clone();
    let query = tokio::spawn(async move { engine.query(b"q".to_vec()).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    a.intelligence.shutdown();

    let result = query.await.unwrap();
    assert_eq!(result.status, ResponseStatus::PartialError);
    assert_eq!(result.responses[&a.peer], b"a");
    assert_eq!(a.intelligence.in_flight().await, 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_coordinators_to_finish() {
    let net = MemoryNetwork::new();
    let a = net.node(FixedResponder::answering(b"a"));
    let silent = net.silent_peer();
    net.attach(&a, silent, true).await;

    let engine = a.intelligence.clone();
    let query = tokio::spawn(async move { engine.query(b"q".to_vec()).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(a.intelligence.in_flight().await, 1);

    let started = Instant::now();
    assert!(a.intelligence.shutdown_and_drain(Duration::from_secs(1)).await);
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(a.intelligence.in_flight().await, 0);

    let result = query.await.unwrap();
    assert_eq!(result.status, ResponseStatus::PartialError);
}

#[tokio::test(start_paused = true)]
async fn shutdown_drain_gives_up_after_the_grace() {
    let net = MemoryNetwork::new();
    let a = net.node(FixedResponder::answering(b"a"));
    let engine = a.intelligence.clone();
    let grace = Duration::from_millis(200);

    // A coordinator registered but never run models one that cannot finish.
    let _stuck = engine.register_for_test(new_request_id()).await;
    let started = Instant::now();
    assert!(!engine.shutdown_and_drain(grace).await);
    assert!(started.elapsed() >= grace);
}

#[tokio::test(start_paused = true)]
async fn shutdown_sends_nothing_upstream() {
    let net = MemoryNetwork::new();
    let x = net.node(FixedResponder::answering(b"x"));
    let (upstream, mut up_rx) = net.probe_peer();
    let silent = net.silent_peer();
    net.attach(&x, upstream, true).await;
    net.attach(&x, silent, true).await;

    let (_, env) = request(2, 800);
    net.inject(upstream, x.peer, env);
    tokio::time::sleep(Duration::from_millis(100)).await;
    x.intelligence.shutdown();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(up_rx.try_recv().is_err());
    assert_eq!(x.intelligence.in_flight().await, 0);
}

#[tokio::test(start_paused = true)]
async fn seen_entries_expire_after_retention() {
    let net = MemoryNetwork::new();
    let x = net.node(FixedResponder::answering(b"x"));
    let (upstream, _rx) = net.probe_peer();
    net.attach(&x, upstream, true).await;

    let (id, env) = request(0, 200);
    net.inject(upstream, x.peer, env);
    settle().await;
    assert!(x.intelligence.has_seen(&id).await);

    tokio::time::sleep(settings().seen_retention).await;
    assert_eq!(x.intelligence.sweep_seen().await, 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(x.intelligence.sweep_seen().await, 1);
    assert!(!x.intelligence.has_seen(&id).await);
}
