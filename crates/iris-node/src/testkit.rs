//! In-memory network for exercising several nodes in one process.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use iris_protocol::{Envelope, RequestId};
use libp2p::PeerId;
use tokio::sync::mpsc;

use crate::{
    dispatch::Dispatcher,
    error::TransportError,
    intelligence::{tests::settings, IntelligenceEngine, IntelligenceSettings},
    recommendation::RecommendationHandler,
    responder::LocalResponder,
    sessions::SessionRegistry,
    transport::Transport,
    trust::TrustEngine,
};

enum Slot {
    Live(Dispatcher),
    /// Acknowledges everything, never answers.
    Silent,
    /// Acknowledges and records everything.
    Probe(mpsc::UnboundedSender<(PeerId, Envelope)>),
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    slots: Arc<Mutex<HashMap<PeerId, Slot>>>,
}

/// One fully wired node on a [`MemoryNetwork`].
pub struct TestNode {
    pub peer:            PeerId,
    pub sessions:        SessionRegistry,
    pub intelligence:    IntelligenceEngine,
    pub recommendations: RecommendationHandler,
    pub dispatcher:      Dispatcher,
    pub responder:       Arc<FixedResponder>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, responder: FixedResponder) -> TestNode {
        self.node_with(responder, settings(), Vec::new())
    }

    pub fn node_with_trust(&self, responder: FixedResponder, orgs: Vec<String>) -> TestNode {
        self.node_with(responder, settings(), orgs)
    }

    pub fn node_with(
        &self,
        responder: FixedResponder,
        settings:  IntelligenceSettings,
        orgs:      Vec<String>,
    ) -> TestNode {
        let peer = PeerId::random();
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport { local: peer, network: self.clone() });
        let responder = Arc::new(responder);
        let sessions = SessionRegistry::new();
        let intelligence = IntelligenceEngine::new(
            peer,
            settings,
            sessions.clone(),
            transport.clone(),
            responder.clone(),
        );
        let recommendations = RecommendationHandler::new(transport, responder.clone(), Duration::from_secs(1));
        let dispatcher = Dispatcher {
            sessions:        sessions.clone(),
            trust:           Arc::new(TrustEngine::new(orgs)),
            intelligence:    intelligence.clone(),
            recommendations: recommendations.clone(),
        };
        self.insert(peer, Slot::Live(dispatcher.clone()));
        TestNode { peer, sessions, intelligence, recommendations, dispatcher, responder }
    }

    pub fn silent_peer(&self) -> PeerId {
        let peer = PeerId::random();
        self.insert(peer, Slot::Silent);
        peer
    }

    pub fn probe_peer(&self) -> (PeerId, mpsc::UnboundedReceiver<(PeerId, Envelope)>) {
        let peer = PeerId::random();
        let (tx, rx) = mpsc::unbounded_channel();
        self.insert(peer, Slot::Probe(tx));
        (peer, rx)
    }

    /// Connect two nodes with a mutually trusted session.
    pub async fn link(&self, a: &TestNode, b: &TestNode) {
        for (x, y) in [(a, b), (b, a)] {
            x.sessions.connect(y.peer).await;
            x.sessions.set_trust(&y.peer, true, vec!["org".into()]).await;
        }
    }

    /// Give `node` a session to `peer` with the given trust decision.
    pub async fn attach(&self, node: &TestNode, peer: PeerId, trusted: bool) {
        node.sessions.connect(peer).await;
        node.sessions.set_trust(&peer, trusted, Vec::new()).await;
    }

    /// Deliver `envelope` to `to` as if `from` had sent it.
    pub fn inject(&self, from: PeerId, to: PeerId, envelope: Envelope) {
        self.deliver(from, to, envelope).ok();
    }

    fn insert(&self, peer: PeerId, slot: Slot) {
        if let Ok(mut slots) = self.slots.lock() {
            slots.insert(peer, slot);
        }
    }

    fn deliver(&self, from: PeerId, to: PeerId, envelope: Envelope) -> Result<(), TransportError> {
        // Round-trip through the wire encoding like the real codec does.
        let bytes = envelope.to_cbor().map_err(|e| TransportError::Encode(e.to_string()))?;
        let envelope = Envelope::from_cbor(&bytes).map_err(|e| TransportError::Encode(e.to_string()))?;

        let slots = self.slots.lock().map_err(|_| TransportError::Closed)?;
        match slots.get(&to) {
            Some(Slot::Live(dispatcher)) => {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move { dispatcher.dispatch(from, envelope).await });
                Ok(())
            }
            Some(Slot::Silent) => Ok(()),
            Some(Slot::Probe(tx)) => {
                let _ = tx.send((from, envelope));
                Ok(())
            }
            None => Err(TransportError::NotConnected(to)),
        }
    }
}

struct MemoryTransport {
    local:   PeerId,
    network: MemoryNetwork,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, peer: PeerId, envelope: Envelope) -> Result<(), TransportError> {
        self.network.deliver(self.local, peer, envelope)
    }
}

/// Responder with a canned answer, an optional delay and a call counter.
#[derive(Default)]
pub struct FixedResponder {
    intelligence:   Option<Vec<u8>>,
    recommendation: Option<Vec<u8>>,
    delay:          Duration,
    calls:          AtomicUsize,
}

impl FixedResponder {
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn answering(payload: &[u8]) -> Self {
        Self { intelligence: Some(payload.to_vec()), ..Self::default() }
    }

    pub fn recommending(payload: &[u8]) -> Self {
        Self { recommendation: Some(payload.to_vec()), ..Self::default() }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of intelligence queries answered so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalResponder for FixedResponder {
    async fn intelligence(&self, _: &RequestId, _: &[u8]) -> Option<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.intelligence.clone()
    }

    async fn recommendation(&self, _: PeerId, _: &RequestId, _: &[u8]) -> Option<Vec<u8>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.recommendation.clone()
    }
}
