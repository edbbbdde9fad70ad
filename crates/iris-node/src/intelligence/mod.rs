//! Multi-hop intelligence protocol.
//!
//! Every request id gets one coordinator task on every node it reaches.
//! The coordinator alone mutates that request's forwards and aggregate;
//! child responses, send failures and shutdown reach it by message passing.
//! The seen table is the only state shared across requests.

mod aggregate;
mod budget;
mod coordinator;
mod seen;

#[cfg(test)]
pub(crate) mod tests;

use std::{collections::HashMap, sync::Arc, time::Duration};

use iris_protocol::{
    body::{IntelligenceRequest, IntelligenceResponse, ResponseStatus},
    new_request_id, Envelope, RequestId,
};
use libp2p::PeerId;
use tokio::{
    sync::{mpsc, oneshot, watch, Mutex},
    time::Instant,
};

pub use aggregate::AggregateResult;
pub use budget::Budget;
use seen::SeenTable;

use coordinator::{Coordinator, CoordinatorEvent, Origin};

use crate::{
    error::IntelligenceError, responder::LocalResponder, sessions::SessionRegistry,
    transport::Transport,
};

#[derive(Debug, Clone)]
pub struct IntelligenceSettings {
    /// Highest TTL accepted from a parent.
    pub max_ttl: u32,
    /// TTL of queries this node originates.
    pub ttl: u32,
    /// Longest this node waits on any single child, and on behalf of any parent.
    pub max_parent_timeout: Duration,
    /// Budget of queries this node originates.
    pub root_timeout: Duration,
    /// Reserved for aggregation, send-back latency and clock skew.
    pub propagation_margin: Duration,
    /// How long request ids are remembered past their deadline.
    pub seen_retention: Duration,
    /// Answer (but never forward) requests from untrusted peers.
    pub answer_untrusted: bool,
}

pub(crate) struct Inner {
    pub(crate) local_peer: PeerId,
    pub(crate) settings:   IntelligenceSettings,
    sessions:              SessionRegistry,
    pub(crate) transport:  Arc<dyn Transport>,
    pub(crate) responder:  Arc<dyn LocalResponder>,
    seen:                  Mutex<SeenTable>,
    coordinators:          Mutex<HashMap<RequestId, mpsc::UnboundedSender<CoordinatorEvent>>>,
    pub(crate) shutdown:   watch::Sender<bool>,
}

/// Admitted incoming request, ready for a coordinator.
struct Admission {
    budget:  Budget,
    path:    Vec<PeerId>,
    forward: bool,
}

/// Cheaply cloneable handle to the intelligence engine of one node.
#[derive(Clone)]
pub struct IntelligenceEngine(Arc<Inner>);

impl IntelligenceEngine {
    pub fn new(
        local_peer: PeerId,
        settings:   IntelligenceSettings,
        sessions:   SessionRegistry,
        transport:  Arc<dyn Transport>,
        responder:  Arc<dyn LocalResponder>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let seen = SeenTable::new(settings.seen_retention);
        Self(Arc::new(Inner {
            local_peer,
            settings,
            sessions,
            transport,
            responder,
            seen: Mutex::new(seen),
            coordinators: Mutex::new(HashMap::new()),
            shutdown,
        }))
    }

    pub fn local_peer(&self) -> PeerId {
        self.0.local_peer
    }

    pub fn settings(&self) -> &IntelligenceSettings {
        &self.0.settings
    }

    // ========================================================================
    // Locally originated queries
    // ========================================================================

    /// Run a query with the configured root TTL and timeout.
    pub async fn query(&self, query: Vec<u8>) -> AggregateResult {
        self.query_with(query, None, None).await
    }

    /// Run a query, optionally overriding TTL (still capped by `max_ttl`) and
    /// timeout. Always returns a result; its status tells whether it is whole.
    pub async fn query_with(
        &self,
        query:   Vec<u8>,
        ttl:     Option<u32>,
        timeout: Option<Duration>,
    ) -> AggregateResult {
        let now = Instant::now();
        let request_id = new_request_id();
        let budget = Budget::originated(&self.0.settings, ttl, timeout, now);
        self.0.seen.lock().await.first_sighting(request_id, budget.deadline, now);

        tracing::info!(
            request_id = %hex::encode(request_id),
            ttl = budget.ttl,
            timeout_ms = budget.remaining(now).as_millis() as u64,
            "Originating intelligence request",
        );

        let (tx, rx) = oneshot::channel();
        self.spawn_coordinator(request_id, Origin::Local(tx), budget, vec![self.0.local_peer], query, true)
            .await;
        rx.await.unwrap_or_else(|_| AggregateResult::failed(request_id))
    }

    // ========================================================================
    // Inbound traffic
    // ========================================================================

    /// Handle a request forwarded by `from`.
    pub async fn handle_request(&self, from: PeerId, request_id: RequestId, request: IntelligenceRequest) {
        match self.admit(from, request_id, &request).await {
            Ok(admission) => {
                if !admission.forward {
                    tracing::debug!(
                        %from,
                        request_id = %hex::encode(request_id),
                        "Untrusted sender, answering locally only",
                    );
                }
                self.spawn_coordinator(
                    request_id,
                    Origin::Peer(from),
                    admission.budget,
                    admission.path,
                    request.query,
                    admission.forward,
                )
                .await;
            }
            Err(e @ IntelligenceError::DuplicateRequest(_)) => {
                tracing::debug!(%from, "{e}, not forwarding again");
                self.reply_duplicate(from, request_id);
            }
            Err(e) => tracing::debug!(%from, request_id = %hex::encode(request_id), "Ignoring request: {e}"),
        }
    }

    /// Route a child's aggregate to the coordinator waiting for it.
    pub async fn handle_response(&self, from: PeerId, request_id: RequestId, response: IntelligenceResponse) {
        let tx = self.0.coordinators.lock().await.get(&request_id).cloned();
        match tx {
            Some(tx) => {
                if tx.send(CoordinatorEvent::ChildResponse { from, response }).is_err() {
                    tracing::trace!(%from, "Coordinator finished before response was routed");
                }
            }
            None => tracing::debug!(
                %from,
                request_id = %hex::encode(request_id),
                "Late or unsolicited intelligence response dropped",
            ),
        }
    }

    async fn admit(
        &self,
        from:       PeerId,
        request_id: RequestId,
        request:    &IntelligenceRequest,
    ) -> Result<Admission, IntelligenceError> {
        let now = Instant::now();
        let trusted = self.0.sessions.is_trusted(&from).await;
        if !trusted && !self.0.settings.answer_untrusted {
            return Err(IntelligenceError::UntrustedPeer(from));
        }

        let budget = Budget::received(
            &self.0.settings,
            request.ttl,
            Duration::from_millis(request.timeout_ms),
            now,
        );
        if budget.deadline <= now {
            return Err(IntelligenceError::BudgetExhausted { ttl: budget.ttl, remaining_ms: 0 });
        }
        if !self.0.seen.lock().await.first_sighting(request_id, budget.deadline, now) {
            return Err(IntelligenceError::DuplicateRequest(hex::encode(request_id)));
        }

        let mut path: Vec<PeerId> = request
            .path
            .iter()
            .filter_map(|p| PeerId::from_bytes(p).ok())
            .collect();
        for peer in [from, self.0.local_peer] {
            if !path.contains(&peer) {
                path.push(peer);
            }
        }
        Ok(Admission { budget, path, forward: trusted })
    }

    /// Let a sender that reached us over a second path resolve its forward.
    fn reply_duplicate(&self, to: PeerId, request_id: RequestId) {
        let envelope = match Envelope::new(request_id, &IntelligenceResponse::duplicate()) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!("Failed to encode duplicate reply: {e}");
                return;
            }
        };
        let transport = self.0.transport.clone();
        let bound = self.0.settings.propagation_margin;
        tokio::spawn(async move {
            match tokio::time::timeout(bound, transport.send(to, envelope)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(%to, "Duplicate reply failed: {e}"),
                Err(_) => tracing::debug!(%to, "Duplicate reply timed out"),
            }
        });
    }

    async fn spawn_coordinator(
        &self,
        request_id: RequestId,
        origin:     Origin,
        budget:     Budget,
        path:       Vec<PeerId>,
        query:      Vec<u8>,
        forward:    bool,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.0.coordinators.lock().await.insert(request_id, events_tx.clone());
        let coordinator = Coordinator::new(
            self.clone(),
            request_id,
            origin,
            budget,
            path,
            query,
            forward,
            events_tx,
            events_rx,
        );
        tokio::spawn(coordinator.run());
    }

    /// Called by a coordinator once its result is final.
    async fn finish(&self, request_id: &RequestId, status: ResponseStatus) {
        self.0.coordinators.lock().await.remove(request_id);
        self.0.seen.lock().await.finalize(request_id, status);
    }

    pub(crate) fn inner(&self) -> &Inner {
        &self.0
    }

    pub(crate) async fn eligible_neighbors(&self, upstream: &[PeerId]) -> Vec<PeerId> {
        self.0
            .sessions
            .trusted_peers()
            .await
            .into_iter()
            .filter(|p| *p != self.0.local_peer && !upstream.contains(p))
            .collect()
    }

    // ========================================================================
    // Housekeeping
    // ========================================================================

    /// Evict expired seen entries. Runs on the node's periodic sweep.
    pub async fn sweep_seen(&self) -> usize {
        self.0.seen.lock().await.sweep(Instant::now())
    }

    pub async fn has_seen(&self, request_id: &RequestId) -> bool {
        self.0.seen.lock().await.get(request_id).is_some()
    }

    pub async fn in_flight(&self) -> usize {
        self.0.coordinators.lock().await.len()
    }

    /// Fail every in-flight request with `partial-error`. Irreversible.
    pub fn shutdown(&self) {
        self.0.shutdown.send_replace(true);
    }

    #[cfg(test)]
    pub(crate) async fn register_for_test(
        &self,
        request_id: RequestId,
    ) -> mpsc::UnboundedReceiver<CoordinatorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.0.coordinators.lock().await.insert(request_id, tx);
        rx
    }

    /// `shutdown`, then wait up to `grace` for every coordinator to finish.
    /// Returns false if some were still running when the grace ran out.
    pub async fn shutdown_and_drain(&self, grace: Duration) -> bool {
        self.shutdown();
        let drained = tokio::time::timeout(grace, async {
            while self.in_flight().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok();
        if !drained {
            tracing::warn!(
                remaining = self.in_flight().await,
                "Intelligence requests still running after shutdown grace",
            );
        }
        drained
    }
}
