//! Per-request coordination task.

use std::collections::HashMap;

use iris_protocol::{
    body::{IntelligenceRequest, IntelligenceResponse, ResponseStatus},
    Envelope, RequestId,
};
use libp2p::PeerId;
use serde_bytes::ByteBuf;
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};

use super::{AggregateResult, Budget, IntelligenceEngine};
use crate::error::{IntelligenceError, TransportError};

/// Who gets the final aggregate.
pub(crate) enum Origin {
    /// A query originated on this node.
    Local(oneshot::Sender<AggregateResult>),
    /// The peer that forwarded the request to us.
    Peer(PeerId),
}

pub(crate) enum CoordinatorEvent {
    ChildResponse { from: PeerId, response: IntelligenceResponse },
    SendFailed { peer: PeerId, error: TransportError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardState {
    Pending,
    Answered,
    Expired,
    Errored,
}

/// One outstanding forward to a neighbor.
#[derive(Debug, Clone)]
pub struct InFlightForward {
    pub peer:       PeerId,
    pub wait_until: Instant,
    pub state:      ForwardState,
}

impl InFlightForward {
    pub fn new(peer: PeerId, wait_until: Instant) -> Self {
        Self { peer, wait_until, state: ForwardState::Pending }
    }

    /// A forward resolves exactly once; later outcomes are ignored.
    pub fn resolve(&mut self, state: ForwardState) -> bool {
        if self.state != ForwardState::Pending {
            return false;
        }
        self.state = state;
        true
    }

    pub fn is_pending(&self) -> bool {
        self.state == ForwardState::Pending
    }
}

pub(crate) struct Coordinator {
    engine:     IntelligenceEngine,
    request_id: RequestId,
    origin:     Origin,
    budget:     Budget,
    path:       Vec<PeerId>,
    query:      Vec<u8>,
    forward:    bool,
    events_tx:  mpsc::UnboundedSender<CoordinatorEvent>,
    events_rx:  mpsc::UnboundedReceiver<CoordinatorEvent>,
    forwards:   HashMap<PeerId, InFlightForward>,
    aggregate:  AggregateResult,
    local_done: bool,
    started:    Instant,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        engine:     IntelligenceEngine,
        request_id: RequestId,
        origin:     Origin,
        budget:     Budget,
        path:       Vec<PeerId>,
        query:      Vec<u8>,
        forward:    bool,
        events_tx:  mpsc::UnboundedSender<CoordinatorEvent>,
        events_rx:  mpsc::UnboundedReceiver<CoordinatorEvent>,
    ) -> Self {
        Self {
            engine,
            request_id,
            origin,
            budget,
            path,
            query,
            forward,
            events_tx,
            events_rx,
            forwards: HashMap::new(),
            aggregate: AggregateResult::new(request_id),
            local_done: false,
            started: Instant::now(),
        }
    }

    pub(crate) async fn run(mut self) {
        let mut shutdown = self.engine.inner().shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            self.finalize_shutdown().await;
            return;
        }

        let responder = self.engine.inner().responder.clone();
        let request_id = self.request_id;
        let query = self.query.clone();
        let local = async move { responder.intelligence(&request_id, &query).await };
        tokio::pin!(local);

        if self.forward {
            self.start_forwards().await;
        }

        loop {
            if self.local_done && self.all_resolved() {
                break;
            }
            let next_expiry = self.next_expiry();
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.finalize_shutdown().await;
                        return;
                    }
                }
                answer = &mut local, if !self.local_done => {
                    self.local_done = true;
                    if let Some(payload) = answer {
                        self.aggregate.insert(self.engine.local_peer(), payload);
                    }
                }
                Some(event) = self.events_rx.recv() => self.apply(event),
                _ = tokio::time::sleep_until(next_expiry.unwrap_or(self.budget.deadline)), if next_expiry.is_some() => {
                    self.expire_due(Instant::now());
                }
                _ = tokio::time::sleep_until(self.budget.deadline) => {
                    tracing::debug!(
                        request_id = %hex::encode(self.request_id),
                        "Local deadline reached",
                    );
                    break;
                }
            }
        }
        self.finalize().await;
    }

    /// Fan the request out to every eligible trusted neighbor, all with the
    /// same child budget.
    async fn start_forwards(&mut self) {
        let now = Instant::now();
        let child = match self.budget.child(self.engine.settings(), now) {
            Ok(child) => child,
            Err(e) => {
                tracing::debug!(request_id = %hex::encode(self.request_id), "Not forwarding: {e}");
                return;
            }
        };
        let neighbors = self.engine.eligible_neighbors(&self.path).await;
        if neighbors.is_empty() {
            return;
        }

        let request = IntelligenceRequest {
            ttl:        child.ttl,
            timeout_ms: child.timeout_ms(now),
            path:       self.path.iter().map(|p| ByteBuf::from(p.to_bytes())).collect(),
            query:      self.query.clone(),
        };
        let envelope = match Envelope::new(self.request_id, &request) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!("Failed to encode intelligence request: {e}");
                self.aggregate.degrade(ResponseStatus::PartialError);
                return;
            }
        };

        tracing::debug!(
            request_id = %hex::encode(self.request_id),
            ttl = child.ttl,
            timeout_ms = request.timeout_ms,
            neighbors = neighbors.len(),
            "Forwarding intelligence request",
        );

        for peer in neighbors {
            self.forwards.insert(peer, InFlightForward::new(peer, child.wait_until));
            let transport = self.engine.inner().transport.clone();
            let events = self.events_tx.clone();
            let envelope = envelope.clone();
            let wait_until = child.wait_until;
            tokio::spawn(async move {
                match tokio::time::timeout_at(wait_until, transport.send(peer, envelope)).await {
                    Ok(Ok(())) | Err(_) => {}
                    Ok(Err(error)) => {
                        let _ = events.send(CoordinatorEvent::SendFailed { peer, error });
                    }
                }
            });
        }
    }

    fn apply(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::ChildResponse { from, response } => {
                let Some(forward) = self.forwards.get_mut(&from) else {
                    tracing::debug!(%from, "Response from a peer we did not forward to");
                    return;
                };
                if !forward.resolve(ForwardState::Answered) {
                    tracing::debug!(%from, "Late response for a resolved forward dropped");
                    return;
                }
                let added = self.aggregate.merge_response(&response);
                tracing::debug!(
                    %from,
                    request_id = %hex::encode(self.request_id),
                    status = %response.status,
                    added,
                    "Merged child response",
                );
            }
            CoordinatorEvent::SendFailed { peer, error } => {
                if let Some(forward) = self.forwards.get_mut(&peer) {
                    if forward.resolve(ForwardState::Errored) {
                        let e = IntelligenceError::TransportFailure { peer, source: error };
                        tracing::debug!(request_id = %hex::encode(self.request_id), "{e}");
                        self.aggregate.degrade(ResponseStatus::PartialError);
                    }
                }
            }
        }
    }

    fn expire_due(&mut self, now: Instant) {
        for forward in self.forwards.values_mut() {
            if forward.wait_until <= now && forward.resolve(ForwardState::Expired) {
                tracing::debug!(
                    peer = %forward.peer,
                    request_id = %hex::encode(self.request_id),
                    "Forward expired",
                );
                self.aggregate.degrade(ResponseStatus::PartialTimeout);
            }
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.forwards
            .values()
            .filter(|f| f.is_pending())
            .map(|f| f.wait_until)
            .min()
    }

    fn all_resolved(&self) -> bool {
        self.forwards.values().all(|f| !f.is_pending())
    }

    async fn finalize(mut self) {
        if !self.local_done {
            self.aggregate.degrade(ResponseStatus::PartialTimeout);
        }
        let now = Instant::now();
        for forward in self.forwards.values_mut() {
            if forward.resolve(ForwardState::Expired) {
                tracing::debug!(peer = %forward.peer, "Forward unanswered at deadline");
                self.aggregate.degrade(ResponseStatus::PartialTimeout);
            }
        }
        // Trim before recording the final status so the seen table agrees
        // with what goes upstream.
        let upstream = match &self.origin {
            Origin::Local(_) => None,
            Origin::Peer(parent) => Some((*parent, self.upstream_envelope())),
        };
        self.engine.finish(&self.request_id, self.aggregate.status).await;

        tracing::info!(
            request_id = %hex::encode(self.request_id),
            status = %self.aggregate.status,
            responders = self.aggregate.len(),
            elapsed_ms = now.duration_since(self.started).as_millis() as u64,
            "Intelligence request finalized",
        );

        if let Origin::Local(tx) = self.origin {
            let _ = tx.send(self.aggregate);
            return;
        }
        let Some((parent, Some(envelope))) = upstream else { return };
        let transport = self.engine.inner().transport.clone();
        let bound = self.engine.settings().propagation_margin;
        match tokio::time::timeout(bound, transport.send(parent, envelope)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(%parent, "Failed to return aggregate: {e}"),
            Err(_) => tracing::debug!(%parent, "Returning aggregate timed out"),
        }
    }

    /// Response envelope for the parent, trimmed to the message size limit.
    fn upstream_envelope(&mut self) -> Option<Envelope> {
        match self.aggregate.fit_envelope() {
            Ok((env, 0)) => Some(env),
            Ok((env, dropped)) => {
                tracing::warn!(
                    request_id = %hex::encode(self.request_id),
                    dropped,
                    kept = self.aggregate.len(),
                    "Aggregate exceeds message size, largest answers dropped",
                );
                Some(env)
            }
            Err(e) => {
                tracing::warn!("Failed to encode intelligence response: {e}");
                None
            }
        }
    }

    /// Node is going down: hand back what we have as `partial-error`, but
    /// send nothing upstream.
    async fn finalize_shutdown(mut self) {
        self.aggregate.degrade(ResponseStatus::PartialError);
        for forward in self.forwards.values_mut() {
            forward.resolve(ForwardState::Errored);
        }
        self.engine.finish(&self.request_id, self.aggregate.status).await;
        tracing::info!(
            request_id = %hex::encode(self.request_id),
            responders = self.aggregate.len(),
            "Intelligence request aborted by shutdown",
        );
        if let Origin::Local(tx) = self.origin {
            let _ = tx.send(self.aggregate);
        }
    }
}
