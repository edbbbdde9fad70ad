//! Single-hop recommendation exchange.

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::future::join_all;
use iris_protocol::{
    body::{RecommendationRequest, RecommendationResponse},
    new_request_id, Envelope, RequestId,
};
use libp2p::PeerId;
use tokio::{
    sync::{oneshot, Mutex},
    time::Instant,
};

use crate::{
    error::{RecommendationError, TransportError},
    responder::LocalResponder,
    transport::Transport,
};

struct Pending {
    peer:  PeerId,
    reply: oneshot::Sender<Vec<u8>>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    responder: Arc<dyn LocalResponder>,
    timeout:   Duration,
    pending:   Mutex<HashMap<RequestId, Pending>>,
}

#[derive(Clone)]
pub struct RecommendationHandler(Arc<Inner>);

impl RecommendationHandler {
    pub fn new(
        transport: Arc<dyn Transport>,
        responder: Arc<dyn LocalResponder>,
        timeout:   Duration,
    ) -> Self {
        Self(Arc::new(Inner {
            transport,
            responder,
            timeout,
            pending: Mutex::new(HashMap::new()),
        }))
    }

    /// Ask `peer` for a recommendation and wait up to `timeout` (or the
    /// configured default) for its reply.
    pub async fn request(
        &self,
        peer:    PeerId,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, RecommendationError> {
        let deadline = Instant::now() + timeout.unwrap_or(self.0.timeout);
        let request_id = new_request_id();
        let envelope = Envelope::new(request_id, &RecommendationRequest { payload })
            .map_err(|e| TransportError::Encode(e.to_string()))?;

        let (reply, rx) = oneshot::channel();
        self.0.pending.lock().await.insert(request_id, Pending { peer, reply });

        let outcome = async {
            match tokio::time::timeout_at(deadline, self.0.transport.send(peer, envelope)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(RecommendationError::Transport(e)),
                Err(_) => return Err(RecommendationError::TimedOut(peer)),
            }
            match tokio::time::timeout_at(deadline, rx).await {
                Ok(Ok(payload)) => Ok(payload),
                Ok(Err(_)) | Err(_) => Err(RecommendationError::TimedOut(peer)),
            }
        }
        .await;

        if outcome.is_err() {
            self.0.pending.lock().await.remove(&request_id);
        }
        match &outcome {
            Ok(payload) => tracing::debug!(
                %peer,
                request_id = %hex::encode(request_id),
                len = payload.len(),
                "Recommendation received",
            ),
            Err(e) => tracing::debug!(%peer, request_id = %hex::encode(request_id), "Recommendation failed: {e}"),
        }
        outcome
    }

    /// Ask several peers at once, each under its own timeout.
    pub async fn request_many(
        &self,
        peers:   Vec<PeerId>,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Vec<(PeerId, Result<Vec<u8>, RecommendationError>)> {
        join_all(peers.into_iter().map(|peer| {
            let payload = payload.clone();
            async move { (peer, self.request(peer, payload, timeout).await) }
        }))
        .await
    }

    /// Answer a request from `from` through the local responder. No answer
    /// within the timeout means no reply at all.
    pub async fn handle_request(&self, from: PeerId, request_id: RequestId, request: RecommendationRequest) {
        let answer = tokio::time::timeout(
            self.0.timeout,
            self.0.responder.recommendation(from, &request_id, &request.payload),
        )
        .await;
        let payload = match answer {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                tracing::debug!(%from, request_id = %hex::encode(request_id), "No local recommendation");
                return;
            }
            Err(_) => {
                tracing::debug!(%from, request_id = %hex::encode(request_id), "Local recommendation timed out");
                return;
            }
        };
        let envelope = match Envelope::new(request_id, &RecommendationResponse { payload }) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!("Failed to encode recommendation response: {e}");
                return;
            }
        };
        if let Err(e) = self.0.transport.send(from, envelope).await {
            tracing::debug!(%from, "Failed to send recommendation response: {e}");
        }
    }

    pub async fn handle_response(&self, from: PeerId, request_id: RequestId, response: RecommendationResponse) {
        let mut pending = self.0.pending.lock().await;
        let expected = pending.get(&request_id).map(|p| p.peer);
        match expected {
            Some(peer) if peer == from => {
                if let Some(p) = pending.remove(&request_id) {
                    let _ = p.reply.send(response.payload);
                }
            }
            Some(peer) => tracing::debug!(
                %from,
                expected = %peer,
                "Recommendation response from the wrong peer ignored",
            ),
            None => tracing::debug!(%from, request_id = %hex::encode(request_id), "Unsolicited recommendation response"),
        }
    }

    pub async fn pending(&self) -> usize {
        self.0.pending.lock().await.len()
    }
}
