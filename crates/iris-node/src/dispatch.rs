//! Routes decoded inbound envelopes to the protocol handlers.

use std::sync::Arc;

use iris_protocol::{
    body::{
        Hello, IntelligenceRequest, IntelligenceResponse, RecommendationRequest,
        RecommendationResponse,
    },
    Envelope, MsgType, ProtocolError,
};
use libp2p::PeerId;

use crate::{
    intelligence::IntelligenceEngine, recommendation::RecommendationHandler,
    sessions::SessionRegistry, trust::TrustEngine,
};

#[derive(Clone)]
pub struct Dispatcher {
    pub sessions:        SessionRegistry,
    pub trust:           Arc<TrustEngine>,
    pub intelligence:    IntelligenceEngine,
    pub recommendations: RecommendationHandler,
}

impl Dispatcher {
    /// Handle one inbound envelope. Never blocks on the network: anything
    /// that has to wait is spawned.
    pub async fn dispatch(&self, from: PeerId, envelope: Envelope) {
        if let Err(e) = self.route(from, envelope).await {
            tracing::debug!(%from, "Dropping malformed message: {e}");
        }
    }

    async fn route(&self, from: PeerId, envelope: Envelope) -> Result<(), ProtocolError> {
        let request_id = envelope.request_id;
        match envelope.msg_type {
            MsgType::Hello => {
                let hello: Hello = envelope.decode_body()?;
                let decision = self.trust.evaluate(&from, &hello.attestations);
                tracing::info!(
                    peer = %from,
                    trusted = decision.trusted,
                    orgs = ?decision.organisations,
                    "Session trust evaluated",
                );
                self.sessions.set_trust(&from, decision.trusted, decision.organisations).await;
            }
            MsgType::IntelligenceRequest => {
                let request: IntelligenceRequest = envelope.decode_body()?;
                self.intelligence.handle_request(from, request_id, request).await;
            }
            MsgType::IntelligenceResponse => {
                let response: IntelligenceResponse = envelope.decode_body()?;
                self.intelligence.handle_response(from, request_id, response).await;
            }
            MsgType::RecommendationRequest => {
                let request: RecommendationRequest = envelope.decode_body()?;
                let handler = self.recommendations.clone();
                tokio::spawn(async move { handler.handle_request(from, request_id, request).await });
            }
            MsgType::RecommendationResponse => {
                let response: RecommendationResponse = envelope.decode_body()?;
                self.recommendations.handle_response(from, request_id, response).await;
            }
        }
        Ok(())
    }
}
