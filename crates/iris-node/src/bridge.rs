//! External bridge: HTTP + WebSocket surface for the application that owns
//! this node's data.
//!
//!   GET  /ws/events               — WebSocket stream of bridge events
//!   GET  /peers                   — Connected peers with trust status
//!   POST /intelligence/query      — Originate an intelligence query
//!   POST /intelligence/answer     — Supply the local answer to a pending query
//!   POST /recommendation/request  — Ask peers for a recommendation
//!   POST /recommendation/answer   — Supply the local answer to a peer's request

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use iris_protocol::RequestId;
use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, watch};

use crate::{
    intelligence::{AggregateResult, IntelligenceEngine},
    recommendation::RecommendationHandler,
    responder::LocalResponder,
    sessions::{SessionRegistry, SessionSnapshot},
};

// ============================================================================
// Events — broadcast to /ws/events subscribers
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// A query reached this node; answer with POST /intelligence/answer.
    IntelligenceQuery {
        request_id: String,
        query_b64:  String,
    },
    /// A peer asked for a recommendation; answer with POST /recommendation/answer.
    RecommendationRequest {
        request_id: String,
        from:       String,
        payload_b64: String,
    },
    PeerConnected {
        peer_id: String,
    },
    PeerDisconnected {
        peer_id: String,
    },
    PeerTrust {
        peer_id: String,
        trusted: bool,
    },
}

// ============================================================================
// Hub — the engine-facing side
// ============================================================================

type PendingAnswers = Mutex<HashMap<RequestId, oneshot::Sender<Vec<u8>>>>;

/// Event fan-out plus the local answers the application still owes.
pub struct BridgeHub {
    events:         broadcast::Sender<BridgeEvent>,
    intelligence:   PendingAnswers,
    recommendation: PendingAnswers,
}

/// Removes a pending answer slot when the waiting side gives up.
struct PendingSlot<'a> {
    map: &'a PendingAnswers,
    id:  RequestId,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if let Ok(mut map) = self.map.lock() {
            map.remove(&self.id);
        }
    }
}

impl BridgeHub {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(512);
        Arc::new(Self {
            events,
            intelligence: Mutex::new(HashMap::new()),
            recommendation: Mutex::new(HashMap::new()),
        })
    }

    /// Fire-and-forget. Never blocks; events nobody listens to are dropped.
    pub fn publish(&self, event: BridgeEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    pub fn answer_intelligence(&self, id: &RequestId, payload: Vec<u8>) -> bool {
        Self::answer(&self.intelligence, id, payload)
    }

    pub fn answer_recommendation(&self, id: &RequestId, payload: Vec<u8>) -> bool {
        Self::answer(&self.recommendation, id, payload)
    }

    fn answer(map: &PendingAnswers, id: &RequestId, payload: Vec<u8>) -> bool {
        let tx = match map.lock() {
            Ok(mut map) => map.remove(id),
            Err(_) => None,
        };
        match tx {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    /// Publish `event` and wait for the matching answer. Returns None at once
    /// when nobody is subscribed.
    async fn ask(&self, map: &PendingAnswers, id: RequestId, event: BridgeEvent) -> Option<Vec<u8>> {
        if self.events.receiver_count() == 0 {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        map.lock().ok()?.insert(id, tx);
        let _slot = PendingSlot { map, id };
        self.publish(event);
        rx.await.ok()
    }
}

#[async_trait]
impl LocalResponder for BridgeHub {
    async fn intelligence(&self, request_id: &RequestId, query: &[u8]) -> Option<Vec<u8>> {
        let event = BridgeEvent::IntelligenceQuery {
            request_id: hex::encode(request_id),
            query_b64:  B64.encode(query),
        };
        self.ask(&self.intelligence, *request_id, event).await
    }

    async fn recommendation(&self, from: PeerId, request_id: &RequestId, payload: &[u8]) -> Option<Vec<u8>> {
        let event = BridgeEvent::RecommendationRequest {
            request_id:  hex::encode(request_id),
            from:        from.to_string(),
            payload_b64: B64.encode(payload),
        };
        self.ask(&self.recommendation, *request_id, event).await
    }
}

// ============================================================================
// Request / response bodies
// ============================================================================

#[derive(Deserialize)]
pub struct QueryRequest {
    pub query_b64:  String,
    pub ttl:        Option<u32>,
    pub timeout_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct QueryResult {
    pub request_id: String,
    pub status:     String,
    pub responses:  Vec<ResponderAnswer>,
}

#[derive(Serialize)]
pub struct ResponderAnswer {
    pub peer_id:     String,
    pub payload_b64: String,
}

impl From<AggregateResult> for QueryResult {
    fn from(result: AggregateResult) -> Self {
        Self {
            request_id: hex::encode(result.request_id),
            status:     result.status.to_string(),
            responses:  result
                .responses
                .into_iter()
                .map(|(peer, payload)| ResponderAnswer {
                    peer_id:     peer.to_string(),
                    payload_b64: B64.encode(payload),
                })
                .collect(),
        }
    }
}

#[derive(Deserialize)]
pub struct AnswerRequest {
    pub request_id:  String,
    pub payload_b64: String,
}

#[derive(Deserialize)]
pub struct RecommendRequest {
    pub peers:       Vec<String>,
    pub payload_b64: String,
    pub timeout_ms:  Option<u64>,
}

#[derive(Serialize)]
pub struct RecommendOutcome {
    pub peer_id:     String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_b64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error:       Option<String>,
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, msg: impl Into<String>) -> ApiError {
    (status, Json(serde_json::json!({ "error": msg.into() })))
}

// ============================================================================
// Shared state
// ============================================================================

struct BridgeInner {
    hub:             Arc<BridgeHub>,
    intelligence:    IntelligenceEngine,
    recommendations: RecommendationHandler,
    sessions:        SessionRegistry,
    secret:          Option<String>,
}

/// Cheaply cloneable shared state passed to all axum handlers.
#[derive(Clone)]
pub struct BridgeState(Arc<BridgeInner>);

impl BridgeState {
    pub fn new(
        hub:             Arc<BridgeHub>,
        intelligence:    IntelligenceEngine,
        recommendations: RecommendationHandler,
        sessions:        SessionRegistry,
        secret:          Option<String>,
    ) -> Self {
        Self(Arc::new(BridgeInner { hub, intelligence, recommendations, sessions, secret }))
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let Some(ref secret) = self.0.secret else {
            return Ok(());
        };
        let expected = format!("Bearer {secret}");
        let provided = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if ct_eq(provided, &expected) {
            Ok(())
        } else {
            Err(api_error(StatusCode::UNAUTHORIZED, "unauthorized"))
        }
    }
}

// ============================================================================
// Server
// ============================================================================

pub fn router(state: BridgeState) -> Router {
    Router::new()
        .route("/ws/events",              get(ws_events_handler))
        .route("/peers",                  get(get_peers))
        .route("/intelligence/query",     post(intelligence_query))
        .route("/intelligence/answer",    post(intelligence_answer))
        .route("/recommendation/request", post(recommendation_request))
        .route("/recommendation/answer",  post(recommendation_answer))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

/// Serve the bridge until `stop` flips to true, then drain open requests.
pub async fn serve(
    state:    BridgeState,
    addr:     SocketAddr,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Bridge listening on http://{addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = stop.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

// ============================================================================
// Route handlers
// ============================================================================

async fn ws_events_handler(
    ws:           WebSocketUpgrade,
    State(state): State<BridgeState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| ws_events_task(socket, state))
}

async fn ws_events_task(mut socket: WebSocket, state: BridgeState) {
    let mut rx = state.0.hub.subscribe();
    loop {
        match rx.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => {
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!("WS events serialize error: {e}"),
            },
            Err(broadcast::error::RecvError::Closed)    => break,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!("WS events subscriber lagged by {n}");
                continue;
            }
        }
    }
}

async fn get_peers(State(state): State<BridgeState>) -> Json<Vec<SessionSnapshot>> {
    Json(state.0.sessions.snapshot().await)
}

async fn intelligence_query(
    State(state): State<BridgeState>,
    headers:      HeaderMap,
    Json(req):    Json<QueryRequest>,
) -> Result<Json<QueryResult>, ApiError> {
    state.authorize(&headers)?;
    let query = decode_b64(&req.query_b64, "query_b64")?;
    let result = state
        .0
        .intelligence
        .query_with(query, req.ttl, req.timeout_ms.map(Duration::from_millis))
        .await;
    Ok(Json(result.into()))
}

async fn intelligence_answer(
    State(state): State<BridgeState>,
    headers:      HeaderMap,
    Json(req):    Json<AnswerRequest>,
) -> Result<StatusCode, ApiError> {
    state.authorize(&headers)?;
    let id = decode_request_id(&req.request_id)?;
    let payload = decode_b64(&req.payload_b64, "payload_b64")?;
    if state.0.hub.answer_intelligence(&id, payload) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(api_error(StatusCode::NOT_FOUND, "no pending query with that request_id"))
    }
}

async fn recommendation_request(
    State(state): State<BridgeState>,
    headers:      HeaderMap,
    Json(req):    Json<RecommendRequest>,
) -> Result<Json<Vec<RecommendOutcome>>, ApiError> {
    state.authorize(&headers)?;
    let payload = decode_b64(&req.payload_b64, "payload_b64")?;
    let peers = req
        .peers
        .iter()
        .map(|p| p.parse::<PeerId>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("peers: {e}")))?;

    let outcomes = state
        .0
        .recommendations
        .request_many(peers, payload, req.timeout_ms.map(Duration::from_millis))
        .await
        .into_iter()
        .map(|(peer, outcome)| match outcome {
            Ok(payload) => RecommendOutcome {
                peer_id:     peer.to_string(),
                payload_b64: Some(B64.encode(payload)),
                error:       None,
            },
            Err(e) => RecommendOutcome {
                peer_id:     peer.to_string(),
                payload_b64: None,
                error:       Some(e.to_string()),
            },
        })
        .collect();
    Ok(Json(outcomes))
}

async fn recommendation_answer(
    State(state): State<BridgeState>,
    headers:      HeaderMap,
    Json(req):    Json<AnswerRequest>,
) -> Result<StatusCode, ApiError> {
    state.authorize(&headers)?;
    let id = decode_request_id(&req.request_id)?;
    let payload = decode_b64(&req.payload_b64, "payload_b64")?;
    if state.0.hub.answer_recommendation(&id, payload) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(api_error(StatusCode::NOT_FOUND, "no pending recommendation with that request_id"))
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn decode_b64(value: &str, field: &str) -> Result<Vec<u8>, ApiError> {
    B64.decode(value)
        .map_err(|_| api_error(StatusCode::BAD_REQUEST, format!("{field}: invalid base64")))
}

fn decode_request_id(value: &str) -> Result<RequestId, ApiError> {
    hex::decode(value)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "request_id must be 16 bytes of hex"))
}

/// Constant-time string comparison for bearer tokens.
fn ct_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let len = a.len().max(b.len());
    let mut diff = u8::from(a.len() != b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= x ^ y;
    }
    diff == 0
}
