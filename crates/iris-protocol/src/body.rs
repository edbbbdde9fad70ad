//! Typed message bodies carried inside an [`Envelope`](crate::Envelope).
//!
//! Peer identifiers travel as raw bytes so this crate stays independent of
//! the networking stack; the node converts them at the edge.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::{attestation::OrgAttestation, message::MsgType};

/// A message body bound to exactly one [`MsgType`].
pub trait Body: Serialize + for<'de> Deserialize<'de> {
    const MSG_TYPE: MsgType;
}

// ============================================================================
// Session
// ============================================================================

/// First message on every new session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hello {
    pub attestations: Vec<OrgAttestation>,
}

impl Body for Hello {
    const MSG_TYPE: MsgType = MsgType::Hello;
}

// ============================================================================
// Recommendation
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationRequest {
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Body for RecommendationRequest {
    const MSG_TYPE: MsgType = MsgType::RecommendationRequest;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationResponse {
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Body for RecommendationResponse {
    const MSG_TYPE: MsgType = MsgType::RecommendationResponse;
}

// ============================================================================
// Intelligence
// ============================================================================

/// Multi-hop query.
///
/// `timeout_ms` is the budget the sender is willing to wait, relative to the
/// moment the receiver gets the message. Absolute timestamps are never sent,
/// so clock skew between peers does not shrink or stretch budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntelligenceRequest {
    /// Remaining hop budget. Zero means answer locally only.
    pub ttl: u32,
    pub timeout_ms: u64,
    /// Peer ids of every node that already handled this request.
    pub path: Vec<ByteBuf>,
    /// Opaque search criteria.
    #[serde(with = "serde_bytes")]
    pub query: Vec<u8>,
}

impl Body for IntelligenceRequest {
    const MSG_TYPE: MsgType = MsgType::IntelligenceRequest;
}

/// Completion status of an aggregate, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Complete,
    PartialTimeout,
    PartialError,
}

impl ResponseStatus {
    /// The worse of two statuses. Commutative, associative and idempotent.
    pub fn worst(self, other: Self) -> Self {
        self.max(other)
    }
}

impl std::fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Complete => "complete",
            Self::PartialTimeout => "partial-timeout",
            Self::PartialError => "partial-error",
        };
        write!(f, "{}", name)
    }
}

/// One answer inside an aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEntry {
    /// Peer id bytes of the node that produced `payload`.
    #[serde(with = "serde_bytes")]
    pub responder: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// Aggregate of a subtree, sent from child to parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntelligenceResponse {
    pub status: ResponseStatus,
    pub entries: Vec<ResponseEntry>,
}

impl IntelligenceResponse {
    /// Reply for a request that was already handled via another path.
    pub fn duplicate() -> Self {
        Self { status: ResponseStatus::Complete, entries: Vec::new() }
    }
}

impl Body for IntelligenceResponse {
    const MSG_TYPE: MsgType = MsgType::IntelligenceResponse;
}
