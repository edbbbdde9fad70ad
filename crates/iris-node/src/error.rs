use libp2p::PeerId;
use thiserror::Error;

/// Failure to hand a message to a peer.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),
    #[error("outbound failure: {0}")]
    Outbound(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("node event loop is gone")]
    Closed,
}

/// Why an intelligence request was not (fully) processed.
///
/// None of these reach the caller of a query: they are absorbed per request
/// or per forward and only shape the aggregate.
#[derive(Debug, Error)]
pub enum IntelligenceError {
    #[error("peer {0} failed the organisation trust check")]
    UntrustedPeer(PeerId),
    #[error("budget exhausted (ttl {ttl}, {remaining_ms}ms left)")]
    BudgetExhausted { ttl: u32, remaining_ms: u64 },
    #[error("forward to {peer} failed: {source}")]
    TransportFailure {
        peer:   PeerId,
        #[source]
        source: TransportError,
    },
    #[error("request {0} already seen")]
    DuplicateRequest(String),
}

#[derive(Debug, Error)]
pub enum RecommendationError {
    #[error("no recommendation from {0} before the timeout")]
    TimedOut(PeerId),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
