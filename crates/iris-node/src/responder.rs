use async_trait::async_trait;
use iris_protocol::RequestId;
use libp2p::PeerId;

/// Source of this node's own answers.
///
/// Callers bound every call with their own deadline, so implementations may
/// wait as long as they like.
#[async_trait]
pub trait LocalResponder: Send + Sync + 'static {
    /// This node's contribution to an intelligence query, if any.
    async fn intelligence(&self, request_id: &RequestId, query: &[u8]) -> Option<Vec<u8>>;

    /// This node's answer to a recommendation request from `from`, if any.
    async fn recommendation(&self, from: PeerId, request_id: &RequestId, payload: &[u8]) -> Option<Vec<u8>>;
}

/// Responder used when no bridge is configured: never answers.
pub struct SilentResponder;

#[async_trait]
impl LocalResponder for SilentResponder {
    async fn intelligence(&self, _: &RequestId, _: &[u8]) -> Option<Vec<u8>> {
        None
    }

    async fn recommendation(&self, _: PeerId, _: &RequestId, _: &[u8]) -> Option<Vec<u8>> {
        None
    }
}
