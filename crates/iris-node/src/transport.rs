//! The send capability the protocol handlers consume.
//!
//! Handlers never touch the swarm. They hold an `Arc<dyn Transport>`; in the
//! node that is a [`SwarmHandle`] feeding the event loop, in tests an
//! in-memory network.

use async_trait::async_trait;
use iris_protocol::Envelope;
use libp2p::PeerId;
use tokio::sync::{mpsc, oneshot};

use crate::error::TransportError;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver `envelope` to `peer`. Resolves once the peer acknowledged the
    /// message or the delivery failed. Safe for concurrent use.
    async fn send(&self, peer: PeerId, envelope: Envelope) -> Result<(), TransportError>;
}

/// Commands accepted by the swarm event loop.
pub enum SwarmCommand {
    Send {
        peer:     PeerId,
        envelope: Envelope,
        ack:      oneshot::Sender<Result<(), TransportError>>,
    },
}

/// Cloneable [`Transport`] backed by the swarm event loop.
#[derive(Clone)]
pub struct SwarmHandle {
    commands: mpsc::Sender<SwarmCommand>,
}

impl SwarmHandle {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<SwarmCommand>) {
        let (commands, rx) = mpsc::channel(buffer);
        (Self { commands }, rx)
    }
}

#[async_trait]
impl Transport for SwarmHandle {
    async fn send(&self, peer: PeerId, envelope: Envelope) -> Result<(), TransportError> {
        let (ack, rx) = oneshot::channel();
        self.commands
            .send(SwarmCommand::Send { peer, envelope, ack })
            .await
            .map_err(|_| TransportError::Closed)?;
        rx.await.map_err(|_| TransportError::Closed)?
    }
}
