use std::{collections::HashMap, sync::Arc};

use libp2p::PeerId;
use serde::Serialize;
use tokio::{sync::RwLock, time::Instant};

/// Maximum number of concurrently tracked sessions.
/// Connections beyond this are not registered and therefore never used as
/// forward targets.
const MAX_SESSIONS: usize = 10_000;

/// Per-session state of a connected peer.
#[derive(Debug, Clone)]
pub struct Session {
    /// Organisation trust decision:
    ///   None        = Hello not received yet
    ///   Some(true)  = at least one attestation verified against a trustworthy org
    ///   Some(false) = checked and rejected
    pub trust: Option<bool>,
    /// Organisations whose attestations verified.
    pub organisations: Vec<String>,
    pub connected_at: Instant,
}

#[derive(Clone, Serialize)]
pub struct SessionSnapshot {
    pub peer_id:       String,
    pub trusted:       Option<bool>,
    pub organisations: Vec<String>,
    pub connected_ms:  u64,
}

/// Registry of currently connected peers, shared by the event loop, the
/// protocol handlers and the bridge.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<PeerId, Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session. Returns false when the registry is full.
    pub async fn connect(&self, peer: PeerId) -> bool {
        let mut sessions = self.inner.write().await;
        if !sessions.contains_key(&peer) && sessions.len() >= MAX_SESSIONS {
            tracing::warn!(%peer, "Session registry full, not tracking peer");
            return false;
        }
        sessions.entry(peer).or_insert_with(|| Session {
            trust:         None,
            organisations: Vec::new(),
            connected_at:  Instant::now(),
        });
        true
    }

    pub async fn disconnect(&self, peer: &PeerId) {
        self.inner.write().await.remove(peer);
    }

    /// Record the trust decision for the lifetime of this session.
    pub async fn set_trust(&self, peer: &PeerId, trusted: bool, organisations: Vec<String>) {
        if let Some(session) = self.inner.write().await.get_mut(peer) {
            session.trust = Some(trusted);
            session.organisations = organisations;
        }
    }

    /// Unknown and unverified peers are untrusted.
    pub async fn is_trusted(&self, peer: &PeerId) -> bool {
        matches!(self.inner.read().await.get(peer), Some(Session { trust: Some(true), .. }))
    }

    pub async fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner.read().await.contains_key(peer)
    }

    pub async fn connected(&self) -> Vec<PeerId> {
        self.inner.read().await.keys().copied().collect()
    }

    pub async fn trusted_peers(&self) -> Vec<PeerId> {
        self.inner
            .read()
            .await
            .iter()
            .filter(|(_, s)| s.trust == Some(true))
            .map(|(p, _)| *p)
            .collect()
    }

    pub async fn snapshot(&self) -> Vec<SessionSnapshot> {
        let now = Instant::now();
        self.inner
            .read()
            .await
            .iter()
            .map(|(peer, s)| SessionSnapshot {
                peer_id:       peer.to_string(),
                trusted:       s.trust,
                organisations: s.organisations.clone(),
                connected_ms:  now.duration_since(s.connected_at).as_millis() as u64,
            })
            .collect()
    }
}
