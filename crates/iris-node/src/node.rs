use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::StreamExt;
use libp2p::{
    core::ConnectedPoint, identify, mdns, request_response, swarm::SwarmEvent, Multiaddr, PeerId,
    Swarm,
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};

use iris_protocol::{body::Hello, new_request_id, Envelope, MsgType, OrgAttestation, ACK};

use crate::{
    bridge::{BridgeEvent, BridgeHub, BridgeState},
    config::Config,
    discovery::{AddressCache, DiscoveryAggregator},
    dispatch::Dispatcher,
    error::TransportError,
    intelligence::IntelligenceEngine,
    network::{peer_id_of, IrisBehaviour, IrisBehaviourEvent},
    recommendation::RecommendationHandler,
    responder::{LocalResponder, SilentResponder},
    sessions::SessionRegistry,
    transport::{SwarmCommand, SwarmHandle, Transport},
    trust::TrustEngine,
};

/// Depth of the handler → event loop command queue.
const COMMAND_BUFFER: usize = 1_024;
/// How often expired seen entries are evicted.
const SEEN_SWEEP_INTERVAL: Duration = Duration::from_secs(10);
/// How long shutdown waits for coordinators, then for the bridge.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);
/// A Hello is tried this many times before the session stays untrusted
/// on the remote side.
const HELLO_ATTEMPTS: u32 = 2;
const HELLO_RETRY_DELAY: Duration = Duration::from_millis(500);

type AckSender = oneshot::Sender<Result<(), TransportError>>;

// ============================================================================
// IrisNode
// ============================================================================

pub struct IrisNode {
    pub config:       Config,
    pub local_peer:   PeerId,
    pub sessions:     SessionRegistry,
    pub intelligence: IntelligenceEngine,
    dispatcher:       Dispatcher,
    /// Own organisation attestations, sent in every Hello.
    attestations:     Vec<OrgAttestation>,
    /// Present when --bridge-addr is configured.
    bridge:           Option<(Arc<BridgeHub>, BridgeState)>,
    bridge_stop:      watch::Sender<bool>,

    /// Loop-side sender for our own outbound messages such as Hello.
    handle:       SwarmHandle,
    /// Sends queued by the protocol handlers through [`SwarmHandle`].
    commands:     mpsc::Receiver<SwarmCommand>,
    /// Outbound request id → waiting sender, resolved on ACK or failure.
    pending_acks: HashMap<request_response::OutboundRequestId, AckSender>,

    discovery:     Arc<DiscoveryAggregator>,
    candidates_tx: mpsc::Sender<Vec<Multiaddr>>,
    candidates_rx: mpsc::Receiver<Vec<Multiaddr>>,
    address_cache: Option<AddressCache>,
}

impl IrisNode {
    pub async fn new(config: Config, local_peer: PeerId) -> anyhow::Result<Self> {
        let attestations = config.org_attestations()?;
        let (handle, commands) = SwarmHandle::new(COMMAND_BUFFER);
        let transport: Arc<dyn Transport> = Arc::new(handle.clone());

        let hub = config.bridge_addr.map(|_| BridgeHub::new());
        let responder: Arc<dyn LocalResponder> = match &hub {
            Some(hub) => hub.clone(),
            None => {
                tracing::info!("No --bridge-addr set; this node contributes no local answers.");
                Arc::new(SilentResponder)
            }
        };

        let sessions = SessionRegistry::new();
        let intelligence = IntelligenceEngine::new(
            local_peer,
            config.intelligence_settings(),
            sessions.clone(),
            transport.clone(),
            responder.clone(),
        );
        let recommendations = RecommendationHandler::new(transport, responder, config.recommendation_timeout());
        let dispatcher = Dispatcher {
            sessions:        sessions.clone(),
            trust:           Arc::new(TrustEngine::new(config.trustworthy_orgs.clone())),
            intelligence:    intelligence.clone(),
            recommendations: recommendations.clone(),
        };

        let bridge = hub.map(|hub| {
            let state = BridgeState::new(
                hub.clone(),
                intelligence.clone(),
                recommendations,
                sessions.clone(),
                config.bridge_secret.clone(),
            );
            (hub, state)
        });

        let address_cache = if config.use_address_cache {
            match AddressCache::load(&config.address_cache).await {
                Ok(cache) => Some(cache),
                Err(e) => {
                    tracing::warn!("Address cache unusable, starting empty: {e:#}");
                    Some(AddressCache::empty(config.address_cache.clone()))
                }
            }
        } else {
            None
        };

        let (candidates_tx, candidates_rx) = mpsc::channel(4);

        Ok(Self {
            discovery: Arc::new(DiscoveryAggregator::from_config(&config)),
            config,
            local_peer,
            sessions,
            intelligence,
            dispatcher,
            attestations,
            bridge,
            bridge_stop: watch::channel(false).0,
            handle,
            commands,
            pending_acks: HashMap::new(),
            candidates_tx,
            candidates_rx,
            address_cache,
        })
    }

    // ========================================================================
    // Main event loop
    // ========================================================================

    pub async fn run(&mut self, swarm: &mut Swarm<IrisBehaviour>) -> anyhow::Result<()> {
        let mut bridge_task = None;
        if let (Some((_, state)), Some(addr)) = (&self.bridge, self.config.bridge_addr) {
            let state = state.clone();
            let stop = self.bridge_stop.subscribe();
            bridge_task = Some(tokio::spawn(async move {
                if let Err(e) = crate::bridge::serve(state, addr, stop).await {
                    tracing::error!("Bridge stopped: {e:#}");
                }
            }));
        }

        let mut discovery_timer = tokio::time::interval(self.config.discovery_interval());
        let mut sweep_timer     = tokio::time::interval(SEEN_SWEEP_INTERVAL);
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                event = swarm.select_next_some() => {
                    self.handle_swarm_event(swarm, event).await;
                }
                Some(cmd) = self.commands.recv() => {
                    self.handle_command(swarm, cmd);
                }
                Some(candidates) = self.candidates_rx.recv() => {
                    self.dial_candidates(swarm, candidates);
                }
                _ = discovery_timer.tick() => {
                    self.start_discovery();
                }
                _ = sweep_timer.tick() => {
                    let evicted = self.intelligence.sweep_seen().await;
                    if evicted > 0 {
                        tracing::debug!(evicted, "Swept seen request ids");
                    }
                }
                _ = &mut shutdown => {
                    self.shutdown(bridge_task).await;
                    return Ok(());
                }
            }
        }
    }

    /// Finalize in-flight requests, stop the bridge, persist the cache.
    /// Every wait is bounded by [`SHUTDOWN_GRACE`].
    async fn shutdown(&mut self, bridge_task: Option<JoinHandle<()>>) {
        tracing::info!("Shutting down");
        if self.intelligence.shutdown_and_drain(SHUTDOWN_GRACE).await {
            tracing::debug!("All intelligence requests finalized");
        }
        self.bridge_stop.send_replace(true);
        if let Some(task) = bridge_task {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                tracing::warn!("Bridge did not stop within {SHUTDOWN_GRACE:?}");
            }
        }
        if let Some(cache) = self.address_cache.as_mut() {
            if let Err(e) = cache.save().await {
                tracing::warn!("Failed to save address cache: {e:#}");
            }
        }
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    /// Pull candidates off the loop; sources may wait on DNS or disk.
    /// The cache is written from the same task, before it is read back.
    fn start_discovery(&mut self) {
        let snapshot = match self.address_cache.as_mut().map(AddressCache::snapshot) {
            Some(Ok(snapshot)) => snapshot,
            Some(Err(e)) => {
                tracing::warn!("Failed to serialise address cache: {e:#}");
                None
            }
            None => None,
        };
        let discovery = self.discovery.clone();
        let tx = self.candidates_tx.clone();
        tokio::spawn(async move {
            if let Some(snapshot) = snapshot {
                if let Err(e) = snapshot.write().await {
                    tracing::warn!("Failed to save address cache: {e:#}");
                }
            }
            let candidates = discovery.candidates().await;
            let _ = tx.send(candidates).await;
        });
    }

    fn dial_candidates(&mut self, swarm: &mut Swarm<IrisBehaviour>, candidates: Vec<Multiaddr>) {
        for addr in candidates {
            if let Some(peer) = peer_id_of(&addr) {
                if peer == self.local_peer || swarm.is_connected(&peer) {
                    continue;
                }
            }
            if let Err(e) = swarm.dial(addr.clone()) {
                tracing::debug!("Dial {addr} failed: {e}");
            }
        }
    }

    // ========================================================================
    // Swarm events
    // ========================================================================

    async fn handle_swarm_event(
        &mut self,
        swarm: &mut Swarm<IrisBehaviour>,
        event: SwarmEvent<IrisBehaviourEvent>,
    ) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!("Listening on {address}");
            }
            SwarmEvent::ConnectionEstablished { peer_id, endpoint, num_established, .. } => {
                tracing::debug!("Connected to {peer_id} via {endpoint:?}");
                if let (ConnectedPoint::Dialer { address, .. }, Some(cache)) =
                    (&endpoint, self.address_cache.as_mut())
                {
                    cache.remember(address.clone());
                }
                if num_established.get() == 1 && self.sessions.connect(peer_id).await {
                    self.publish(BridgeEvent::PeerConnected { peer_id: peer_id.to_string() });
                    self.send_hello(peer_id);
                }
            }
            SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                tracing::debug!("Disconnected from {peer_id}");
                if num_established == 0 {
                    self.sessions.disconnect(&peer_id).await;
                    self.publish(BridgeEvent::PeerDisconnected { peer_id: peer_id.to_string() });
                }
            }
            SwarmEvent::Behaviour(behaviour_event) => {
                self.handle_behaviour_event(swarm, behaviour_event).await;
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                tracing::debug!("Outgoing connection error to {peer_id:?}: {error}");
            }
            _ => {}
        }
    }

    async fn handle_behaviour_event(
        &mut self,
        swarm: &mut Swarm<IrisBehaviour>,
        event: IrisBehaviourEvent,
    ) {
        match event {
            IrisBehaviourEvent::Mdns(mdns::Event::Discovered(peers)) => {
                for (peer_id, addr) in peers {
                    if swarm.is_connected(&peer_id) {
                        continue;
                    }
                    tracing::info!("mDNS discovered {peer_id} at {addr}");
                    let _ = swarm.dial(addr);
                }
            }
            IrisBehaviourEvent::Mdns(mdns::Event::Expired(peers)) => {
                for (peer_id, _addr) in peers {
                    tracing::debug!("mDNS expired {peer_id}");
                }
            }

            IrisBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                tracing::debug!("Identified {peer_id}: agent={}", info.agent_version);
            }
            IrisBehaviourEvent::Identify(_) => {}

            IrisBehaviourEvent::RequestResponse(request_response::Event::Message {
                peer,
                message,
                ..
            }) => match message {
                request_response::Message::Request { request, channel, .. } => {
                    // Always ACK immediately; the ACK only means "received".
                    let _ = swarm
                        .behaviour_mut()
                        .request_response
                        .send_response(channel, ACK.to_vec());
                    self.handle_inbound(peer, request).await;
                }
                request_response::Message::Response { request_id, response } => {
                    if response != ACK {
                        tracing::debug!("Unexpected ACK payload from {peer}: {:?}", response);
                    }
                    self.resolve_ack(request_id, Ok(()));
                }
            },
            IrisBehaviourEvent::RequestResponse(request_response::Event::OutboundFailure {
                peer, request_id, error, ..
            }) => {
                tracing::debug!("Outbound failure to {peer}: {error}");
                self.resolve_ack(request_id, Err(TransportError::Outbound(error.to_string())));
            }
            IrisBehaviourEvent::RequestResponse(request_response::Event::InboundFailure {
                peer, error, ..
            }) => {
                tracing::debug!("Inbound failure from {peer}: {error}");
            }
            IrisBehaviourEvent::RequestResponse(_) => {}
        }
    }

    async fn handle_inbound(&mut self, peer: PeerId, data: Vec<u8>) {
        let env = match Envelope::from_cbor(&data) {
            Ok(env) => env,
            Err(e) => {
                tracing::debug!("CBOR decode failed from {peer}: {e}");
                return;
            }
        };
        tracing::trace!(%peer, msg_type = %env.msg_type, request_id = %hex::encode(env.request_id), "Inbound");
        let is_hello = env.msg_type == MsgType::Hello;
        self.dispatcher.dispatch(peer, env).await;
        if is_hello {
            let trusted = self.sessions.is_trusted(&peer).await;
            self.publish(BridgeEvent::PeerTrust { peer_id: peer.to_string(), trusted });
        }
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    fn handle_command(&mut self, swarm: &mut Swarm<IrisBehaviour>, cmd: SwarmCommand) {
        match cmd {
            SwarmCommand::Send { peer, envelope, ack } => {
                if let Err(e) = self.send_envelope(swarm, peer, &envelope, ack) {
                    tracing::debug!(%peer, "Send rejected: {e}");
                }
            }
        }
    }

    /// Queue `env` on the swarm. `ack` resolves when the peer ACKs or the
    /// request fails; if the send is rejected here it is resolved at once.
    fn send_envelope(
        &mut self,
        swarm: &mut Swarm<IrisBehaviour>,
        peer:  PeerId,
        env:   &Envelope,
        ack:   AckSender,
    ) -> Result<(), TransportError> {
        let result = if !swarm.is_connected(&peer) {
            Err(TransportError::NotConnected(peer))
        } else {
            env.to_cbor().map_err(|e| TransportError::Encode(e.to_string()))
        };
        match result {
            Ok(cbor) => {
                let id = swarm.behaviour_mut().request_response.send_request(&peer, cbor);
                self.pending_acks.insert(id, ack);
                Ok(())
            }
            Err(e) => {
                let _ = ack.send(Err(e.clone()));
                Err(e)
            }
        }
    }

    fn resolve_ack(
        &mut self,
        id:     request_response::OutboundRequestId,
        result: Result<(), TransportError>,
    ) {
        if let Some(ack) = self.pending_acks.remove(&id) {
            let _ = ack.send(result);
        }
    }

    fn send_hello(&self, peer: PeerId) {
        let hello = Hello { attestations: self.attestations.clone() };
        let env = match Envelope::new(new_request_id(), &hello) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!("Failed to encode Hello: {e}");
                return;
            }
        };
        let handle = self.handle.clone();
        tokio::spawn(async move {
            deliver_hello(&handle, peer, env).await;
        });
    }

    fn publish(&self, event: BridgeEvent) {
        if let Some((hub, _)) = &self.bridge {
            hub.publish(event);
        }
    }
}

/// Send a Hello, retrying after a short delay. Returns false if every
/// attempt failed; the peer then keeps treating us as untrusted.
async fn deliver_hello(transport: &dyn Transport, peer: PeerId, env: Envelope) -> bool {
    for attempt in 1..=HELLO_ATTEMPTS {
        match transport.send(peer, env.clone()).await {
            Ok(()) => return true,
            Err(e) if attempt < HELLO_ATTEMPTS => {
                tracing::debug!(%peer, attempt, "Hello failed, retrying: {e}");
                tokio::time::sleep(HELLO_RETRY_DELAY).await;
            }
            Err(e) => tracing::warn!(%peer, "Hello not delivered, peer will not trust us: {e}"),
        }
    }
    false
}

/// Resolves on SIGINT, or on SIGTERM where the platform has it.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Cannot listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
