use std::io;
use std::time::Duration;
use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::{
    identify, mdns, noise, request_response, tcp, yamux,
    swarm::NetworkBehaviour,
    Multiaddr, StreamProtocol,
};
use iris_protocol::constants::{IDENTIFY_PROTOCOL, IRIS_PROTOCOL, MAX_ACK_SIZE, MAX_MESSAGE_SIZE};

/// How long the swarm waits for a peer's ACK before reporting an
/// outbound failure.
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Combined behaviour
// ============================================================================

#[derive(NetworkBehaviour)]
pub struct IrisBehaviour {
    pub identify:         identify::Behaviour,
    /// Local-network peer discovery, dialed directly on discovery.
    pub mdns:             mdns::tokio::Behaviour,
    /// Carries every iris envelope; the response is only an ACK.
    pub request_response: request_response::Behaviour<IrisCodec>,
}

// ============================================================================
// Length-prefixed request-response codec
// ============================================================================

/// Simple 4-byte LE length prefix codec.
/// Request  = CBOR-encoded iris envelope (Vec<u8>)
/// Response = 3-byte ACK b"ACK"
#[derive(Clone, Default)]
pub struct IrisCodec;

#[async_trait]
impl request_response::Codec for IrisCodec {
    type Protocol = StreamProtocol;
    type Request  = Vec<u8>;
    type Response = Vec<u8>;

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T)
        -> io::Result<Self::Request>
    where T: AsyncRead + Unpin + Send {
        read_framed(io, MAX_MESSAGE_SIZE).await
    }

    async fn read_response<T>(&mut self, _: &Self::Protocol, io: &mut T)
        -> io::Result<Self::Response>
    where T: AsyncRead + Unpin + Send {
        read_framed(io, MAX_ACK_SIZE).await
    }

    async fn write_request<T>(&mut self, _: &Self::Protocol, io: &mut T, req: Self::Request)
        -> io::Result<()>
    where T: AsyncWrite + Unpin + Send {
        write_framed(io, &req).await
    }

    async fn write_response<T>(&mut self, _: &Self::Protocol, io: &mut T, res: Self::Response)
        -> io::Result<()>
    where T: AsyncWrite + Unpin + Send {
        write_framed(io, &res).await
    }
}

async fn read_framed<T: AsyncRead + Unpin>(io: &mut T, max: usize) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > max {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame exceeds limit"));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_framed<T: AsyncWrite + Unpin>(io: &mut T, data: &[u8]) -> io::Result<()> {
    io.write_all(&(data.len() as u32).to_le_bytes()).await?;
    io.write_all(data).await?;
    io.flush().await
}

// ============================================================================
// Swarm builder
// ============================================================================

/// Build the libp2p swarm and start listening on TCP and, where the listen
/// address allows it, QUIC on the same port.
pub fn build_swarm(
    keypair: libp2p::identity::Keypair,
    listen_addr: Multiaddr,
) -> anyhow::Result<libp2p::Swarm<IrisBehaviour>> {
    let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(tcp::Config::default(), noise::Config::new, yamux::Config::default)?
        .with_quic()
        .with_dns()?
        .with_behaviour(|key| {
            let peer_id = key.public().to_peer_id();

            let mdns =
                mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id)
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>)?;

            let identify = identify::Behaviour::new(identify::Config::new(
                IDENTIFY_PROTOCOL.to_string(),
                key.public(),
            ));

            let request_response = request_response::Behaviour::<IrisCodec>::new(
                [(
                    StreamProtocol::new(IRIS_PROTOCOL),
                    request_response::ProtocolSupport::Full,
                )],
                request_response::Config::default().with_request_timeout(ACK_TIMEOUT),
            );

            Ok(IrisBehaviour { identify, mdns, request_response })
        })?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    swarm.listen_on(listen_addr.clone())?;

    // TCP and UDP can share the same port number without conflict.
    if let Some(quic_addr) = to_quic_addr(&listen_addr) {
        match swarm.listen_on(quic_addr.clone()) {
            Ok(_)  => tracing::info!("Also listening on QUIC: {quic_addr}"),
            Err(e) => tracing::warn!("QUIC listen failed for {quic_addr}: {e}"),
        }
    }

    Ok(swarm)
}

/// Derive a QUIC listen address from a TCP listen address.
///
/// /ip4/X.X.X.X/tcp/PORT → /ip4/X.X.X.X/udp/PORT/quic-v1
/// Returns None if the address contains no /tcp component.
pub fn to_quic_addr(tcp_addr: &Multiaddr) -> Option<Multiaddr> {
    use libp2p::multiaddr::Protocol;
    let mut new_addr = Multiaddr::empty();
    let mut found = false;
    for proto in tcp_addr.iter() {
        match proto {
            Protocol::Tcp(port) => {
                new_addr.push(Protocol::Udp(port));
                new_addr.push(Protocol::QuicV1);
                found = true;
            }
            other => new_addr.push(other),
        }
    }
    if found { Some(new_addr) } else { None }
}

/// Peer id carried in a `/p2p/...` suffix, if any.
pub fn peer_id_of(addr: &Multiaddr) -> Option<libp2p::PeerId> {
    addr.iter().find_map(|p| match p {
        libp2p::multiaddr::Protocol::P2p(pid) => Some(pid),
        _ => None,
    })
}
