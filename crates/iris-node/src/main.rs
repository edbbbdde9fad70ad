mod bridge;
mod config;
mod discovery;
mod dispatch;
mod error;
mod identity;
mod intelligence;
mod network;
mod node;
mod recommendation;
mod responder;
mod sessions;
#[cfg(test)]
mod testkit;
mod transport;
mod trust;

use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("iris_node=info,libp2p=warn")),
        )
        .init();

    let config = config::Config::parse();
    config.check()?;
    let identity = identity::NodeIdentity::from_config(&config)?;

    let mut swarm = network::build_swarm(
        identity.libp2p_keypair.clone(),
        config.listen_addr.clone(),
    )?;

    // Log the full multiaddr so operators can hand it to other nodes as --peer.
    tracing::info!(
        peer_id = %swarm.local_peer_id(),
        listen  = %config.listen_addr,
        "iris node multiaddr: {}/p2p/{}",
        config.listen_addr,
        swarm.local_peer_id(),
    );

    let mut node = node::IrisNode::new(config, *swarm.local_peer_id()).await?;
    node.run(&mut swarm).await
}
