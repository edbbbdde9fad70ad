use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;
use iris_protocol::OrgAttestation;
use libp2p::Multiaddr;
use thiserror::Error;

use crate::intelligence::IntelligenceSettings;

/// Startup-time configuration failure. Fatal: the node never serves with an
/// invalid configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot generate a new key and load one from a file at the same time")]
    ConflictingIdentity,
    #[error("specify either --generate-new-key or --load-key-from-file")]
    MissingIdentity,
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("propagation margin ({margin_ms}ms) must be smaller than max parent timeout ({max_parent_ms}ms)")]
    MarginTooLarge { margin_ms: u64, max_parent_ms: u64 },
    #[error("--use-dns is set but no --dns-seed was given")]
    MissingDnsSeeds,
    #[error("invalid organisation signature '{value}': {reason}")]
    InvalidOrgSignature { value: String, reason: String },
}

#[derive(Parser, Debug, Clone)]
#[command(name = "iris-node", about = "iris overlay node: recommendation and intelligence protocols")]
pub struct Config {
    /// libp2p listen multiaddr.
    #[arg(long, env = "IRIS_LISTEN_ADDR", default_value = "/ip4/0.0.0.0/tcp/9000")]
    pub listen_addr: Multiaddr,

    // ── Identity ─────────────────────────────────────────────────────────────

    /// Generate a fresh Ed25519 identity on startup.
    #[arg(long, env = "IRIS_GENERATE_NEW_KEY", default_value_t = false)]
    pub generate_new_key: bool,

    /// Load the 32-byte Ed25519 secret key from this file.
    #[arg(long, env = "IRIS_LOAD_KEY_FROM_FILE")]
    pub load_key_from_file: Option<PathBuf>,

    /// Save the identity key to this file (owner-only permissions).
    #[arg(long, env = "IRIS_SAVE_KEY_TO_FILE")]
    pub save_key_to_file: Option<PathBuf>,

    // ── Peer discovery ───────────────────────────────────────────────────────

    /// Static peer multiaddrs (can repeat).
    #[arg(long = "peer", env = "IRIS_PEERS", value_delimiter = ',')]
    pub peers: Vec<Multiaddr>,

    /// Resolve the --dns-seed names into peer candidates.
    #[arg(long, env = "IRIS_USE_DNS", default_value_t = false)]
    pub use_dns: bool,

    /// DNS seed as host:port (can repeat).
    #[arg(long = "dns-seed", env = "IRIS_DNS_SEEDS", value_delimiter = ',')]
    pub dns_seeds: Vec<String>,

    /// Remember addresses of connected peers and dial them again after restart.
    #[arg(long, env = "IRIS_USE_ADDRESS_CACHE", default_value_t = false)]
    pub use_address_cache: bool,

    /// File backing the address cache.
    #[arg(long, env = "IRIS_ADDRESS_CACHE", default_value = "iris-peers.json")]
    pub address_cache: PathBuf,

    /// Seconds between discovery rounds.
    #[arg(long, env = "IRIS_DISCOVERY_INTERVAL_SECS", default_value_t = 60)]
    pub discovery_interval_secs: u64,

    // ── External bridge ──────────────────────────────────────────────────────

    /// Bridge listen address (HTTP + WebSocket). If absent, the bridge is not
    /// started and this node contributes no local answers.
    #[arg(long, env = "IRIS_BRIDGE_ADDR")]
    pub bridge_addr: Option<SocketAddr>,

    /// Bearer token required by mutating bridge routes.
    #[arg(long, env = "IRIS_BRIDGE_SECRET")]
    pub bridge_secret: Option<String>,

    // ── Recommendation protocol ──────────────────────────────────────────────

    /// How long to wait for a recommendation response.
    #[arg(long, env = "IRIS_RECOMMENDATION_TIMEOUT_MS", default_value_t = 5_000)]
    pub recommendation_timeout_ms: u64,

    // ── Intelligence protocol ────────────────────────────────────────────────

    /// Deepest TTL this node accepts; higher incoming TTLs are clamped.
    #[arg(long, env = "IRIS_INTELLIGENCE_MAX_TTL", default_value_t = 5)]
    pub max_ttl: u32,

    /// TTL set on intelligence requests this node originates.
    #[arg(long, env = "IRIS_INTELLIGENCE_TTL", default_value_t = 3)]
    pub ttl: u32,

    /// Longest this node waits on behalf of a parent, whatever the parent asks.
    #[arg(long, env = "IRIS_INTELLIGENCE_MAX_PARENT_TIMEOUT_MS", default_value_t = 10_000)]
    pub max_parent_timeout_ms: u64,

    /// Budget of intelligence requests this node originates.
    #[arg(long, env = "IRIS_INTELLIGENCE_ROOT_TIMEOUT_MS", default_value_t = 20_000)]
    pub root_timeout_ms: u64,

    /// Time reserved for local aggregation, send-back latency and clock skew.
    #[arg(long, env = "IRIS_INTELLIGENCE_PROPAGATION_MARGIN_MS", default_value_t = 250)]
    pub propagation_margin_ms: u64,

    /// How long a finished request id is remembered after its deadline.
    #[arg(long, env = "IRIS_INTELLIGENCE_SEEN_RETENTION_SECS", default_value_t = 120)]
    pub seen_retention_secs: u64,

    /// Answer requests from untrusted peers locally (they are never forwarded).
    #[arg(long, env = "IRIS_ANSWER_UNTRUSTED", default_value_t = true, action = clap::ArgAction::Set)]
    pub answer_untrusted: bool,

    // ── Organisations ────────────────────────────────────────────────────────

    /// Trustworthy organisation id (base58 Ed25519 key, can repeat).
    #[arg(long = "trustworthy-org", env = "IRIS_TRUSTWORTHY_ORGS", value_delimiter = ',')]
    pub trustworthy_orgs: Vec<String>,

    /// This node's membership proof as <org>:<base58 signature> (can repeat).
    #[arg(long = "org-signature", env = "IRIS_ORG_SIGNATURES", value_delimiter = ',')]
    pub org_signatures: Vec<String>,
}

impl Config {
    /// Validate option combinations. Called once before the node starts.
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.generate_new_key && self.load_key_from_file.is_some() {
            return Err(ConfigError::ConflictingIdentity);
        }
        if !self.generate_new_key && self.load_key_from_file.is_none() {
            return Err(ConfigError::MissingIdentity);
        }
        if self.recommendation_timeout_ms == 0 {
            return Err(ConfigError::ZeroDuration("--recommendation-timeout-ms"));
        }
        if self.root_timeout_ms == 0 {
            return Err(ConfigError::ZeroDuration("--root-timeout-ms"));
        }
        if self.max_parent_timeout_ms == 0 {
            return Err(ConfigError::ZeroDuration("--max-parent-timeout-ms"));
        }
        if self.propagation_margin_ms >= self.max_parent_timeout_ms {
            return Err(ConfigError::MarginTooLarge {
                margin_ms:     self.propagation_margin_ms,
                max_parent_ms: self.max_parent_timeout_ms,
            });
        }
        if self.use_dns && self.dns_seeds.is_empty() {
            return Err(ConfigError::MissingDnsSeeds);
        }
        self.org_attestations()?;
        if self.ttl > self.max_ttl {
            tracing::warn!(
                ttl = self.ttl,
                max_ttl = self.max_ttl,
                "--ttl exceeds --max-ttl; originated requests will be clamped",
            );
        }
        Ok(())
    }

    /// Parse this node's own organisation attestations.
    pub fn org_attestations(&self) -> Result<Vec<OrgAttestation>, ConfigError> {
        self.org_signatures
            .iter()
            .map(|s| {
                s.parse::<OrgAttestation>().map_err(|e| ConfigError::InvalidOrgSignature {
                    value:  s.clone(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    pub fn recommendation_timeout(&self) -> Duration {
        Duration::from_millis(self.recommendation_timeout_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs.max(1))
    }

    pub fn intelligence_settings(&self) -> IntelligenceSettings {
        IntelligenceSettings {
            max_ttl:            self.max_ttl,
            ttl:                self.ttl,
            max_parent_timeout: Duration::from_millis(self.max_parent_timeout_ms),
            root_timeout:       Duration::from_millis(self.root_timeout_ms),
            propagation_margin: Duration::from_millis(self.propagation_margin_ms),
            seen_retention:     Duration::from_secs(self.seen_retention_secs),
            answer_untrusted:   self.answer_untrusted,
        }
    }
}
