//! Peer address discovery.
//!
//! Candidates are the union of every enabled [`AddressSource`]. A source that
//! fails is logged and skipped; the others still contribute.

use std::{
    collections::HashSet,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use anyhow::Context;
use async_trait::async_trait;
use libp2p::{multiaddr::Protocol, Multiaddr};
use serde::{Deserialize, Serialize};

use crate::config::Config;

/// Upper bound on remembered addresses.
const MAX_CACHED_ADDRESSES: usize = 1_024;

#[async_trait]
pub trait AddressSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn addresses(&self) -> anyhow::Result<Vec<Multiaddr>>;
}

// ============================================================================
// Sources
// ============================================================================

/// Addresses given on the command line.
pub struct StaticSource(pub Vec<Multiaddr>);

#[async_trait]
impl AddressSource for StaticSource {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn addresses(&self) -> anyhow::Result<Vec<Multiaddr>> {
        Ok(self.0.clone())
    }
}

/// `host:port` seeds resolved with the system resolver.
pub struct DnsSource {
    pub seeds: Vec<String>,
}

#[async_trait]
impl AddressSource for DnsSource {
    fn name(&self) -> &'static str {
        "dns"
    }

    async fn addresses(&self) -> anyhow::Result<Vec<Multiaddr>> {
        let mut out = Vec::new();
        let mut failures = 0;
        for seed in &self.seeds {
            match tokio::net::lookup_host(seed.as_str()).await {
                Ok(resolved) => out.extend(resolved.map(|addr| socket_to_multiaddr(&addr))),
                Err(e) => {
                    failures += 1;
                    tracing::debug!(seed = %seed, "DNS seed lookup failed: {e}");
                }
            }
        }
        if failures > 0 && failures == self.seeds.len() {
            anyhow::bail!("none of {} DNS seeds resolved", self.seeds.len());
        }
        Ok(out)
    }
}

/// Addresses of previously connected peers, read from the cache file.
pub struct CacheSource {
    pub path: PathBuf,
}

#[async_trait]
impl AddressSource for CacheSource {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn addresses(&self) -> anyhow::Result<Vec<Multiaddr>> {
        Ok(AddressCache::load(&self.path).await?.addresses())
    }
}

pub fn socket_to_multiaddr(addr: &SocketAddr) -> Multiaddr {
    let ip = match addr {
        SocketAddr::V4(v4) => Protocol::Ip4(*v4.ip()),
        SocketAddr::V6(v6) => Protocol::Ip6(*v6.ip()),
    };
    Multiaddr::empty().with(ip).with(Protocol::Tcp(addr.port()))
}

// ============================================================================
// Address cache
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    addresses: Vec<String>,
}

/// JSON file of peer addresses seen on established connections.
#[derive(Debug)]
pub struct AddressCache {
    path:      PathBuf,
    addresses: Vec<Multiaddr>,
    dirty:     bool,
}

impl AddressCache {
    pub fn empty(path: PathBuf) -> Self {
        Self { path, addresses: Vec::new(), dirty: false }
    }

    /// Load the cache; a missing file is an empty cache.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let mut cache = Self::empty(path.to_path_buf());
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(cache),
            Err(e) => {
                return Err(e).with_context(|| format!("reading address cache {}", path.display()))
            }
        };
        let file: CacheFile = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing address cache {}", path.display()))?;
        for entry in file.addresses {
            match entry.parse::<Multiaddr>() {
                Ok(addr) => cache.push(addr),
                Err(e) => tracing::debug!("Skipping cached address '{entry}': {e}"),
            }
        }
        cache.dirty = false;
        Ok(cache)
    }

    /// Remember an address. Returns true if it was new.
    pub fn remember(&mut self, addr: Multiaddr) -> bool {
        if self.addresses.contains(&addr) {
            return false;
        }
        self.push(addr);
        true
    }

    fn push(&mut self, addr: Multiaddr) {
        if self.addresses.len() >= MAX_CACHED_ADDRESSES {
            self.addresses.remove(0);
        }
        self.addresses.push(addr);
        self.dirty = true;
    }

    /// Serialised contents to write back, if anything changed since the last
    /// snapshot. The write itself happens wherever the caller can block.
    pub fn snapshot(&mut self) -> anyhow::Result<Option<CacheSnapshot>> {
        if !self.dirty {
            return Ok(None);
        }
        let file = CacheFile { addresses: self.addresses.iter().map(|a| a.to_string()).collect() };
        let json = serde_json::to_vec_pretty(&file)?;
        self.dirty = false;
        Ok(Some(CacheSnapshot { path: self.path.clone(), json }))
    }

    /// Write the cache back if anything changed.
    pub async fn save(&mut self) -> anyhow::Result<()> {
        match self.snapshot()? {
            Some(snapshot) => snapshot.write().await,
            None => Ok(()),
        }
    }

    pub fn addresses(&self) -> Vec<Multiaddr> {
        self.addresses.clone()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// Point-in-time copy of an [`AddressCache`], detached from the event loop.
#[derive(Debug)]
pub struct CacheSnapshot {
    path: PathBuf,
    json: Vec<u8>,
}

impl CacheSnapshot {
    pub async fn write(self) -> anyhow::Result<()> {
        tokio::fs::write(&self.path, &self.json)
            .await
            .with_context(|| format!("writing address cache {}", self.path.display()))
    }
}

// ============================================================================
// Aggregator
// ============================================================================

#[derive(Default)]
pub struct DiscoveryAggregator {
    sources: Vec<Box<dyn AddressSource>>,
}

impl DiscoveryAggregator {
    pub fn new(sources: Vec<Box<dyn AddressSource>>) -> Self {
        Self { sources }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut sources: Vec<Box<dyn AddressSource>> = vec![Box::new(StaticSource(config.peers.clone()))];
        if config.use_dns {
            sources.push(Box::new(DnsSource { seeds: config.dns_seeds.clone() }));
        }
        if config.use_address_cache {
            sources.push(Box::new(CacheSource { path: config.address_cache.clone() }));
        }
        Self { sources }
    }

    /// Union of all sources, deduplicated, in first-seen order.
    pub async fn candidates(&self) -> Vec<Multiaddr> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for source in &self.sources {
            match source.addresses().await {
                Ok(addrs) => {
                    tracing::debug!(source = source.name(), count = addrs.len(), "Discovery source");
                    for addr in addrs {
                        if seen.insert(addr.clone()) {
                            out.push(addr);
                        }
                    }
                }
                Err(e) => tracing::warn!(source = source.name(), "Discovery source failed: {e:#}"),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    #[async_trait]
    impl AddressSource for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn addresses(&self) -> anyhow::Result<Vec<Multiaddr>> {
            anyhow::bail!("unreachable store")
        }
    }

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("iris-{name}-{}.json", rand::random::<u64>()))
    }

    #[tokio::test]
    async fn candidates_are_deduplicated_across_sources() {
        let agg = DiscoveryAggregator::new(vec![
            Box::new(StaticSource(vec![addr("/ip4/10.0.0.1/tcp/9000"), addr("/ip4/10.0.0.2/tcp/9000")])),
            Box::new(Failing),
            Box::new(StaticSource(vec![addr("/ip4/10.0.0.2/tcp/9000"), addr("/ip4/10.0.0.3/tcp/9000")])),
        ]);
        let got = agg.candidates().await;
        assert_eq!(
            got,
            vec![
                addr("/ip4/10.0.0.1/tcp/9000"),
                addr("/ip4/10.0.0.2/tcp/9000"),
                addr("/ip4/10.0.0.3/tcp/9000"),
            ]
        );
    }

    #[tokio::test]
    async fn dns_source_resolves_literal_addresses() {
        let src = DnsSource { seeds: vec!["127.0.0.1:9000".into()] };
        assert_eq!(src.addresses().await.unwrap(), vec![addr("/ip4/127.0.0.1/tcp/9000")]);

        let bad = DnsSource { seeds: vec!["not a host".into()] };
        assert!(bad.addresses().await.is_err());
    }

    #[test]
    fn socket_addresses_map_to_tcp_multiaddrs() {
        let v6: SocketAddr = "[::1]:7000".parse().unwrap();
        assert_eq!(socket_to_multiaddr(&v6), addr("/ip6/::1/tcp/7000"));
    }

    #[tokio::test]
    async fn cache_persists_and_feeds_the_cache_source() {
        let path = temp_path("cache");
        let mut cache = AddressCache::load(&path).await.unwrap();
        assert!(cache.is_empty());
        assert!(cache.remember(addr("/ip4/10.0.0.9/tcp/9000")));
        assert!(!cache.remember(addr("/ip4/10.0.0.9/tcp/9000")));
        cache.save().await.unwrap();

        let reloaded = AddressCache::load(&path).await.unwrap();
        assert_eq!(reloaded.len(), 1);

        let src = CacheSource { path: path.clone() };
        assert_eq!(src.addresses().await.unwrap(), vec![addr("/ip4/10.0.0.9/tcp/9000")]);
        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn snapshot_is_taken_once_and_written_elsewhere() {
        let path = temp_path("snapshot");
        let mut cache = AddressCache::empty(path.clone());
        assert!(cache.snapshot().unwrap().is_none());

        cache.remember(addr("/ip4/10.0.0.7/tcp/9000"));
        let snapshot = cache.snapshot().unwrap().expect("dirty cache yields a snapshot");
        assert!(cache.snapshot().unwrap().is_none());

        // Changes after the snapshot are not part of it.
        cache.remember(addr("/ip4/10.0.0.8/tcp/9000"));
        tokio::spawn(snapshot.write()).await.unwrap().unwrap();

        let written = AddressCache::load(&path).await.unwrap();
        assert_eq!(written.addresses(), vec![addr("/ip4/10.0.0.7/tcp/9000")]);
        assert!(cache.snapshot().unwrap().is_some());
        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn corrupt_cache_is_an_error() {
        let path = temp_path("corrupt");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(AddressCache::load(&path).await.is_err());
        tokio::fs::remove_file(&path).await.ok();
    }

    #[test]
    fn cache_is_bounded() {
        let mut cache = AddressCache::empty(temp_path("bounded"));
        for port in 0..(MAX_CACHED_ADDRESSES as u16 + 5) {
            cache.remember(Multiaddr::empty().with(Protocol::Ip4([10, 0, 0, 1].into())).with(Protocol::Tcp(port)));
        }
        assert_eq!(cache.len(), MAX_CACHED_ADDRESSES);
        assert!(!cache.addresses().contains(&addr("/ip4/10.0.0.1/tcp/0")));
    }
}
