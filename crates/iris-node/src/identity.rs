use ed25519_dalek::SigningKey;
use libp2p::{identity, PeerId};
use rand::rngs::OsRng;
use std::path::Path;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use crate::config::Config;

/// Node identity: one Ed25519 secret drives the libp2p peer id.
pub struct NodeIdentity {
    pub signing_key:    SigningKey,
    pub libp2p_keypair: identity::Keypair,
}

impl NodeIdentity {
    pub fn generate() -> anyhow::Result<Self> {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    pub fn from_signing_key(signing_key: SigningKey) -> anyhow::Result<Self> {
        let libp2p_keypair = to_libp2p_keypair(&signing_key)?;
        Ok(Self { signing_key, libp2p_keypair })
    }

    /// Build the identity the configuration asks for: generate or load, then
    /// optionally persist. `Config::check` guarantees exactly one source.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let id = match &config.load_key_from_file {
            Some(path) => {
                let id = Self::load(path)?;
                tracing::info!(peer_id = %id.peer_id(), "Loaded identity from {:?}", path);
                id
            }
            None => {
                let id = Self::generate()?;
                tracing::info!(peer_id = %id.peer_id(), "Generated new identity");
                id
            }
        };
        if let Some(path) = &config.save_key_to_file {
            id.save(path)?;
            tracing::info!("Saved identity to {:?}", path);
        }
        Ok(id)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        use std::io::Write;
        // mode 0o600: owner read/write only.
        #[cfg(unix)]
        let mut file = std::fs::OpenOptions::new()
            .write(true).create(true).truncate(true).mode(0o600)
            .open(path)?;
        #[cfg(not(unix))]
        let mut file = std::fs::OpenOptions::new()
            .write(true).create(true).truncate(true)
            .open(path)?;
        file.write_all(&self.signing_key.to_bytes())?;
        Ok(())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("invalid key file: expected 32 bytes"))?;
        Self::from_signing_key(SigningKey::from_bytes(&arr))
    }

    pub fn peer_id(&self) -> PeerId {
        self.libp2p_keypair.public().to_peer_id()
    }
}

fn to_libp2p_keypair(signing_key: &SigningKey) -> anyhow::Result<identity::Keypair> {
    let mut bytes = signing_key.to_bytes();
    let secret = identity::ed25519::SecretKey::try_from_bytes(&mut bytes)
        .map_err(|e| anyhow::anyhow!("invalid ed25519 secret: {e}"))?;
    Ok(identity::Keypair::from(identity::ed25519::Keypair::from(secret)))
}
