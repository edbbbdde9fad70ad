use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// A signed claim that a peer belongs to an organisation.
///
/// The organisation identifier is the base58 encoding of the organisation's
/// Ed25519 verifying key, so the identifier is also the material needed to
/// check the signature. The signature covers the raw bytes of the attested
/// peer id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgAttestation {
    pub organisation: String,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl OrgAttestation {
    /// Organisation identifier for a verifying key.
    pub fn org_id(key: &VerifyingKey) -> String {
        bs58::encode(key.to_bytes()).into_string()
    }

    /// Sign `subject` (peer id bytes) on behalf of the organisation owning `org_key`.
    pub fn sign(org_key: &SigningKey, subject: &[u8]) -> Self {
        let sig: Signature = org_key.sign(subject);
        Self {
            organisation: Self::org_id(&org_key.verifying_key()),
            signature: sig.to_bytes().to_vec(),
        }
    }

    /// Verify that the organisation signed `subject`.
    pub fn verify(&self, subject: &[u8]) -> Result<(), ProtocolError> {
        let key_bytes: [u8; 32] = bs58::decode(&self.organisation)
            .into_vec()
            .map_err(|e| ProtocolError::MalformedAttestation(format!("organisation id: {e}")))?
            .try_into()
            .map_err(|_| ProtocolError::MalformedAttestation("organisation id must be 32 bytes".into()))?;
        let key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| ProtocolError::MalformedAttestation(format!("organisation key: {e}")))?;

        let sig_bytes: [u8; 64] = self.signature.as_slice()
            .try_into()
            .map_err(|_| ProtocolError::MalformedAttestation("signature must be 64 bytes".into()))?;
        let sig = Signature::from_bytes(&sig_bytes);

        key.verify(subject, &sig)
            .map_err(|_| ProtocolError::InvalidAttestation(self.organisation.clone()))
    }
}

/// Text form used on the command line: `<organisation>:<base58 signature>`.
impl FromStr for OrgAttestation {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (organisation, sig) = s.trim().split_once(':').ok_or_else(|| {
            ProtocolError::MalformedAttestation(format!("expected <org>:<signature>, got '{s}'"))
        })?;
        if organisation.is_empty() {
            return Err(ProtocolError::MalformedAttestation("empty organisation id".into()));
        }
        let signature = bs58::decode(sig)
            .into_vec()
            .map_err(|e| ProtocolError::MalformedAttestation(format!("signature: {e}")))?;
        if signature.len() != 64 {
            return Err(ProtocolError::MalformedAttestation(
                format!("signature must be 64 bytes, got {}", signature.len()),
            ));
        }
        Ok(Self { organisation: organisation.to_string(), signature })
    }
}

impl std::fmt::Display for OrgAttestation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.organisation, bs58::encode(&self.signature).into_string())
    }
}
