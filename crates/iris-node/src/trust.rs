use std::collections::HashSet;

use iris_protocol::OrgAttestation;
use libp2p::PeerId;

/// Outcome of checking a peer's attestations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustDecision {
    pub trusted: bool,
    /// Trustworthy organisations whose attestation verified.
    pub organisations: Vec<String>,
}

/// Decides whether a peer's organisation membership is acceptable.
///
/// Stateless apart from the configured allow-list. A peer is trusted iff at
/// least one attestation names a trustworthy organisation AND that
/// organisation's signature over the peer id verifies.
#[derive(Debug, Clone, Default)]
pub struct TrustEngine {
    trustworthy: HashSet<String>,
}

impl TrustEngine {
    pub fn new(trustworthy: impl IntoIterator<Item = String>) -> Self {
        Self { trustworthy: trustworthy.into_iter().collect() }
    }

    pub fn is_trusted(&self, peer: &PeerId, attestations: &[OrgAttestation]) -> bool {
        self.evaluate(peer, attestations).trusted
    }

    pub fn evaluate(&self, peer: &PeerId, attestations: &[OrgAttestation]) -> TrustDecision {
        let subject = peer.to_bytes();
        let mut organisations = Vec::new();
        for att in attestations {
            if !self.trustworthy.contains(&att.organisation) {
                tracing::trace!(%peer, org = %att.organisation, "Attestation for untrusted organisation");
                continue;
            }
            match att.verify(&subject) {
                Ok(()) => {
                    if !organisations.contains(&att.organisation) {
                        organisations.push(att.organisation.clone());
                    }
                }
                // Not fatal: the peer just does not gain trust from this one.
                Err(e) => tracing::debug!(%peer, "Attestation rejected: {e}"),
            }
        }
        TrustDecision { trusted: !organisations.is_empty(), organisations }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn org() -> (SigningKey, String) {
        let key = SigningKey::generate(&mut OsRng);
        let id = OrgAttestation::org_id(&key.verifying_key());
        (key, id)
    }

    #[test]
    fn attestation_from_trustworthy_org_is_trusted() {
        let (key, id) = org();
        let engine = TrustEngine::new([id.clone()]);
        let peer = PeerId::random();
        let att = OrgAttestation::sign(&key, &peer.to_bytes());

        let decision = engine.evaluate(&peer, &[att]);
        assert!(decision.trusted);
        assert_eq!(decision.organisations, vec![id]);
    }

    #[test]
    fn no_attestations_is_untrusted() {
        let (_, id) = org();
        let engine = TrustEngine::new([id]);
        assert!(!engine.is_trusted(&PeerId::random(), &[]));
    }

    #[test]
    fn valid_signature_from_unlisted_org_is_untrusted() {
        let (listed, _) = org();
        let (other_key, _) = org();
        let engine = TrustEngine::new([OrgAttestation::org_id(&listed.verifying_key())]);
        let peer = PeerId::random();
        let att = OrgAttestation::sign(&other_key, &peer.to_bytes());
        assert!(!engine.is_trusted(&peer, &[att]));
    }

    #[test]
    fn attestation_copied_from_another_peer_is_untrusted() {
        let (key, id) = org();
        let engine = TrustEngine::new([id]);
        let victim = PeerId::random();
        let att = OrgAttestation::sign(&key, &victim.to_bytes());
        assert!(!engine.is_trusted(&PeerId::random(), &[att]));
    }

    #[test]
    fn one_good_attestation_among_bad_ones_is_enough() {
        let (key, id) = org();
        let (rogue, _) = org();
        let engine = TrustEngine::new([id]);
        let peer = PeerId::random();
        let bad = OrgAttestation::sign(&rogue, &peer.to_bytes());
        let good = OrgAttestation::sign(&key, &peer.to_bytes());
        assert!(engine.is_trusted(&peer, &[bad, good]));
    }
}
