use std::collections::{btree_map::Entry, BTreeMap};

use iris_protocol::{
    body::{IntelligenceResponse, ResponseEntry, ResponseStatus},
    Envelope, ProtocolError, RequestId,
};
use libp2p::PeerId;

/// Accumulated answers for one request, keyed by responding peer.
///
/// Merging is commutative and idempotent: one payload is kept per peer, the
/// smallest one seen, and the status only ever gets worse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateResult {
    pub request_id: RequestId,
    pub status:     ResponseStatus,
    pub responses:  BTreeMap<PeerId, Vec<u8>>,
}

impl AggregateResult {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            status:    ResponseStatus::Complete,
            responses: BTreeMap::new(),
        }
    }

    /// Result handed out when a request could not run at all.
    pub fn failed(request_id: RequestId) -> Self {
        Self { status: ResponseStatus::PartialError, ..Self::new(request_id) }
    }

    /// Insert one answer. Returns false if `responder` already answered.
    ///
    /// Conflicting payloads for one responder resolve to the lexicographically
    /// smallest, so the outcome does not depend on arrival order.
    pub fn insert(&mut self, responder: PeerId, payload: Vec<u8>) -> bool {
        match self.responses.entry(responder) {
            Entry::Occupied(mut slot) => {
                if payload < *slot.get() {
                    slot.insert(payload);
                }
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(payload);
                true
            }
        }
    }

    pub fn degrade(&mut self, status: ResponseStatus) {
        self.status = self.status.worst(status);
    }

    /// Merge a child's aggregate. Entries with unparseable peer ids are
    /// skipped. Returns the number of new responders.
    pub fn merge_response(&mut self, response: &IntelligenceResponse) -> usize {
        self.degrade(response.status);
        let mut added = 0;
        for entry in &response.entries {
            match PeerId::from_bytes(&entry.responder) {
                Ok(peer) => {
                    if self.insert(peer, entry.payload.clone()) {
                        added += 1;
                    }
                }
                Err(e) => tracing::debug!("Skipping response entry with bad peer id: {e}"),
            }
        }
        added
    }

    pub fn to_response(&self) -> IntelligenceResponse {
        IntelligenceResponse {
            status:  self.status,
            entries: self
                .responses
                .iter()
                .map(|(peer, payload)| ResponseEntry {
                    responder: peer.to_bytes(),
                    payload:   payload.clone(),
                })
                .collect(),
        }
    }

    /// Wrap the aggregate in a response envelope that fits `MAX_MESSAGE_SIZE`.
    ///
    /// While the encoded envelope is too large the largest payload is dropped
    /// and the status degrades to `partial-error`. Returns the envelope and the
    /// number of entries dropped.
    pub fn fit_envelope(&mut self) -> Result<(Envelope, usize), ProtocolError> {
        let mut dropped = 0;
        loop {
            let envelope = Envelope::new(self.request_id, &self.to_response())?;
            match envelope.to_cbor() {
                Ok(_) => return Ok((envelope, dropped)),
                Err(e @ ProtocolError::EnvelopeTooLarge { .. }) => {
                    let largest = self
                        .responses
                        .iter()
                        .max_by_key(|(_, payload)| payload.len())
                        .map(|(peer, _)| *peer);
                    let Some(peer) = largest else { return Err(e) };
                    self.responses.remove(&peer);
                    self.degrade(ResponseStatus::PartialError);
                    dropped += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }
}
