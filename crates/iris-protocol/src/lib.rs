pub mod attestation;
pub mod body;
pub mod constants;
pub mod envelope;
pub mod error;
pub mod message;

pub use attestation::OrgAttestation;
pub use constants::*;
pub use envelope::{new_request_id, Envelope, RequestId};
pub use error::ProtocolError;
pub use message::MsgType;
