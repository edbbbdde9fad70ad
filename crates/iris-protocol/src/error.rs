use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message type: {0:#04x}")]
    UnknownMsgType(u16),

    #[error("envelope too large: {size} bytes exceeds {limit}")]
    EnvelopeTooLarge { size: usize, limit: usize },

    #[error("unexpected body for {expected}, envelope carries {actual}")]
    UnexpectedBody { expected: String, actual: String },

    #[error("CBOR encode error: {0}")]
    CborEncode(String),

    #[error("CBOR decode error: {0}")]
    CborDecode(String),

    #[error("malformed attestation: {0}")]
    MalformedAttestation(String),

    #[error("attestation signature does not verify for organisation {0}")]
    InvalidAttestation(String),
}
