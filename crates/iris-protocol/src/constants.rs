// ============================================================================
// Protocol constants
// ============================================================================

/// Protocol version carried in every envelope.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// libp2p stream protocol for all iris messages.
pub const IRIS_PROTOCOL: &str = "/iris/p2p/1.0.0";

/// libp2p identify protocol version string.
pub const IDENTIFY_PROTOCOL: &str = "/iris/identify/1.0.0";

// --- Transport --------------------------------------------------------------

/// Maximum encoded envelope size in bytes. Intelligence responses carry the
/// whole aggregate of a subtree, so this is larger than a single answer.
pub const MAX_MESSAGE_SIZE: usize = 1_048_576; // 1 MiB

/// Acknowledgement returned for every delivered request.
pub const ACK: &[u8] = b"ACK";

/// Maximum size of an acknowledgement frame.
pub const MAX_ACK_SIZE: usize = 64;

// --- Request identifiers ----------------------------------------------------

/// Length of a request identifier in bytes.
pub const REQUEST_ID_LEN: usize = 16;
