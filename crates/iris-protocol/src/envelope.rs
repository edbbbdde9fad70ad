use ciborium::value::Value;
use rand::{rngs::OsRng, RngCore};

use crate::{
    body::Body,
    constants::{MAX_MESSAGE_SIZE, PROTOCOL_VERSION, REQUEST_ID_LEN},
    error::ProtocolError,
    message::MsgType,
};

/// Collision-resistant request identifier chosen by the originator.
pub type RequestId = [u8; REQUEST_ID_LEN];

/// Draw a fresh request identifier from the OS RNG.
pub fn new_request_id() -> RequestId {
    let mut id = [0u8; REQUEST_ID_LEN];
    OsRng.fill_bytes(&mut id);
    id
}

/// Canonical iris envelope.
///
/// Encoded as a CBOR array `[version, msg_type, request_id, body]`, where
/// `body` is the CBOR encoding of the typed message body selected by
/// `msg_type`. Responses reuse the request id of the request they answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Protocol version, currently 0x01.
    pub version: u8,
    pub msg_type: MsgType,
    pub request_id: RequestId,
    /// Encoded message body.
    pub body: Vec<u8>,
}

impl Envelope {
    /// Encode `body` and wrap it in an envelope of the matching type.
    pub fn new<B: Body>(request_id: RequestId, body: &B) -> Result<Self, ProtocolError> {
        let mut buf = Vec::new();
        ciborium::into_writer(body, &mut buf)
            .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;
        Ok(Self {
            version: PROTOCOL_VERSION,
            msg_type: B::MSG_TYPE,
            request_id,
            body: buf,
        })
    }

    /// Decode the body as `B`, failing if the envelope carries another type.
    pub fn decode_body<B: Body>(&self) -> Result<B, ProtocolError> {
        if self.msg_type != B::MSG_TYPE {
            return Err(ProtocolError::UnexpectedBody {
                expected: B::MSG_TYPE.to_string(),
                actual: self.msg_type.to_string(),
            });
        }
        ciborium::from_reader(self.body.as_slice())
            .map_err(|e| ProtocolError::CborDecode(e.to_string()))
    }

    /// Encode to CBOR bytes, enforcing `MAX_MESSAGE_SIZE`.
    pub fn to_cbor(&self) -> Result<Vec<u8>, ProtocolError> {
        let value = Value::Array(vec![
            Value::Integer(self.version.into()),
            Value::Integer(self.msg_type.as_u16().into()),
            Value::Bytes(self.request_id.to_vec()),
            Value::Bytes(self.body.clone()),
        ]);

        let mut buf = Vec::new();
        ciborium::into_writer(&value, &mut buf)
            .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;
        Self::check_size(buf.len())?;
        Ok(buf)
    }

    /// Decode from CBOR bytes.
    pub fn from_cbor(data: &[u8]) -> Result<Self, ProtocolError> {
        Self::check_size(data.len())?;
        let value: Value = ciborium::from_reader(data)
            .map_err(|e| ProtocolError::CborDecode(e.to_string()))?;

        let arr = match value {
            Value::Array(a) => a,
            _ => return Err(ProtocolError::CborDecode("expected array".into())),
        };

        if arr.len() != 4 {
            return Err(ProtocolError::CborDecode(
                format!("expected 4 fields, got {}", arr.len()),
            ));
        }

        let version = u8_from_value(&arr[0])?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let msg_type   = MsgType::from_u16(u16_from_value(&arr[1])?)?;
        let request_id = request_id_from_value(&arr[2])?;
        let body       = bytes_from_value(&arr[3])?;

        Ok(Self { version, msg_type, request_id, body })
    }

    /// Check total encoded size is within MAX_MESSAGE_SIZE.
    pub fn check_size(encoded_len: usize) -> Result<(), ProtocolError> {
        if encoded_len > MAX_MESSAGE_SIZE {
            Err(ProtocolError::EnvelopeTooLarge {
                size: encoded_len,
                limit: MAX_MESSAGE_SIZE,
            })
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// CBOR decoding helpers
// ---------------------------------------------------------------------------

fn u8_from_value(v: &Value) -> Result<u8, ProtocolError> {
    match v {
        Value::Integer(i) => {
            let n: i128 = (*i).into();
            n.try_into().map_err(|_| ProtocolError::CborDecode("u8 overflow".into()))
        }
        _ => Err(ProtocolError::CborDecode("expected integer".into())),
    }
}

fn u16_from_value(v: &Value) -> Result<u16, ProtocolError> {
    match v {
        Value::Integer(i) => {
            let n: i128 = (*i).into();
            n.try_into().map_err(|_| ProtocolError::CborDecode("u16 overflow".into()))
        }
        _ => Err(ProtocolError::CborDecode("expected integer".into())),
    }
}

fn bytes_from_value(v: &Value) -> Result<Vec<u8>, ProtocolError> {
    match v {
        Value::Bytes(b) => Ok(b.clone()),
        _ => Err(ProtocolError::CborDecode("expected bytes".into())),
    }
}

fn request_id_from_value(v: &Value) -> Result<RequestId, ProtocolError> {
    let b = bytes_from_value(v)?;
    b.try_into().map_err(|_| ProtocolError::CborDecode("expected 16-byte request id".into()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{IntelligenceRequest, RecommendationRequest};
    use serde_bytes::ByteBuf;

    fn dummy_request() -> IntelligenceRequest {
        IntelligenceRequest {
            ttl: 3,
            timeout_ms: 1_500,
            path: vec![ByteBuf::from(vec![1, 2, 3])],
            query: b"is 10.0.0.1 malicious?".to_vec(),
        }
    }

    #[test]
    fn envelope_survives_the_wire() {
        let id = new_request_id();
        let env = Envelope::new(id, &dummy_request()).unwrap();
        let decoded = Envelope::from_cbor(&env.to_cbor().unwrap()).unwrap();

        assert_eq!(decoded, env);
        assert_eq!(decoded.msg_type, MsgType::IntelligenceRequest);
        let body: IntelligenceRequest = decoded.decode_body().unwrap();
        assert_eq!(body.ttl, 3);
        assert_eq!(body.path[0].to_vec(), vec![1, 2, 3]);
    }

    #[test]
    fn wrong_body_type_rejected() {
        let env = Envelope::new(new_request_id(), &dummy_request()).unwrap();
        assert!(matches!(
            env.decode_body::<RecommendationRequest>(),
            Err(ProtocolError::UnexpectedBody { .. })
        ));
    }

    #[test]
    fn foreign_version_rejected() {
        let mut env = Envelope::new(new_request_id(), &dummy_request()).unwrap();
        env.version = 0x02;
        let bytes = env.to_cbor().unwrap();
        assert!(matches!(
            Envelope::from_cbor(&bytes),
            Err(ProtocolError::UnsupportedVersion(0x02))
        ));
    }

    #[test]
    fn unknown_msg_type_rejected() {
        let value = Value::Array(vec![
            Value::Integer(PROTOCOL_VERSION.into()),
            Value::Integer(0x7Fu16.into()),
            Value::Bytes(vec![0u8; REQUEST_ID_LEN]),
            Value::Bytes(vec![]),
        ]);
        let mut buf = Vec::new();
        ciborium::into_writer(&value, &mut buf).unwrap();
        assert!(matches!(
            Envelope::from_cbor(&buf),
            Err(ProtocolError::UnknownMsgType(0x7F))
        ));
    }

    #[test]
    fn oversized_envelope_rejected() {
        assert!(Envelope::check_size(MAX_MESSAGE_SIZE).is_ok());
        assert!(matches!(
            Envelope::check_size(MAX_MESSAGE_SIZE + 1),
            Err(ProtocolError::EnvelopeTooLarge { .. })
        ));
    }

    #[test]
    fn request_ids_are_distinct() {
        assert_ne!(new_request_id(), new_request_id());
    }
}
