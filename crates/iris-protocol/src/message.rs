use crate::error::ProtocolError;

/// All iris message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MsgType {
    /// Session opener: "these are my organisation attestations"
    Hello = 0x01,
    /// Single hop: "what do you think of X?"
    RecommendationRequest = 0x02,
    /// Single hop answer, correlated by request id
    RecommendationResponse = 0x03,
    /// Multi hop: "does anyone know about X?"
    IntelligenceRequest = 0x04,
    /// Aggregated answers of a subtree, sent back to the parent
    IntelligenceResponse = 0x05,
}

impl MsgType {
    pub fn from_u16(v: u16) -> Result<Self, ProtocolError> {
        match v {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::RecommendationRequest),
            0x03 => Ok(Self::RecommendationResponse),
            0x04 => Ok(Self::IntelligenceRequest),
            0x05 => Ok(Self::IntelligenceResponse),
            other => Err(ProtocolError::UnknownMsgType(other)),
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Hello => "HELLO",
            Self::RecommendationRequest => "RECOMMENDATION_REQUEST",
            Self::RecommendationResponse => "RECOMMENDATION_RESPONSE",
            Self::IntelligenceRequest => "INTELLIGENCE_REQUEST",
            Self::IntelligenceResponse => "INTELLIGENCE_RESPONSE",
        };
        write!(f, "{}", name)
    }
}
