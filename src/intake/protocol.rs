use serde_json::json;
use uuid::Uuid;

use super::IntakeError;

pub const INTRODUCTION_SIZE_BYTES: usize = 20;
pub const DEFAULT_SUPPORTED_VERSION: i32 = 1;
pub const BAD_VERSION_MESSAGE: &[u8] = b"Bad version";
pub const NO_DATA_RESPONSE: &[u8] = b"No data should be sent.";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Introduction,
    Data,
    NoData,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Introduction => "introduction",
            Self::Data => "data",
            Self::NoData => "no_data",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntroductionStatus {
    GoAhead,
    BadVersion,
    Wait,
}

impl IntroductionStatus {
    pub fn code(self) -> u8 {
        match self {
            Self::GoAhead => 0,
            Self::BadVersion => 1,
            Self::Wait => 2,
        }
    }

    #[cfg(test)]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::GoAhead),
            1 => Some(Self::BadVersion),
            2 => Some(Self::Wait),
            _ => None,
        }
    }
}

/// `i32 version | u64 uuid_high | u64 uuid_low`, big-endian.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Introduction {
    pub version: i32,
    pub entity: Uuid,
}

impl Introduction {
    pub fn decode(bytes: &[u8]) -> Result<Self, IntakeError> {
        let Ok(bytes) = <&[u8; INTRODUCTION_SIZE_BYTES]>::try_from(bytes) else {
            return Err(IntakeError::MalformedIntroduction { size: bytes.len() });
        };

        let mut version = [0_u8; 4];
        let mut high = [0_u8; 8];
        let mut low = [0_u8; 8];
        version.copy_from_slice(&bytes[0..4]);
        high.copy_from_slice(&bytes[4..12]);
        low.copy_from_slice(&bytes[12..20]);

        Ok(Self {
            version: i32::from_be_bytes(version),
            entity: Uuid::from_u64_pair(u64::from_be_bytes(high), u64::from_be_bytes(low)),
        })
    }

    #[cfg(test)]
    pub fn encode(&self) -> [u8; INTRODUCTION_SIZE_BYTES] {
        let (high, low) = self.entity.as_u64_pair();
        let mut bytes = [0_u8; INTRODUCTION_SIZE_BYTES];
        bytes[0..4].copy_from_slice(&self.version.to_be_bytes());
        bytes[4..12].copy_from_slice(&high.to_be_bytes());
        bytes[12..20].copy_from_slice(&low.to_be_bytes());
        bytes
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IntroductionReply {
    pub status: IntroductionStatus,
    pub wait_seconds: u16,
}

impl IntroductionReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(3 + BAD_VERSION_MESSAGE.len());
        bytes.push(self.status.code());
        bytes.extend_from_slice(&self.wait_seconds.to_be_bytes());
        if self.status == IntroductionStatus::BadVersion {
            bytes.extend_from_slice(BAD_VERSION_MESSAGE);
        }
        bytes
    }

    /// Reads the fixed three-byte head of a reply; any trailing text is ignored.
    #[cfg(test)]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let [code, high, low, ..] = *bytes else {
            return None;
        };
        Some(Self {
            status: IntroductionStatus::from_code(code)?,
            wait_seconds: u16::from_be_bytes([high, low]),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataReply {
    Accepted,
    BadContent,
    IllegalType,
    InternalError,
}

impl DataReply {
    pub fn message(self) -> &'static str {
        match self {
            Self::Accepted => "Data accepted.",
            Self::BadContent => "Bad content.",
            Self::IllegalType => "The content provided was an illegal type.",
            Self::InternalError => "An internal error occurred whilst processing your data.",
        }
    }

    pub fn encode(self) -> Vec<u8> {
        let body = match self {
            Self::Accepted => json!({ "result": self.message() }),
            _ => json!({ "error": self.message() }),
        };
        body.to_string().into_bytes()
    }
}
