use super::StorageError;

/// Embedded engines the report store can run on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageEngine {
    Sled,
}

impl StorageEngine {
    pub fn from_config(raw: &str) -> Result<Self, StorageError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sled" => Ok(Self::Sled),
            _ => Err(StorageError::UnsupportedEngine {
                engine: raw.to_owned(),
            }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sled => "sled",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SledMode {
    LowSpace,
    HighThroughput,
}

impl SledMode {
    /// An absent mode leaves sled on its own default.
    pub fn from_config(raw: Option<&str>) -> Result<Option<Self>, StorageError> {
        let Some(raw) = raw else {
            return Ok(None);
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "low_space" => Ok(Some(Self::LowSpace)),
            "high_throughput" => Ok(Some(Self::HighThroughput)),
            _ => Err(StorageError::InvalidSledMode {
                mode: raw.to_owned(),
            }),
        }
    }

    pub fn into_sled(self) -> sled::Mode {
        match self {
            Self::LowSpace => sled::Mode::LowSpace,
            Self::HighThroughput => sled::Mode::HighThroughput,
        }
    }
}
