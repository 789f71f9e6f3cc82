use std::fmt;
use std::path::PathBuf;

use uuid::Uuid;

#[derive(Debug)]
pub enum StorageError {
    UnsupportedEngine {
        engine: String,
    },
    InvalidSledMode {
        mode: String,
    },
    MissingDatabaseName,
    HomeDirectoryUnavailable,
    CreateDataDir {
        path: PathBuf,
        source: std::io::Error,
    },
    SerializeReport(serde_json::Error),
    CorruptThrottleRecord {
        entity: Uuid,
    },
    Sled(sled::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedEngine { engine } => write!(
                f,
                "unsupported storage.engine '{}'; currently only 'sled' is supported",
                engine
            ),
            Self::InvalidSledMode { mode } => write!(
                f,
                "invalid storage.sled.mode '{}'; allowed values: low_space, high_throughput",
                mode
            ),
            Self::MissingDatabaseName => {
                write!(f, "storage.database must name a database")
            }
            Self::HomeDirectoryUnavailable => {
                write!(f, "cannot resolve storage path because HOME is not set")
            }
            Self::CreateDataDir { path, source } => write!(
                f,
                "failed to create storage data directory '{}': {source}",
                path.display()
            ),
            Self::SerializeReport(source) => {
                write!(f, "failed to serialize report for storage: {source}")
            }
            Self::CorruptThrottleRecord { entity } => {
                write!(f, "throttle record for entity {entity} is not a valid timestamp")
            }
            Self::Sled(source) => write!(f, "sled storage error: {source}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CreateDataDir { source, .. } => Some(source),
            Self::SerializeReport(source) => Some(source),
            Self::Sled(source) => Some(source),
            _ => None,
        }
    }
}
