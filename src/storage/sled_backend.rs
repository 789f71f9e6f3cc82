use std::path::Path;

use serde_json::Value;
use uuid::Uuid;

use super::{SledMode, StorageBackend, StorageError};

/// Tree names inside the sled database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionNames {
    pub data: String,
    pub throttle: String,
}

pub struct SledStorage {
    db: sled::Db,
    reports: sled::Tree,
    throttle: sled::Tree,
}

impl SledStorage {
    pub fn open(
        data_path: &Path,
        cache_capacity: Option<u64>,
        mode: Option<SledMode>,
        collections: &CollectionNames,
    ) -> Result<Self, StorageError> {
        let mut config = sled::Config::new().path(data_path);

        if let Some(cache_capacity) = cache_capacity {
            config = config.cache_capacity(cache_capacity);
        }

        if let Some(mode) = mode {
            config = config.mode(mode.into_sled());
        }

        let db = config.open().map_err(StorageError::Sled)?;
        let reports = db
            .open_tree(collections.data.as_bytes())
            .map_err(StorageError::Sled)?;
        let throttle = db
            .open_tree(collections.throttle.as_bytes())
            .map_err(StorageError::Sled)?;
        Ok(Self {
            db,
            reports,
            throttle,
        })
    }
}

impl StorageBackend for SledStorage {
    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map(|_| ()).map_err(StorageError::Sled)
    }

    fn insert_report(&self, key: Uuid, document: &Value) -> Result<(), StorageError> {
        let value = serde_json::to_vec(document).map_err(StorageError::SerializeReport)?;
        self.reports
            .insert(key.as_bytes(), value)
            .map_err(StorageError::Sled)?;
        Ok(())
    }

    fn count_reports(&self) -> Result<usize, StorageError> {
        Ok(self.reports.len())
    }

    fn get_last_submission_ms(&self, entity: Uuid) -> Result<Option<i64>, StorageError> {
        let Some(raw) = self
            .throttle
            .get(entity.as_bytes())
            .map_err(StorageError::Sled)?
        else {
            return Ok(None);
        };

        let bytes: [u8; 8] = raw[..]
            .try_into()
            .map_err(|_| StorageError::CorruptThrottleRecord { entity })?;
        Ok(Some(i64::from_be_bytes(bytes)))
    }

    fn upsert_last_submission_ms(&self, entity: Uuid, at_ms: i64) -> Result<(), StorageError> {
        self.throttle
            .insert(entity.as_bytes(), at_ms.to_be_bytes().to_vec())
            .map_err(StorageError::Sled)?;
        Ok(())
    }
}
