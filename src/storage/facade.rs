use std::fs;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::intake::ReportSubmission;
use crate::logging::{LogLevel, Logger};
use crate::processing::ReportSink;
use crate::throttle::ThrottleStore;

use super::{
    resolve_data_path, CollectionNames, SledMode, SledStorage, StorageBackend, StorageEngine,
    StorageError,
};

pub struct StorageFacade {
    backend: Box<dyn StorageBackend>,
}

impl StorageFacade {
    /// Opens `<storage.path>/<storage.database>` with the configured engine.
    pub fn initialize(app_config: &AppConfig, logger: &Logger) -> Result<Self, StorageError> {
        let storage = &app_config.storage;
        let engine = StorageEngine::from_config(&storage.engine)?;
        let data_path = resolve_data_path(&storage.path, &storage.database)?;
        let collections = CollectionNames {
            data: storage.collections.data.clone(),
            throttle: storage.collections.throttle.clone(),
        };

        logger.log(
            LogLevel::Info,
            Some("storage::init"),
            "Initializing storage facade",
            Some(json!({
                "engine": engine.as_str(),
                "configured_path": storage.path,
                "database": storage.database.trim(),
                "resolved_path": data_path.display().to_string(),
                "collections": {
                    "data": collections.data,
                    "throttle": collections.throttle,
                },
                "sled": {
                    "cache_capacity": storage.sled.cache_capacity,
                    "mode": storage.sled.mode
                }
            })),
        );

        fs::create_dir_all(&data_path).map_err(|source| StorageError::CreateDataDir {
            path: data_path.clone(),
            source,
        })?;

        let backend: Box<dyn StorageBackend> = match engine {
            StorageEngine::Sled => {
                let mode = SledMode::from_config(storage.sled.mode.as_deref())?;

                Box::new(SledStorage::open(
                    &data_path,
                    storage.sled.cache_capacity,
                    mode,
                    &collections,
                )?)
            }
        };

        logger.log(
            LogLevel::Info,
            Some("storage::init"),
            "Storage facade initialized",
            Some(json!({
                "engine": engine.as_str(),
                "resolved_path": data_path.display().to_string(),
                "stored_reports": backend.count_reports()?,
            })),
        );

        Ok(Self { backend })
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.backend.flush()
    }

    /// Stores `{job_id, stored_at, report}` under a fresh key and returns it.
    pub fn insert_report(
        &self,
        job_id: u64,
        report: &ReportSubmission,
    ) -> Result<Uuid, StorageError> {
        let key = Uuid::new_v4();
        let document = json!({
            "job_id": job_id,
            "stored_at": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "report": serde_json::to_value(report).map_err(StorageError::SerializeReport)?,
        });
        self.backend.insert_report(key, &document)?;
        Ok(key)
    }
}

impl ThrottleStore for StorageFacade {
    fn last_submission(&self, entity: Uuid) -> Result<Option<DateTime<Utc>>, StorageError> {
        let Some(at_ms) = self.backend.get_last_submission_ms(entity)? else {
            return Ok(None);
        };
        DateTime::<Utc>::from_timestamp_millis(at_ms)
            .map(Some)
            .ok_or(StorageError::CorruptThrottleRecord { entity })
    }

    fn record_submission(&self, entity: Uuid, at: DateTime<Utc>) -> Result<(), StorageError> {
        self.backend
            .upsert_last_submission_ms(entity, at.timestamp_millis())
    }
}

impl ReportSink for StorageFacade {
    fn store_report(&self, job_id: u64, report: &ReportSubmission) -> Result<(), StorageError> {
        self.insert_report(job_id, report).map(|_| ())
    }
}
