use serde_json::Value;
use uuid::Uuid;

use super::StorageError;

pub trait StorageBackend: Send + Sync {
    fn flush(&self) -> Result<(), StorageError>;
    fn insert_report(&self, key: Uuid, document: &Value) -> Result<(), StorageError>;
    fn count_reports(&self) -> Result<usize, StorageError>;
    fn get_last_submission_ms(&self, entity: Uuid) -> Result<Option<i64>, StorageError>;
    fn upsert_last_submission_ms(&self, entity: Uuid, at_ms: i64) -> Result<(), StorageError>;
}
