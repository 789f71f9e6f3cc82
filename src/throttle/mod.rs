use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::logging::{LogLevel, Logger};
use crate::storage::StorageError;

pub const DEFAULT_THROTTLE_WINDOW_SECONDS: u64 = 1_800;
pub const DEFAULT_LOOKUP_FAILURE_WAIT_SECONDS: u64 = 60;

/// Last-accepted-submission timestamps, one per reporting entity.
pub trait ThrottleStore: Send + Sync {
    fn last_submission(&self, entity: Uuid) -> Result<Option<DateTime<Utc>>, StorageError>;
    fn record_submission(&self, entity: Uuid, at: DateTime<Utc>) -> Result<(), StorageError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThrottlePolicy {
    pub window_seconds: u64,
    pub lookup_failure_wait_seconds: u64,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            window_seconds: DEFAULT_THROTTLE_WINDOW_SECONDS,
            lookup_failure_wait_seconds: DEFAULT_LOOKUP_FAILURE_WAIT_SECONDS,
        }
    }
}

impl ThrottlePolicy {
    /// Seconds the entity still has to wait. A failed lookup yields the
    /// fallback wait, never zero.
    pub fn wait_seconds(
        &self,
        store: &dyn ThrottleStore,
        entity: Uuid,
        now: DateTime<Utc>,
        logger: &Logger,
    ) -> u64 {
        match store.last_submission(entity) {
            Ok(last) => remaining_wait_seconds(last, now, self.window_seconds),
            Err(error) => {
                logger.log(
                    LogLevel::Warn,
                    Some("throttle::lookup"),
                    "Throttle lookup failed; applying fallback wait",
                    Some(json!({
                        "entity": entity.to_string(),
                        "fallback_wait_seconds": self.lookup_failure_wait_seconds,
                        "error": error.to_string(),
                    })),
                );
                self.lookup_failure_wait_seconds
            }
        }
    }
}

/// Whole seconds left in the window, rounded up so that any time still inside
/// the window reports at least one second. A timestamp in the future counts
/// as a fresh submission.
pub fn remaining_wait_seconds(
    last: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    window_seconds: u64,
) -> u64 {
    let Some(last) = last else {
        return 0;
    };

    let elapsed_ms = (now - last).num_milliseconds().max(0);
    let window_ms = i64::try_from(window_seconds)
        .unwrap_or(i64::MAX / 1_000)
        .saturating_mul(1_000);
    let remaining_ms = window_ms.saturating_sub(elapsed_ms);
    if remaining_ms <= 0 {
        return 0;
    }

    ((remaining_ms + 999) / 1_000) as u64
}
