//! Test doubles shared by the in-module test suites.

mod broker;
mod stream;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use broker::FakeBroker;
pub use stream::{ScriptStep, ScriptedStream};

use crate::beanstalk::{JobProducer, JobSpec, QueueError};
use crate::intake::ReportSubmission;
use crate::logging::{LogLevel, LogSink, Logger, LoggerConfig};
use crate::processing::ReportSink;
use crate::storage::StorageError;
use crate::throttle::ThrottleStore;

fn unavailable(operation: &str) -> StorageError {
    StorageError::Sled(sled::Error::Unsupported(format!("{operation} unavailable")))
}

#[derive(Default)]
pub struct MemoryLogSink {
    lines: Mutex<Vec<String>>,
}

impl MemoryLogSink {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().expect("log sink lock poisoned").clone()
    }
}

impl LogSink for MemoryLogSink {
    fn write_line(&self, line: &str) {
        self.lines
            .lock()
            .expect("log sink lock poisoned")
            .push(line.to_owned());
    }
}

pub fn quiet_logger() -> Logger {
    Logger::with_sink(
        LoggerConfig {
            min_level: LogLevel::Error,
            human_friendly: false,
        },
        Arc::new(MemoryLogSink::default()),
    )
}

pub fn recording_logger() -> (Logger, Arc<MemoryLogSink>) {
    let sink = Arc::new(MemoryLogSink::default());
    let logger = Logger::with_sink(
        LoggerConfig {
            min_level: LogLevel::Verbose,
            human_friendly: false,
        },
        sink.clone(),
    );
    (logger, sink)
}

#[derive(Default)]
pub struct MemoryThrottleStore {
    records: Mutex<HashMap<Uuid, DateTime<Utc>>>,
    fail_lookups: AtomicBool,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryThrottleStore {
    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn recorded(&self, entity: Uuid) -> Option<DateTime<Utc>> {
        self.records
            .lock()
            .expect("throttle store lock poisoned")
            .get(&entity)
            .copied()
    }
}

impl ThrottleStore for MemoryThrottleStore {
    fn last_submission(&self, entity: Uuid) -> Result<Option<DateTime<Utc>>, StorageError> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(unavailable("throttle lookup"));
        }
        Ok(self.recorded(entity))
    }

    fn record_submission(&self, entity: Uuid, at: DateTime<Utc>) -> Result<(), StorageError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(unavailable("throttle upsert"));
        }
        self.records
            .lock()
            .expect("throttle store lock poisoned")
            .insert(entity, at);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingProducer {
    jobs: Mutex<Vec<(JobSpec, Vec<u8>)>>,
    fail: AtomicBool,
}

impl RecordingProducer {
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn jobs(&self) -> Vec<(JobSpec, Vec<u8>)> {
        self.jobs.lock().expect("producer lock poisoned").clone()
    }
}

impl JobProducer for RecordingProducer {
    fn put(&self, spec: &JobSpec, data: &[u8]) -> Result<u64, QueueError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(QueueError::ConnectionClosed);
        }
        let mut jobs = self.jobs.lock().expect("producer lock poisoned");
        jobs.push((*spec, data.to_vec()));
        Ok(jobs.len() as u64)
    }
}

#[derive(Default)]
pub struct MemoryReportSink {
    reports: Mutex<Vec<(u64, ReportSubmission)>>,
    fail: AtomicBool,
}

impl MemoryReportSink {
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn reports(&self) -> Vec<(u64, ReportSubmission)> {
        self.reports.lock().expect("report sink lock poisoned").clone()
    }
}

impl ReportSink for MemoryReportSink {
    fn store_report(&self, job_id: u64, report: &ReportSubmission) -> Result<(), StorageError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(unavailable("report insert"));
        }
        self.reports
            .lock()
            .expect("report sink lock poisoned")
            .push((job_id, report.clone()));
        Ok(())
    }
}

/// A submission that passes sanitation, as the raw JSON a client would send.
pub fn sample_report_json() -> serde_json::Value {
    serde_json::json!({
        "system": {
            "java": "1.8.0_402",
            "cores": 8,
            "memory": 17_179_869_184_i64,
            "os": {"name": "Linux", "version": "6.1.0", "arch": "amd64"},
            "locale": "en_GB"
        },
        "minecraft": {
            "version": "1.20.4",
            "players": 12,
            "online_mode": true,
            "mod": {"name": "Paper", "version": "git-Paper-496"}
        },
        "plugins": [
            {"name": "Essentials", "version": "2.20.1"},
            {
                "name": "Vault",
                "version": "1.7.3",
                "data": [
                    {"name": "economy", "value": "iConomy"},
                    42,
                    {"name": "hooks", "value": [1, 2, 3]}
                ]
            },
            "not-a-plugin"
        ]
    })
}
