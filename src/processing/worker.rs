use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::json;

use crate::beanstalk::{ClientSettings, Job, QueueClient};
use crate::intake::ReportSubmission;
use crate::logging::{LogLevel, Logger};
use crate::storage::StorageError;

pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Destination for reports taken off the queue.
pub trait ReportSink: Send + Sync {
    fn store_report(&self, job_id: u64, report: &ReportSubmission) -> Result<(), StorageError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerOptions {
    /// `None` blocks in `reserve` until a job arrives.
    pub reserve_timeout_seconds: Option<u32>,
    /// Pause after any failed reserve or delete.
    pub reconnect_backoff: Duration,
    /// Park unreadable jobs with `bury` instead of deleting them.
    pub bury_malformed: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            reserve_timeout_seconds: None,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            bury_malformed: false,
        }
    }
}

/// What one pass of the worker loop did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Idle,
    Stored { job_id: u64 },
    DroppedMalformed { job_id: u64 },
    BuriedMalformed { job_id: u64 },
    DroppedUnpersisted { job_id: u64 },
    /// Reserved after stop was requested and handed back untouched.
    Released { job_id: u64 },
    QueueFailure,
}

pub struct ProcessWorker {
    index: usize,
    client: QueueClient,
    sink: Arc<dyn ReportSink>,
    logger: Logger,
    running: Arc<AtomicBool>,
    options: WorkerOptions,
}

impl ProcessWorker {
    pub fn new(
        index: usize,
        settings: ClientSettings,
        sink: Arc<dyn ReportSink>,
        logger: Logger,
        options: WorkerOptions,
    ) -> Self {
        Self {
            index,
            client: QueueClient::new(settings),
            sink,
            logger,
            running: Arc::new(AtomicBool::new(true)),
            options,
        }
    }

    #[cfg(test)]
    fn with_client(mut self, client: QueueClient) -> Self {
        self.client = client;
        self
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn run(mut self) {
        self.logger.log(
            LogLevel::Debug,
            Some("processing::worker"),
            "Report worker started",
            Some(json!({ "worker": self.index })),
        );

        while self.running.load(Ordering::SeqCst) {
            self.process_once();
        }

        self.client.close();
        self.logger.log(
            LogLevel::Debug,
            Some("processing::worker"),
            "Report worker stopped",
            Some(json!({ "worker": self.index })),
        );
    }

    /// Reserves at most one job and disposes of it. Stored, malformed and
    /// unpersisted jobs are all deleted, except that malformed jobs are
    /// buried when `bury_malformed` is set.
    pub fn process_once(&mut self) -> JobOutcome {
        let job = match self.client.reserve(self.options.reserve_timeout_seconds) {
            Ok(Some(job)) => job,
            Ok(None) => return JobOutcome::Idle,
            Err(error) => {
                self.logger.log(
                    LogLevel::Warn,
                    Some("processing::reserve"),
                    "Failed to reserve job",
                    Some(json!({
                        "worker": self.index,
                        "error": error.to_string(),
                        "disconnect": error.is_disconnect(),
                    })),
                );
                self.recover_from_queue_failure();
                return JobOutcome::QueueFailure;
            }
        };

        if !self.running.load(Ordering::SeqCst) {
            return self.hand_back(job.id);
        }

        let outcome = self.persist(&job);
        let disposal = match outcome {
            JobOutcome::DroppedMalformed { job_id } if self.options.bury_malformed => self
                .client
                .bury(job_id, 0)
                .map(|()| JobOutcome::BuriedMalformed { job_id }),
            _ => self.client.delete(job.id).map(|()| outcome),
        };

        match disposal {
            Ok(outcome) => outcome,
            Err(error) => {
                self.logger.log(
                    LogLevel::Warn,
                    Some("processing::dispose"),
                    "Failed to dispose of processed job",
                    Some(json!({
                        "worker": self.index,
                        "job_id": job.id,
                        "error": error.to_string(),
                    })),
                );
                self.recover_from_queue_failure();
                outcome
            }
        }
    }

    fn hand_back(&mut self, job_id: u64) -> JobOutcome {
        match self.client.release(job_id, 0, 0) {
            Ok(()) => {
                self.logger.log(
                    LogLevel::Info,
                    Some("processing::worker"),
                    "Released job reserved during shutdown",
                    Some(json!({ "worker": self.index, "job_id": job_id })),
                );
                JobOutcome::Released { job_id }
            }
            // The broker releases it on its own once the TTR runs out.
            Err(error) => {
                self.logger.log(
                    LogLevel::Warn,
                    Some("processing::worker"),
                    "Failed to release job during shutdown",
                    Some(json!({
                        "worker": self.index,
                        "job_id": job_id,
                        "error": error.to_string(),
                    })),
                );
                JobOutcome::QueueFailure
            }
        }
    }

    fn persist(&self, job: &Job) -> JobOutcome {
        let report: ReportSubmission = match serde_json::from_slice(&job.data) {
            Ok(report) => report,
            Err(error) => {
                self.logger.log(
                    LogLevel::Warn,
                    Some("processing::parse"),
                    "Dropping job with unreadable body",
                    Some(json!({
                        "worker": self.index,
                        "job_id": job.id,
                        "bytes": job.data.len(),
                        "bury": self.options.bury_malformed,
                        "error": error.to_string(),
                    })),
                );
                return JobOutcome::DroppedMalformed { job_id: job.id };
            }
        };

        match self.sink.store_report(job.id, &report) {
            Ok(()) => {
                self.logger.log(
                    LogLevel::Verbose,
                    Some("processing::store"),
                    "Report stored",
                    Some(json!({ "worker": self.index, "job_id": job.id })),
                );
                JobOutcome::Stored { job_id: job.id }
            }
            Err(error) => {
                self.logger.log(
                    LogLevel::Error,
                    Some("processing::store"),
                    "Dropping job that could not be stored",
                    Some(json!({
                        "worker": self.index,
                        "job_id": job.id,
                        "error": error.to_string(),
                    })),
                );
                JobOutcome::DroppedUnpersisted { job_id: job.id }
            }
        }
    }

    /// Swaps a reaped client for a fresh one, then backs off whether or not
    /// the connection survived.
    fn recover_from_queue_failure(&mut self) {
        if self.client.is_reaped() {
            let settings = self.client.settings().clone();
            self.client.close();
            self.client = QueueClient::new(settings);
        }
        if self.running.load(Ordering::SeqCst) && !self.options.reconnect_backoff.is_zero() {
            thread::sleep(self.options.reconnect_backoff);
        }
    }
}
