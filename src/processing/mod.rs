//! Background persistence of queued reports.

mod pool;
mod worker;

#[cfg(test)]
pub use worker::JobOutcome;
pub use pool::WorkerPool;
pub use worker::{ProcessWorker, ReportSink, WorkerOptions, DEFAULT_RECONNECT_BACKOFF};
