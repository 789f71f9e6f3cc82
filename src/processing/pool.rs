use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::json;

use crate::beanstalk::ClientSettings;
use crate::logging::{LogLevel, Logger};

use super::{ProcessWorker, ReportSink, WorkerOptions};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub enum WorkerPoolError {
    NoWorkers,
    Spawn { index: usize, source: io::Error },
}

impl fmt::Display for WorkerPoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoWorkers => write!(f, "worker pool needs at least one worker"),
            Self::Spawn { index, source } => {
                write!(f, "failed to spawn report worker {index}: {source}")
            }
        }
    }
}

impl std::error::Error for WorkerPoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn { source, .. } => Some(source),
            Self::NoWorkers => None,
        }
    }
}

struct WorkerHandle {
    index: usize,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

/// Fixed set of report workers, each on its own thread with its own broker
/// client.
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    logger: Logger,
}

impl WorkerPool {
    pub fn start(
        count: usize,
        settings: &ClientSettings,
        sink: Arc<dyn ReportSink>,
        logger: &Logger,
        options: WorkerOptions,
    ) -> Result<Self, WorkerPoolError> {
        if count == 0 {
            return Err(WorkerPoolError::NoWorkers);
        }

        let mut pool = Self {
            workers: Vec::with_capacity(count),
            logger: logger.clone(),
        };
        for index in 0..count {
            let worker = ProcessWorker::new(
                index,
                settings.clone(),
                Arc::clone(&sink),
                logger.clone(),
                options,
            );
            let running = worker.running_flag();
            let spawned = thread::Builder::new()
                .name(format!("report-worker-{index}"))
                .spawn(move || worker.run());

            match spawned {
                Ok(thread) => pool.workers.push(WorkerHandle {
                    index,
                    running,
                    thread: Some(thread),
                }),
                Err(source) => {
                    pool.stop(Duration::ZERO);
                    return Err(WorkerPoolError::Spawn { index, source });
                }
            }
        }

        logger.log(
            LogLevel::Info,
            Some("processing::pool"),
            "Report workers started",
            Some(json!({
                "workers": count,
                "tube": settings.tube,
                "reserve_timeout_seconds": options.reserve_timeout_seconds,
                "bury_malformed": options.bury_malformed,
            })),
        );
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn running_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|worker| worker.thread.is_some())
            .count()
    }

    /// Asks every worker to stop and joins those that finish within
    /// `drain_timeout`. Workers still blocked in a reserve are detached.
    /// Returns how many were detached.
    pub fn stop(&mut self, drain_timeout: Duration) -> usize {
        for worker in &self.workers {
            worker.running.store(false, Ordering::SeqCst);
        }

        let deadline = Instant::now() + drain_timeout;
        loop {
            for worker in &mut self.workers {
                if worker
                    .thread
                    .as_ref()
                    .is_some_and(|thread| thread.is_finished())
                {
                    if let Some(thread) = worker.thread.take() {
                        if thread.join().is_err() {
                            self.logger.log(
                                LogLevel::Error,
                                Some("processing::pool"),
                                "Report worker panicked",
                                Some(json!({ "worker": worker.index })),
                            );
                        }
                    }
                }
            }

            if self.running_count() == 0 || Instant::now() >= deadline {
                break;
            }
            thread::sleep(STOP_POLL_INTERVAL);
        }

        let detached = self.running_count();
        for worker in &mut self.workers {
            worker.thread.take();
        }
        if detached > 0 {
            self.logger.log(
                LogLevel::Warn,
                Some("processing::pool"),
                "Detached report workers still waiting on the broker",
                Some(json!({ "detached": detached })),
            );
        }
        detached
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.running.store(false, Ordering::SeqCst);
        }
    }
}
