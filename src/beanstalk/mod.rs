//! Client side of the beanstalkd work-queue protocol.

mod client;
mod connection;
mod error;
mod job;
mod pool;

pub use client::{ClientSettings, QueueClient};
#[cfg(test)]
pub use connection::{ByteStream, QueueConnection};
pub use connection::{ConnectionSettings, DEFAULT_MAX_IDLE_POLLS, DEFAULT_READ_POLL_INTERVAL_MS};
pub use error::QueueError;
pub use job::{Job, JobSpec, DEFAULT_TUBE};
pub use pool::{ClientPool, JobProducer, DEFAULT_MAX_IDLE_CLIENTS};
