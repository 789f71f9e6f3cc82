//! Ingestion protocol spoken by reporting clients.
//!
//! A connection introduces itself with a fixed 20-byte message, is told to go
//! ahead, wait or upgrade, and may then send exactly one JSON report.

mod connection;
mod error;
mod handler;
mod lookup;
mod protocol;
mod registry;
mod submission;

pub use connection::Connection;
pub use error::IntakeError;
pub use handler::{
    IntakeHandler, IntakePolicy, DEFAULT_MAX_MESSAGE_SIZE_BYTES, DEFAULT_SUBMISSION_TTR_SECONDS,
};
pub use protocol::DEFAULT_SUPPORTED_VERSION;
#[cfg(test)]
pub use protocol::{
    DataReply, Introduction, IntroductionReply, IntroductionStatus, Stage, NO_DATA_RESPONSE,
};
pub use registry::ConnectionRegistry;
pub use submission::ReportSubmission;
