use std::sync::Arc;

use chrono::Utc;
use serde::de::IgnoredAny;
use serde_json::{json, Value};

use crate::beanstalk::{JobProducer, JobSpec};
use crate::logging::{LogLevel, Logger};
use crate::throttle::{ThrottlePolicy, ThrottleStore};

use super::protocol::{
    DataReply, Introduction, IntroductionReply, IntroductionStatus, Stage,
    DEFAULT_SUPPORTED_VERSION, INTRODUCTION_SIZE_BYTES, NO_DATA_RESPONSE,
};
use super::{Connection, IntakeError, ReportSubmission};

pub const DEFAULT_SUBMISSION_TTR_SECONDS: u32 = 300;
pub const DEFAULT_MAX_MESSAGE_SIZE_BYTES: usize = 65_536;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IntakePolicy {
    pub supported_version: i32,
    pub throttle: ThrottlePolicy,
    pub submission_ttr_seconds: u32,
    pub max_message_size_bytes: usize,
}

impl Default for IntakePolicy {
    fn default() -> Self {
        Self {
            supported_version: DEFAULT_SUPPORTED_VERSION,
            throttle: ThrottlePolicy::default(),
            submission_ttr_seconds: DEFAULT_SUBMISSION_TTR_SECONDS,
            max_message_size_bytes: DEFAULT_MAX_MESSAGE_SIZE_BYTES,
        }
    }
}

enum JsonFrame {
    Complete(usize),
    Incomplete,
    Invalid,
}

/// Drives one connection through introduction, data and no-data.
///
/// The handler owns no per-connection state; callers hand it the
/// [`Connection`] together with that connection's inbound bytes.
pub struct IntakeHandler {
    throttle: Arc<dyn ThrottleStore>,
    producer: Arc<dyn JobProducer>,
    policy: IntakePolicy,
    logger: Logger,
}

impl IntakeHandler {
    pub fn new(
        throttle: Arc<dyn ThrottleStore>,
        producer: Arc<dyn JobProducer>,
        policy: IntakePolicy,
        logger: Logger,
    ) -> Self {
        Self {
            throttle,
            producer,
            policy,
            logger,
        }
    }

    /// Splits complete messages off the front of `inbound` and answers each.
    /// Bytes of an unfinished message stay in the buffer.
    pub fn drain_inbound(
        &self,
        connection: &mut Connection,
        inbound: &mut Vec<u8>,
    ) -> Result<Vec<Vec<u8>>, IntakeError> {
        let mut replies = Vec::new();
        loop {
            match connection.stage() {
                Stage::Introduction => {
                    if inbound.len() < INTRODUCTION_SIZE_BYTES {
                        break;
                    }
                    let message: Vec<u8> = inbound.drain(..INTRODUCTION_SIZE_BYTES).collect();
                    replies.push(self.handle_introduction(connection, &message)?);
                }
                Stage::Data => {
                    skip_leading_whitespace(inbound);
                    if inbound.is_empty() {
                        break;
                    }
                    match frame_json(inbound) {
                        JsonFrame::Complete(size) => {
                            let message: Vec<u8> = inbound.drain(..size).collect();
                            replies.push(self.handle_data(connection, &message));
                        }
                        JsonFrame::Incomplete
                            if inbound.len() <= self.policy.max_message_size_bytes =>
                        {
                            break;
                        }
                        JsonFrame::Incomplete | JsonFrame::Invalid => {
                            let message = std::mem::take(inbound);
                            replies.push(self.handle_data(connection, &message));
                        }
                    }
                }
                Stage::NoData => {
                    skip_leading_whitespace(inbound);
                    if inbound.is_empty() {
                        break;
                    }
                    inbound.clear();
                    replies.push(NO_DATA_RESPONSE.to_vec());
                }
            }
        }
        Ok(replies)
    }

    pub fn handle_introduction(
        &self,
        connection: &mut Connection,
        message: &[u8],
    ) -> Result<Vec<u8>, IntakeError> {
        let introduction = Introduction::decode(message)?;
        if connection.entity().is_none() {
            connection.latch_entity(introduction.entity)?;
        }

        let wait_seconds = self.policy.throttle.wait_seconds(
            self.throttle.as_ref(),
            introduction.entity,
            Utc::now(),
            &self.logger,
        );
        let status = if introduction.version != self.policy.supported_version {
            IntroductionStatus::BadVersion
        } else if wait_seconds > 0 {
            IntroductionStatus::Wait
        } else {
            IntroductionStatus::GoAhead
        };
        let next_stage = if status == IntroductionStatus::GoAhead {
            Stage::Data
        } else {
            Stage::NoData
        };
        connection.set_stage(next_stage);

        self.logger.log(
            LogLevel::Debug,
            Some("intake::introduction"),
            "Introduction answered",
            Some(json!({
                "remote_addr": connection.remote_addr().to_string(),
                "entity": introduction.entity.to_string(),
                "version": introduction.version,
                "status": status.code(),
                "wait_seconds": wait_seconds,
                "next_stage": next_stage.as_str(),
            })),
        );

        let reply = IntroductionReply {
            status,
            wait_seconds: u16::try_from(wait_seconds).unwrap_or(u16::MAX),
        };
        Ok(reply.encode())
    }

    /// The connection leaves the data stage before anything else happens, so
    /// a connection gets at most one submission.
    pub fn handle_data(&self, connection: &mut Connection, message: &[u8]) -> Vec<u8> {
        connection.set_stage(Stage::NoData);
        self.accept_submission(connection, message).encode()
    }

    fn accept_submission(&self, connection: &Connection, message: &[u8]) -> DataReply {
        let remote_addr = connection.remote_addr().to_string();
        let raw: Value = match serde_json::from_slice(message) {
            Ok(raw) => raw,
            Err(error) => {
                self.logger.log(
                    LogLevel::Debug,
                    Some("intake::data"),
                    "Submission is not valid JSON",
                    Some(json!({ "remote_addr": remote_addr, "error": error.to_string() })),
                );
                return DataReply::BadContent;
            }
        };
        if !raw.is_object() {
            return DataReply::IllegalType;
        }

        let submission = match ReportSubmission::sanitize(&raw) {
            Ok(submission) => submission,
            Err(error) => {
                self.logger.log(
                    LogLevel::Debug,
                    Some("intake::data"),
                    "Submission failed sanitation",
                    Some(json!({ "remote_addr": remote_addr, "error": error.to_string() })),
                );
                return DataReply::BadContent;
            }
        };

        let Some(entity) = connection.entity() else {
            self.logger.log(
                LogLevel::Error,
                Some("intake::data"),
                "Data stage reached without a latched entity",
                Some(json!({ "remote_addr": remote_addr })),
            );
            return DataReply::InternalError;
        };

        if let Err(error) = self.throttle.record_submission(entity, Utc::now()) {
            self.logger.log(
                LogLevel::Error,
                Some("intake::throttle"),
                "Failed to record submission time",
                Some(json!({ "entity": entity.to_string(), "error": error.to_string() })),
            );
        }

        let body = match serde_json::to_vec(&submission) {
            Ok(body) => body,
            Err(error) => {
                self.logger.log(
                    LogLevel::Error,
                    Some("intake::data"),
                    "Failed to encode sanitized submission",
                    Some(json!({ "entity": entity.to_string(), "error": error.to_string() })),
                );
                return DataReply::InternalError;
            }
        };

        let spec = JobSpec::immediate(self.policy.submission_ttr_seconds);
        match self.producer.put(&spec, &body) {
            Ok(job_id) => {
                self.logger.log(
                    LogLevel::Info,
                    Some("intake::data"),
                    "Submission queued",
                    Some(json!({
                        "remote_addr": remote_addr,
                        "entity": entity.to_string(),
                        "job_id": job_id,
                        "bytes": body.len(),
                    })),
                );
                DataReply::Accepted
            }
            Err(error) => {
                self.logger.log(
                    LogLevel::Error,
                    Some("intake::queue"),
                    "Failed to queue submission",
                    Some(json!({
                        "remote_addr": remote_addr,
                        "entity": entity.to_string(),
                        "error": error.to_string(),
                        "disconnect": error.is_disconnect(),
                    })),
                );
                DataReply::InternalError
            }
        }
    }
}

fn skip_leading_whitespace(buffer: &mut Vec<u8>) {
    let leading = buffer
        .iter()
        .take_while(|byte| byte.is_ascii_whitespace())
        .count();
    if leading > 0 {
        buffer.drain(..leading);
    }
}

fn frame_json(buffer: &[u8]) -> JsonFrame {
    let mut values = serde_json::Deserializer::from_slice(buffer).into_iter::<IgnoredAny>();
    match values.next() {
        Some(Ok(_)) => JsonFrame::Complete(values.byte_offset()),
        Some(Err(error)) if error.is_eof() => JsonFrame::Incomplete,
        Some(Err(_)) => JsonFrame::Invalid,
        None => JsonFrame::Incomplete,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use serde_json::json;
    use uuid::Uuid;

    use crate::intake::{
        Connection, DataReply, Introduction, IntroductionReply, IntroductionStatus,
        ReportSubmission, Stage, NO_DATA_RESPONSE,
    };
    use crate::testing::{
        quiet_logger, sample_report_json, MemoryThrottleStore, RecordingProducer,
    };
    use crate::throttle::ThrottleStore;

    use super::{IntakeHandler, IntakePolicy};

    struct Fixture {
        throttle: Arc<MemoryThrottleStore>,
        producer: Arc<RecordingProducer>,
        handler: IntakeHandler,
    }

    fn fixture() -> Fixture {
        let throttle = Arc::new(MemoryThrottleStore::default());
        let producer = Arc::new(RecordingProducer::default());
        let handler = IntakeHandler::new(
            throttle.clone(),
            producer.clone(),
            IntakePolicy::default(),
            quiet_logger(),
        );
        Fixture {
            throttle,
            producer,
            handler,
        }
    }

    fn connection() -> Connection {
        Connection::new("127.0.0.1:50000".parse().expect("addr"))
    }

    fn introduce(
        handler: &IntakeHandler,
        connection: &mut Connection,
        version: i32,
        entity: Uuid,
    ) -> IntroductionReply {
        let message = Introduction { version, entity }.encode();
        let reply = handler
            .handle_introduction(connection, &message)
            .expect("introduction should be handled");
        IntroductionReply::decode(&reply).expect("reply should decode")
    }

    fn sample_bytes() -> Vec<u8> {
        serde_json::to_vec(&sample_report_json()).expect("serialize sample")
    }

    #[test]
    fn fresh_entity_goes_ahead() {
        let fixture = fixture();
        let mut connection = connection();
        let entity = Uuid::new_v4();

        let reply = introduce(&fixture.handler, &mut connection, 1, entity);

        assert_eq!(reply.status, IntroductionStatus::GoAhead);
        assert_eq!(reply.wait_seconds, 0);
        assert_eq!(connection.stage(), Stage::Data);
        assert_eq!(connection.entity(), Some(entity));
    }

    #[test]
    fn wrong_version_is_rejected_even_when_throttled() {
        let fixture = fixture();
        let entity = Uuid::new_v4();
        fixture
            .throttle
            .record_submission(entity, Utc::now())
            .expect("record");

        for version in [0, 2, -1, i32::MAX] {
            let mut connection = connection();
            let message = Introduction { version, entity }.encode();
            let reply = fixture
                .handler
                .handle_introduction(&mut connection, &message)
                .expect("introduction should be handled");

            assert_eq!(reply[0], IntroductionStatus::BadVersion.code());
            assert!(reply.ends_with(b"Bad version"));
            assert_eq!(connection.stage(), Stage::NoData);
        }
    }

    #[test]
    fn accepted_data_is_queued_and_ends_the_conversation() {
        let fixture = fixture();
        let mut connection = connection();
        let entity = Uuid::new_v4();
        introduce(&fixture.handler, &mut connection, 1, entity);

        let reply = fixture.handler.handle_data(&mut connection, &sample_bytes());
        assert_eq!(reply, DataReply::Accepted.encode());
        assert_eq!(connection.stage(), Stage::NoData);

        let jobs = fixture.producer.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].0.priority, 0);
        assert_eq!(jobs[0].0.delay_seconds, 0);
        assert_eq!(jobs[0].0.ttr_seconds, 300);
        let queued: ReportSubmission = serde_json::from_slice(&jobs[0].1).expect("canonical body");
        assert_eq!(
            queued,
            ReportSubmission::sanitize(&sample_report_json()).expect("sample")
        );
        assert!(fixture.throttle.recorded(entity).is_some());

        let mut inbound = sample_bytes();
        let second = fixture
            .handler
            .drain_inbound(&mut connection, &mut inbound)
            .expect("no-data message should be handled");
        assert_eq!(second, vec![NO_DATA_RESPONSE.to_vec()]);
        assert!(inbound.is_empty());
        assert_eq!(fixture.producer.jobs().len(), 1);
        assert_eq!(fixture.throttle.writes(), 1);
    }

    #[test]
    fn repeat_entity_within_window_must_wait() {
        let fixture = fixture();
        let entity = Uuid::new_v4();

        let mut first = connection();
        introduce(&fixture.handler, &mut first, 1, entity);
        fixture.handler.handle_data(&mut first, &sample_bytes());

        let mut second = Connection::new("127.0.0.1:50001".parse().expect("addr"));
        let reply = introduce(&fixture.handler, &mut second, 1, entity);

        assert_eq!(reply.status, IntroductionStatus::Wait);
        assert!(reply.wait_seconds > 0);
        assert!(reply.wait_seconds <= 1_800);
        assert_eq!(second.stage(), Stage::NoData);
    }

    #[test]
    fn old_submission_no_longer_throttles() {
        let fixture = fixture();
        let entity = Uuid::new_v4();
        fixture
            .throttle
            .record_submission(entity, Utc::now() - Duration::seconds(1_801))
            .expect("record");

        let mut connection = connection();
        let reply = introduce(&fixture.handler, &mut connection, 1, entity);
        assert_eq!(reply.status, IntroductionStatus::GoAhead);
    }

    #[test]
    fn throttle_lookup_failure_forces_a_wait() {
        let fixture = fixture();
        fixture.throttle.fail_lookups(true);

        let mut connection = connection();
        let reply = introduce(&fixture.handler, &mut connection, 1, Uuid::new_v4());

        assert_eq!(reply.status, IntroductionStatus::Wait);
        assert_eq!(reply.wait_seconds, 60);
        assert_eq!(connection.stage(), Stage::NoData);
    }

    #[test]
    fn invalid_json_is_bad_content() {
        let fixture = fixture();
        let mut connection = connection();
        introduce(&fixture.handler, &mut connection, 1, Uuid::new_v4());

        let reply = fixture.handler.handle_data(&mut connection, b"{not json");
        assert_eq!(reply, DataReply::BadContent.encode());
        assert_eq!(connection.stage(), Stage::NoData);
        assert!(fixture.producer.jobs().is_empty());
        assert_eq!(fixture.throttle.writes(), 0);
    }

    #[test]
    fn non_object_json_is_an_illegal_type() {
        let fixture = fixture();
        let mut connection = connection();
        introduce(&fixture.handler, &mut connection, 1, Uuid::new_v4());

        let reply = fixture.handler.handle_data(&mut connection, b"[1,2,3]");
        assert_eq!(reply, DataReply::IllegalType.encode());
    }

    #[test]
    fn unsanitary_object_is_bad_content() {
        let fixture = fixture();
        let mut connection = connection();
        introduce(&fixture.handler, &mut connection, 1, Uuid::new_v4());

        let body = serde_json::to_vec(&json!({"system": {}})).expect("serialize");
        let reply = fixture.handler.handle_data(&mut connection, &body);
        assert_eq!(reply, DataReply::BadContent.encode());
        assert!(fixture.producer.jobs().is_empty());
    }

    #[test]
    fn queue_failure_is_an_internal_error() {
        let fixture = fixture();
        fixture.producer.fail(true);
        let mut connection = connection();
        let entity = Uuid::new_v4();
        introduce(&fixture.handler, &mut connection, 1, entity);

        let reply = fixture.handler.handle_data(&mut connection, &sample_bytes());
        assert_eq!(reply, DataReply::InternalError.encode());
        assert!(fixture.throttle.recorded(entity).is_some());
    }

    #[test]
    fn throttle_write_failure_still_queues() {
        let fixture = fixture();
        fixture.throttle.fail_writes(true);
        let mut connection = connection();
        introduce(&fixture.handler, &mut connection, 1, Uuid::new_v4());

        let reply = fixture.handler.handle_data(&mut connection, &sample_bytes());
        assert_eq!(reply, DataReply::Accepted.encode());
        assert_eq!(fixture.producer.jobs().len(), 1);
    }

    #[test]
    fn framing_waits_for_complete_messages() {
        let fixture = fixture();
        let mut connection = connection();
        let introduction = Introduction {
            version: 1,
            entity: Uuid::new_v4(),
        }
        .encode();
        let body = sample_bytes();

        let mut inbound = introduction[..7].to_vec();
        let replies = fixture
            .handler
            .drain_inbound(&mut connection, &mut inbound)
            .expect("drain");
        assert!(replies.is_empty());
        assert_eq!(inbound.len(), 7);

        inbound.extend_from_slice(&introduction[7..]);
        inbound.extend_from_slice(&body[..10]);
        let replies = fixture
            .handler
            .drain_inbound(&mut connection, &mut inbound)
            .expect("drain");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0], vec![0, 0, 0]);
        assert_eq!(inbound, body[..10].to_vec());

        inbound.extend_from_slice(&body[10..]);
        inbound.extend_from_slice(b"\r\n");
        let replies = fixture
            .handler
            .drain_inbound(&mut connection, &mut inbound)
            .expect("drain");
        assert_eq!(replies, vec![DataReply::Accepted.encode()]);
        assert!(inbound.is_empty());

        inbound.extend_from_slice(b"anything");
        let replies = fixture
            .handler
            .drain_inbound(&mut connection, &mut inbound)
            .expect("drain");
        assert_eq!(replies, vec![NO_DATA_RESPONSE.to_vec()]);
    }

    #[test]
    fn malformed_data_is_answered_without_waiting() {
        let fixture = fixture();
        let mut connection = connection();
        introduce(&fixture.handler, &mut connection, 1, Uuid::new_v4());

        let mut inbound = b"hello there".to_vec();
        let replies = fixture
            .handler
            .drain_inbound(&mut connection, &mut inbound)
            .expect("drain");
        assert_eq!(replies, vec![DataReply::BadContent.encode()]);
        assert!(inbound.is_empty());
    }

    #[test]
    fn oversized_partial_message_is_bad_content() {
        let throttle = Arc::new(MemoryThrottleStore::default());
        let producer = Arc::new(RecordingProducer::default());
        let handler = IntakeHandler::new(
            throttle,
            producer,
            IntakePolicy {
                max_message_size_bytes: 16,
                ..IntakePolicy::default()
            },
            quiet_logger(),
        );
        let mut connection = connection();
        introduce(&handler, &mut connection, 1, Uuid::new_v4());

        let mut inbound = br#"{"system": {"java": "1.8.0_402""#.to_vec();
        let replies = handler
            .drain_inbound(&mut connection, &mut inbound)
            .expect("drain");
        assert_eq!(replies, vec![DataReply::BadContent.encode()]);
        assert_eq!(connection.stage(), Stage::NoData);
    }
}
