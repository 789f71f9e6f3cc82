pub const DEFAULT_TUBE: &str = "default";

/// Scheduling parameters attached to a job when it is put.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobSpec {
    /// 0 is most urgent.
    pub priority: u32,
    pub delay_seconds: u32,
    /// Seconds a reserving client has before the broker releases the job again.
    pub ttr_seconds: u32,
}

impl JobSpec {
    pub fn immediate(ttr_seconds: u32) -> Self {
        Self {
            priority: 0,
            delay_seconds: 0,
            ttr_seconds,
        }
    }
}

/// A reserved job. It stays owned by the reserving client until it is
/// deleted, released or buried, or until its TTR runs out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Job {
    pub id: u64,
    pub data: Vec<u8>,
}
