use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::protocol::Stage;
use super::IntakeError;

/// Protocol state of one client socket.
#[derive(Debug)]
pub struct Connection {
    remote_addr: SocketAddr,
    stage: Stage,
    entity: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl Connection {
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            stage: Stage::Introduction,
            entity: None,
            created_at: Utc::now(),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn set_stage(&mut self, stage: Stage) {
        self.stage = stage;
    }

    pub fn entity(&self) -> Option<Uuid> {
        self.entity
    }

    /// Binds the connection to a reporting entity. The binding is permanent.
    pub fn latch_entity(&mut self, entity: Uuid) -> Result<(), IntakeError> {
        if let Some(current) = self.entity {
            return Err(IntakeError::EntityAlreadyLatched {
                current,
                attempted: entity,
            });
        }
        self.entity = Some(entity);
        Ok(())
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
