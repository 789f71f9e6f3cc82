use std::fmt;

use uuid::Uuid;

#[derive(Debug)]
pub enum IntakeError {
    MalformedIntroduction { size: usize },
    EntityAlreadyLatched { current: Uuid, attempted: Uuid },
}

impl fmt::Display for IntakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedIntroduction { size } => write!(
                f,
                "introduction must be exactly 20 bytes, received {size}"
            ),
            Self::EntityAlreadyLatched { current, attempted } => write!(
                f,
                "connection already reports for entity {current}; refusing to switch to {attempted}"
            ),
        }
    }
}

impl std::error::Error for IntakeError {}
