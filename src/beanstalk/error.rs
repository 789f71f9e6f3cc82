use std::fmt;
use std::io;

#[derive(Debug)]
pub enum QueueError {
    NotConnected,
    Connect {
        address: String,
        source: io::Error,
    },
    Io(io::Error),
    ConnectionClosed,
    Timeout {
        idle_polls: u32,
    },
    Protocol {
        command: &'static str,
        response: String,
    },
    Encoding {
        line: Vec<u8>,
    },
    /// A header was accepted but its body could not be framed.
    Desync {
        command: &'static str,
        response: String,
    },
}

impl QueueError {
    /// Transport-class failures leave the connection unusable: the stream is
    /// gone or out of sync with the broker's responses.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::NotConnected
                | Self::Connect { .. }
                | Self::Io(_)
                | Self::ConnectionClosed
                | Self::Timeout { .. }
                | Self::Desync { .. }
        )
    }

    /// Reclassifies a protocol error raised after a body-carrying header as
    /// a desync of the stream.
    pub(crate) fn into_desync(self) -> Self {
        match self {
            Self::Protocol { command, response } => Self::Desync { command, response },
            other => other,
        }
    }
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "queue connection is not connected"),
            Self::Connect { address, source } => {
                write!(f, "failed to connect to queue broker at {address}: {source}")
            }
            Self::Io(source) => write!(f, "queue connection I/O error: {source}"),
            Self::ConnectionClosed => write!(f, "queue broker closed the connection"),
            Self::Timeout { idle_polls } => write!(
                f,
                "no data received from queue broker after {idle_polls} empty reads"
            ),
            Self::Protocol { command, response } => {
                write!(f, "unexpected broker response to '{command}': {response}")
            }
            Self::Encoding { line } => write!(
                f,
                "broker response line is not valid UTF-8 ({} bytes)",
                line.len()
            ),
            Self::Desync { command, response } => write!(
                f,
                "broker response to '{command}' announced an unreadable body: {response}"
            ),
        }
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connect { source, .. } | Self::Io(source) => Some(source),
            _ => None,
        }
    }
}
