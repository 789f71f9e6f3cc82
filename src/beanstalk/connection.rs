use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::thread;
use std::time::Duration;

use super::QueueError;

pub const DEFAULT_READ_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_MAX_IDLE_POLLS: u32 = 1_000;

const READ_CHUNK_SIZE: usize = 4096;
const LINE_TERMINATOR: &[u8] = b"\r\n";

/// Byte-stream transport underneath a [`QueueConnection`].
pub trait ByteStream: Read + Write + Send {
    fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ByteStream for TcpStream {
    fn shutdown(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub read_poll_interval: Duration,
    pub max_idle_polls: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            read_poll_interval: Duration::from_millis(DEFAULT_READ_POLL_INTERVAL_MS),
            max_idle_polls: DEFAULT_MAX_IDLE_POLLS,
        }
    }
}

/// Raw broker transport.
///
/// Control lines and job bodies share one unframed stream, so whatever a read
/// pulls in past the current line or body is kept in `pending` and served to
/// the next `read_line`/`read_bytes` call.
pub struct QueueConnection {
    stream: Option<Box<dyn ByteStream>>,
    pending: Vec<u8>,
    settings: ConnectionSettings,
    native_read_timeout: bool,
}

impl QueueConnection {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self {
            stream: None,
            pending: Vec::new(),
            settings,
            native_read_timeout: false,
        }
    }

    #[cfg(test)]
    pub fn from_stream(stream: Box<dyn ByteStream>, settings: ConnectionSettings) -> Self {
        Self {
            stream: Some(stream),
            pending: Vec::new(),
            settings,
            native_read_timeout: false,
        }
    }

    pub fn connect(&mut self, host: &str, port: u16) -> Result<(), QueueError> {
        self.close();

        let address = format!("{host}:{port}");
        let stream = TcpStream::connect(&address).map_err(|source| QueueError::Connect {
            address: address.clone(),
            source,
        })?;
        stream.set_nodelay(true).map_err(QueueError::Io)?;
        stream
            .set_read_timeout(Some(self.settings.read_poll_interval))
            .map_err(QueueError::Io)?;

        self.stream = Some(Box::new(stream));
        self.native_read_timeout = true;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    #[cfg(test)]
    pub fn buffered_len(&self) -> usize {
        self.pending.len()
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), QueueError> {
        let stream = self.stream.as_mut().ok_or(QueueError::NotConnected)?;
        stream.write_all(bytes).map_err(QueueError::Io)?;
        stream.flush().map_err(QueueError::Io)
    }

    /// Returns the next non-empty CRLF-terminated line, terminator excluded.
    ///
    /// Blank lines are dropped: they are the CRLF that trails a job body
    /// which `read_bytes` deliberately leaves in the buffer.
    pub fn read_line(&mut self) -> Result<String, QueueError> {
        let mut scanned = 0;
        loop {
            if let Some(offset) = find_terminator(&self.pending[scanned..]) {
                let end = scanned + offset;
                let line: Vec<u8> = self
                    .pending
                    .drain(..end + LINE_TERMINATOR.len())
                    .take(end)
                    .collect();
                scanned = 0;

                let text = String::from_utf8(line).map_err(|error| QueueError::Encoding {
                    line: error.into_bytes(),
                })?;
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    continue;
                }
                return Ok(trimmed.to_owned());
            }

            // A trailing '\r' may pair with a '\n' from the next read.
            scanned = self.pending.len().saturating_sub(1);
            self.fill()?;
        }
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>, QueueError> {
        while self.pending.len() < count {
            self.fill()?;
        }

        let surplus = self.pending.split_off(count);
        Ok(std::mem::replace(&mut self.pending, surplus))
    }

    pub fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown();
        }
        self.pending = Vec::new();
    }

    fn fill(&mut self) -> Result<usize, QueueError> {
        let mut chunk = [0_u8; READ_CHUNK_SIZE];
        let mut idle_polls = 0_u32;

        loop {
            let stream = self.stream.as_mut().ok_or(QueueError::NotConnected)?;
            match stream.read(&mut chunk) {
                Ok(0) => return Err(QueueError::ConnectionClosed),
                Ok(size) => {
                    self.pending.extend_from_slice(&chunk[..size]);
                    return Ok(size);
                }
                Err(error)
                    if matches!(
                        error.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    idle_polls += 1;
                    if idle_polls >= self.settings.max_idle_polls {
                        return Err(QueueError::Timeout { idle_polls });
                    }
                    // TCP streams already waited out the socket read timeout.
                    if !self.native_read_timeout {
                        thread::sleep(self.settings.read_poll_interval);
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(QueueError::Io(error)),
            }
        }
    }
}

impl Drop for QueueConnection {
    fn drop(&mut self) {
        self.close();
    }
}

fn find_terminator(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(LINE_TERMINATOR.len())
        .position(|window| window == LINE_TERMINATOR)
}
