use super::connection::{ConnectionSettings, QueueConnection};
use super::job::{Job, JobSpec, DEFAULT_TUBE};
use super::QueueError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientSettings {
    pub host: String,
    pub port: u16,
    pub tube: Option<String>,
    pub connection: ConnectionSettings,
}

impl ClientSettings {
    pub fn new(host: impl Into<String>, port: u16, tube: Option<String>) -> Self {
        Self {
            host: host.into(),
            port,
            tube,
            connection: ConnectionSettings::default(),
        }
    }
}

/// Broker client speaking the beanstalkd text protocol.
///
/// Connects on first use. When a tube is configured the client switches to it
/// (`use`, `watch`, `ignore default`) before running the caller's command.
/// Any transport-level failure reaps the client: its connection is dropped
/// and owners must discard it instead of reusing it.
pub struct QueueClient {
    settings: ClientSettings,
    connection: Option<QueueConnection>,
    reap: bool,
}

impl QueueClient {
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            settings,
            connection: None,
            reap: false,
        }
    }

    /// Wraps an already-established connection; no tube setup is issued.
    #[cfg(test)]
    pub fn from_connection(connection: QueueConnection, settings: ClientSettings) -> Self {
        Self {
            settings,
            connection: Some(connection),
            reap: false,
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .map(QueueConnection::is_open)
            .unwrap_or(false)
    }

    pub fn is_reaped(&self) -> bool {
        self.reap
    }

    pub fn put(&mut self, spec: &JobSpec, data: &[u8]) -> Result<u64, QueueError> {
        self.execute(|connection| {
            let header = format!(
                "put {} {} {} {}\r\n",
                spec.priority,
                spec.delay_seconds,
                spec.ttr_seconds,
                data.len()
            );
            let mut request = Vec::with_capacity(header.len() + data.len() + 2);
            request.extend_from_slice(header.as_bytes());
            request.extend_from_slice(data);
            request.extend_from_slice(b"\r\n");

            let line = round_trip(connection, &request)?;
            expect_token(&line, "INSERTED", "put")?;
            parse_u64_field(&line, 1, "put")
        })
    }

    /// `None` blocks until a job is ready; `Some(seconds)` gives up after the
    /// timeout and returns `Ok(None)`.
    pub fn reserve(&mut self, timeout_seconds: Option<u32>) -> Result<Option<Job>, QueueError> {
        self.execute(|connection| {
            let (command, request) = match timeout_seconds {
                Some(seconds) => (
                    "reserve-with-timeout",
                    format!("reserve-with-timeout {seconds}\r\n"),
                ),
                None => ("reserve", "reserve\r\n".to_owned()),
            };

            let line = round_trip(connection, request.as_bytes())?;
            if first_token(&line) == Some("TIMED_OUT") {
                return Ok(None);
            }
            expect_token(&line, "RESERVED", command)?;

            let id = parse_u64_field(&line, 1, command).map_err(QueueError::into_desync)?;
            let size = body_size(&line, 2, command)?;
            let data = connection.read_bytes(size)?;
            Ok(Some(Job { id, data }))
        })
    }

    pub fn delete(&mut self, id: u64) -> Result<(), QueueError> {
        self.simple_command("delete", format!("delete {id}\r\n"), "DELETED")
    }

    pub fn release(&mut self, id: u64, priority: u32, delay_seconds: u32) -> Result<(), QueueError> {
        self.simple_command(
            "release",
            format!("release {id} {priority} {delay_seconds}\r\n"),
            "RELEASED",
        )
    }

    pub fn bury(&mut self, id: u64, priority: u32) -> Result<(), QueueError> {
        self.simple_command("bury", format!("bury {id} {priority}\r\n"), "BURIED")
    }

    pub fn use_tube(&mut self, tube: &str) -> Result<(), QueueError> {
        self.execute(|connection| use_tube(connection, tube))
    }

    pub fn watch_tube(&mut self, tube: &str) -> Result<u64, QueueError> {
        self.execute(|connection| watch_tube(connection, tube))
    }

    pub fn ignore_tube(&mut self, tube: &str) -> Result<u64, QueueError> {
        self.execute(|connection| ignore_tube(connection, tube))
    }

    /// Returns the broker's YAML statistics document for `tube`.
    pub fn stats_tube(&mut self, tube: &str) -> Result<String, QueueError> {
        self.execute(|connection| {
            let line = round_trip(connection, format!("stats-tube {tube}\r\n").as_bytes())?;
            expect_token(&line, "OK", "stats-tube")?;
            let size = body_size(&line, 1, "stats-tube")?;
            let body = connection.read_bytes(size)?;
            Ok(String::from_utf8_lossy(&body).into_owned())
        })
    }

    pub fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
    }

    fn simple_command(
        &mut self,
        command: &'static str,
        request: String,
        expected: &'static str,
    ) -> Result<(), QueueError> {
        self.execute(|connection| {
            let line = round_trip(connection, request.as_bytes())?;
            expect_token(&line, expected, command)
        })
    }

    fn execute<T>(
        &mut self,
        operation: impl FnOnce(&mut QueueConnection) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        let result = match self.connection() {
            Ok(connection) => operation(connection),
            Err(error) => Err(error),
        };

        if let Err(error) = &result {
            if error.is_disconnect() {
                self.reap = true;
                self.close();
            }
        }
        result
    }

    fn connection(&mut self) -> Result<&mut QueueConnection, QueueError> {
        if self.connection.is_none() {
            let mut connection = QueueConnection::new(self.settings.connection);
            connection.connect(&self.settings.host, self.settings.port)?;
            self.connection = Some(connection);

            if let Some(tube) = self.settings.tube.clone() {
                if let Err(error) = self.switch_to_tube(&tube) {
                    self.close();
                    return Err(error);
                }
            }
        }
        self.connection.as_mut().ok_or(QueueError::NotConnected)
    }

    fn switch_to_tube(&mut self, tube: &str) -> Result<(), QueueError> {
        self.use_tube(tube)?;
        self.watch_tube(tube)?;
        if tube != DEFAULT_TUBE {
            self.ignore_tube(DEFAULT_TUBE)?;
        }
        Ok(())
    }
}

impl Drop for QueueClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn use_tube(connection: &mut QueueConnection, tube: &str) -> Result<(), QueueError> {
    let line = round_trip(connection, format!("use {tube}\r\n").as_bytes())?;
    expect_token(&line, "USING", "use")
}

fn watch_tube(connection: &mut QueueConnection, tube: &str) -> Result<u64, QueueError> {
    let line = round_trip(connection, format!("watch {tube}\r\n").as_bytes())?;
    expect_token(&line, "WATCHING", "watch")?;
    parse_u64_field(&line, 1, "watch")
}

fn ignore_tube(connection: &mut QueueConnection, tube: &str) -> Result<u64, QueueError> {
    let line = round_trip(connection, format!("ignore {tube}\r\n").as_bytes())?;
    expect_token(&line, "WATCHING", "ignore")?;
    parse_u64_field(&line, 1, "ignore")
}

fn round_trip(connection: &mut QueueConnection, request: &[u8]) -> Result<String, QueueError> {
    connection.write(request)?;
    connection.read_line()
}

fn first_token(line: &str) -> Option<&str> {
    line.split_whitespace().next()
}

fn expect_token(line: &str, expected: &str, command: &'static str) -> Result<(), QueueError> {
    if first_token(line) == Some(expected) {
        return Ok(());
    }
    Err(QueueError::Protocol {
        command,
        response: line.to_owned(),
    })
}

/// Size of the body announced by an accepted header. The body is already on
/// the wire, so a bad size leaves the stream out of sync.
fn body_size(line: &str, index: usize, command: &'static str) -> Result<usize, QueueError> {
    parse_u64_field(line, index, command)
        .and_then(|size| {
            usize::try_from(size).map_err(|_| QueueError::Protocol {
                command,
                response: line.to_owned(),
            })
        })
        .map_err(QueueError::into_desync)
}

fn parse_u64_field(line: &str, index: usize, command: &'static str) -> Result<u64, QueueError> {
    line.split_whitespace()
        .nth(index)
        .and_then(|field| field.parse::<u64>().ok())
        .ok_or_else(|| QueueError::Protocol {
            command,
            response: line.to_owned(),
        })
}
